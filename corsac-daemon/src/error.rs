/*!
 * Error Types
 * Domain error taxonomy for the session daemon
 */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    /// The system bus could not be reached at startup. Fatal: nothing
    /// works without it.
    #[error("system bus unavailable: {0}. Is dbus running?")]
    BusUnavailable(dbus::Error),

    /// No org.bluez.Adapter1 object on the bus.
    #[error("bluetooth adapter not found")]
    AdapterNotFound,

    /// A device lookup by address came up empty.
    #[error("bluetooth device not found: {0}")]
    DeviceNotFound(String),

    /// A remote method call or property access failed. Transient; callers
    /// log and skip rather than retry.
    #[error("remote call failed: {0}")]
    RemoteCall(#[from] dbus::Error),

    /// await_connection hit its deadline without observing a connected,
    /// authorized device.
    #[error("timed out waiting for a device connection")]
    ConnectionTimeout,

    /// A playback command was issued while no session is active.
    #[error("no active session")]
    NoActiveSession,
}
