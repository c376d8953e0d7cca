/*!
 * Admission Controller
 * Single-session pairing policy and connection state machine
 */

use std::sync::Arc;
use std::time::Duration;

use dbus::channel::Sender;
use dbus::message::Message;
use dbus::nonblock::SyncConnection;
use tokio::sync::{mpsc, RwLock};

use crate::bluetooth::{
    address_from_path, connected_devices, find_adapter_path, Device, DeviceRegistry,
    ADAPTER_IFACE, BLUEZ_SERVICE, DEVICE_IFACE,
};
use crate::bus::Bus;
use crate::config::BluetoothConfig;
use crate::error::{DaemonError, Result};

pub const AGENT_PATH: &str = "/corsac/agent";
const AGENT_IFACE: &str = "org.bluez.Agent1";
const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
const CAPABILITY: &str = "NoInputNoOutput";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAuthorization,
    Active,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingAuthorization => "awaiting-authorization",
            SessionState::Active => "active",
        }
    }
}

/// The one session this process manages. Owned by the admission
/// controller; other components read eventually-consistent copies.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    pub device: Option<Device>,
    pub authorized_services: u32,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            device: None,
            authorized_services: 0,
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.device = None;
        self.authorized_services = 0;
    }
}

/// First come, first served: one device may pair and hold the session;
/// everyone else is refused until it disconnects. Not necessarily the
/// "bluetooth way", but the only sensible policy for a head unit with a
/// single audio path.
fn evaluate(
    session: &mut Session,
    allowed_services: &[String],
    address: &str,
    service: Option<&str>,
) -> bool {
    if let Some(uuid) = service {
        if !allowed_services
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(uuid))
        {
            tracing::info!("Rejecting service {} from {}: not in allow-set", uuid, address);
            return false;
        }
    }

    match (&session.state, &session.device) {
        (SessionState::Idle, _) => {
            session.state = SessionState::AwaitingAuthorization;
            session.device = Some(Device {
                address: address.to_string(),
                name: String::new(),
                paired: false,
                connected: false,
            });
            session.authorized_services = 1;
            true
        }
        (_, Some(holder)) if holder.address == address => {
            session.authorized_services += 1;
            true
        }
        (state, holder) => {
            tracing::info!(
                "Rejecting {}: session {} held by {:?}",
                address,
                state.as_str(),
                holder.as_ref().map(|d| d.address.as_str())
            );
            false
        }
    }
}

pub struct AdmissionController {
    bus: Arc<Bus>,
    config: BluetoothConfig,
    session: Arc<RwLock<Session>>,
    adapter_path: RwLock<Option<String>>,
    /// Address of the device that last held an active session; a
    /// reconnect by the same phone skips the authorization wait.
    last_active: RwLock<Option<String>>,
}

impl AdmissionController {
    pub fn new(bus: Arc<Bus>, config: BluetoothConfig, session: Arc<RwLock<Session>>) -> Self {
        Self {
            bus,
            config,
            session,
            adapter_path: RwLock::new(None),
            last_active: RwLock::new(None),
        }
    }

    /// Bring the adapter up, register our agent as the default and start
    /// receiving its method calls. Any failure here is fatal to startup:
    /// without an agent nothing can ever pair.
    pub async fn initialize(&self) -> Result<mpsc::UnboundedReceiver<Message>> {
        let objects = self.bus.managed_objects(BLUEZ_SERVICE).await?;
        let adapter = find_adapter_path(&objects).ok_or(DaemonError::AdapterNotFound)?;
        tracing::info!("Using bluetooth adapter {}", adapter);

        for property in ["Powered", "Pairable"] {
            self.bus
                .set_bool(BLUEZ_SERVICE, &adapter, ADAPTER_IFACE, property, true)
                .await?;
        }
        self.bus
            .set_bool(
                BLUEZ_SERVICE,
                &adapter,
                ADAPTER_IFACE,
                "Discoverable",
                self.config.discoverable,
            )
            .await?;
        *self.adapter_path.write().await = Some(adapter);

        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.receive_method_calls(AGENT_PATH, move |msg, _conn| {
            let _ = tx.send(msg);
        });

        let manager = self.bus.proxy(BLUEZ_SERVICE, "/org/bluez");
        let () = manager
            .method_call(
                AGENT_MANAGER_IFACE,
                "RegisterAgent",
                (dbus::Path::from(AGENT_PATH), CAPABILITY),
            )
            .await?;
        let () = manager
            .method_call(
                AGENT_MANAGER_IFACE,
                "RequestDefaultAgent",
                (dbus::Path::from(AGENT_PATH),),
            )
            .await?;
        tracing::info!("Agent registered");

        Ok(rx)
    }

    /// Serve agent method calls one at a time. A single consumer is what
    /// serializes concurrent pairing attempts.
    pub async fn run_agent(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Message>) {
        let conn = self.bus.connection();
        while let Some(msg) = rx.recv().await {
            if msg.interface().as_deref() != Some(AGENT_IFACE) {
                continue;
            }
            match msg.member().as_deref() {
                Some("AuthorizeService") => {
                    if let Ok((device, uuid)) = msg.read2::<dbus::Path, String>() {
                        let allowed = self.authorize(&device, Some(&uuid)).await;
                        tracing::info!(
                            "AuthorizeService({}, {}) -> {}",
                            device,
                            uuid,
                            if allowed { "accept" } else { "reject" }
                        );
                        self.reply(&conn, &msg, allowed);
                    }
                }
                Some("RequestAuthorization") => {
                    if let Ok(device) = msg.read1::<dbus::Path>() {
                        let allowed = self.authorize(&device, None).await;
                        tracing::info!(
                            "RequestAuthorization({}) -> {}",
                            device,
                            if allowed { "accept" } else { "reject" }
                        );
                        self.reply(&conn, &msg, allowed);
                    }
                }
                Some("Cancel") => {
                    tracing::info!("Pairing cancelled by remote");
                    let _ = conn.send(msg.method_return());
                }
                Some("Release") => {
                    tracing::info!("Agent released");
                    let _ = conn.send(msg.method_return());
                }
                other => {
                    tracing::debug!("Unhandled agent call: {:?}", other);
                    let _ = conn.send(msg.error(
                        &"org.freedesktop.DBus.Error.UnknownMethod".into(),
                        c"Unknown method",
                    ));
                }
            }
        }
    }

    async fn authorize(&self, device_path: &dbus::Path<'_>, service: Option<&str>) -> bool {
        let Some(address) = address_from_path(device_path) else {
            tracing::debug!("Agent call for non-device path {}", device_path);
            return false;
        };

        let (accepted, newly_admitted) = {
            let mut session = self.session.write().await;
            let was_idle = session.state == SessionState::Idle;
            let ok = evaluate(&mut session, &self.config.allowed_services, &address, service);
            (ok, ok && was_idle)
        };

        // First acceptance: trust the device so later reconnects bypass
        // the agent entirely.
        if newly_admitted {
            if let Err(e) = self
                .bus
                .set_bool(BLUEZ_SERVICE, device_path, DEVICE_IFACE, "Trusted", true)
                .await
            {
                tracing::debug!("Could not mark {} trusted: {}", device_path, e);
            }
        }
        accepted
    }

    fn reply(&self, conn: &Arc<SyncConnection>, msg: &Message, allowed: bool) {
        if allowed {
            let _ = conn.send(msg.method_return());
        } else {
            let _ = conn.send(msg.error(&"org.bluez.Error.Rejected".into(), c"Rejected"));
        }
    }

    /// Block until exactly one connected device is observed, then promote
    /// the session to Active. A device we have not hosted before must also
    /// clear service authorization first; that wait is the slower poll.
    /// The deadline covers both phases.
    pub async fn await_connection(&self) -> Result<Device> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.connect_timeout_secs);
        let connect_poll = Duration::from_millis(self.config.connect_poll_ms);
        let authorize_poll = Duration::from_millis(self.config.authorize_poll_ms);

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(DaemonError::ConnectionTimeout);
            }

            let objects = self.bus.managed_objects(BLUEZ_SERVICE).await?;
            let mut connected = connected_devices(&objects);
            if connected.len() == 1 {
                let (_, device) = connected.remove(0);

                let known = self
                    .last_active
                    .read()
                    .await
                    .as_deref()
                    .map(|addr| addr == device.address)
                    .unwrap_or(false);

                if !known {
                    // The remote keeps requesting services for a little
                    // while after Connected flips; declaring the session
                    // ready too early cuts that short.
                    while self.session.read().await.authorized_services == 0 {
                        if tokio::time::Instant::now() >= deadline {
                            return Err(DaemonError::ConnectionTimeout);
                        }
                        tracing::debug!(
                            "Waiting for service authorization from {}",
                            device.address
                        );
                        tokio::time::sleep(authorize_poll).await;
                    }
                }

                {
                    let mut session = self.session.write().await;
                    session.state = SessionState::Active;
                    session.device = Some(device.clone());
                }
                *self.last_active.write().await = Some(device.address.clone());
                self.set_discoverable(false).await;

                tracing::info!("Session active: {} ({})", device.name, device.address);
                return Ok(device);
            }

            if connected.len() > 1 {
                tracing::debug!("{} devices connected, waiting for one", connected.len());
            }
            tokio::time::sleep(connect_poll).await;
        }
    }

    /// Router callback for a Device1 Connected=false transition. Ends the
    /// session when the disconnecting device holds it; returns whether it
    /// did.
    pub async fn handle_device_disconnected(&self, address: &str) -> bool {
        let ended = {
            let mut session = self.session.write().await;
            let holds = session
                .device
                .as_ref()
                .map(|d| d.address == address)
                .unwrap_or(false);
            if holds {
                session.reset();
            }
            holds
        };

        if ended {
            tracing::info!("Session device {} disconnected", address);
            self.set_discoverable(true).await;
        }
        ended
    }

    /// Show or hide the adapter. Honors the configuration: a unit set
    /// non-discoverable stays hidden.
    async fn set_discoverable(&self, on: bool) {
        if on && !self.config.discoverable {
            return;
        }
        let Some(adapter) = self.adapter_path.read().await.clone() else {
            return;
        };
        tracing::info!(
            "{} adapter to remote devices",
            if on { "Showing" } else { "Hiding" }
        );
        if let Err(e) = self
            .bus
            .set_bool(BLUEZ_SERVICE, &adapter, ADAPTER_IFACE, "Discoverable", on)
            .await
        {
            tracing::warn!("Could not toggle discoverability: {}", e);
        }
    }

    /// Best-effort disconnect of every device still connected. Used at
    /// shutdown; individual failures never abort the loop.
    pub async fn disconnect_all(&self, registry: &DeviceRegistry) {
        let targets = match self.bus.managed_objects(BLUEZ_SERVICE).await {
            Ok(objects) => connected_devices(&objects),
            Err(e) => {
                tracing::warn!("Enumeration failed during shutdown: {}; using registry", e);
                registry.connected().await
            }
        };

        for (path, device) in targets {
            tracing::info!("Disconnecting {} ({})", device.name, device.address);
            if let Err(e) = self
                .bus
                .call(BLUEZ_SERVICE, &path, DEVICE_IFACE, "Disconnect")
                .await
            {
                tracing::warn!("Disconnect of {} failed: {}", device.address, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{A2DP_UUID, AVRCP_UUID};

    fn allowed() -> Vec<String> {
        vec![A2DP_UUID.to_string(), AVRCP_UUID.to_string()]
    }

    #[test]
    fn first_device_is_admitted() {
        let mut session = Session::new();
        assert!(evaluate(
            &mut session,
            &allowed(),
            "AA:AA:AA:AA:AA:AA",
            Some(A2DP_UUID)
        ));
        assert_eq!(session.state, SessionState::AwaitingAuthorization);
        assert_eq!(session.authorized_services, 1);
    }

    #[test]
    fn second_device_is_rejected_while_active() {
        let mut session = Session::new();
        assert!(evaluate(&mut session, &allowed(), "AA:AA:AA:AA:AA:AA", None));
        session.state = SessionState::Active;

        assert!(!evaluate(&mut session, &allowed(), "BB:BB:BB:BB:BB:BB", None));
        assert_eq!(
            session.device.as_ref().unwrap().address,
            "AA:AA:AA:AA:AA:AA"
        );
        assert_eq!(session.state, SessionState::Active);
    }

    #[test]
    fn holder_may_authorize_more_services() {
        let mut session = Session::new();
        assert!(evaluate(
            &mut session,
            &allowed(),
            "AA:AA:AA:AA:AA:AA",
            Some(A2DP_UUID)
        ));
        assert!(evaluate(
            &mut session,
            &allowed(),
            "AA:AA:AA:AA:AA:AA",
            Some(AVRCP_UUID)
        ));
        assert_eq!(session.authorized_services, 2);
    }

    #[test]
    fn service_outside_allow_set_is_rejected() {
        let mut session = Session::new();
        // Message Access Profile is not an audio service.
        assert!(!evaluate(
            &mut session,
            &allowed(),
            "AA:AA:AA:AA:AA:AA",
            Some("00001132-0000-1000-8000-00805f9b34fb")
        ));
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.device.is_none());
    }

    #[test]
    fn allow_set_matching_ignores_case() {
        let mut session = Session::new();
        assert!(evaluate(
            &mut session,
            &allowed(),
            "AA:AA:AA:AA:AA:AA",
            Some("0000110D-0000-1000-8000-00805F9B34FB")
        ));
    }

    #[test]
    fn disconnect_resets_to_idle() {
        let mut session = Session::new();
        evaluate(&mut session, &allowed(), "AA:AA:AA:AA:AA:AA", None);
        session.state = SessionState::Active;
        session.reset();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.device.is_none());
        assert_eq!(session.authorized_services, 0);
    }
}
