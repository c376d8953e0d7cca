/*!
 * Playback Façade
 * AVRCP control of the current session's media player
 */

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bluetooth::admission::{Session, SessionState};
use crate::bluetooth::{BLUEZ_SERVICE, PLAYER_IFACE, TRANSPORT_IFACE};
use crate::bus::{Bus, ObjectMap};
use crate::error::{DaemonError, Result};

const VOLUME_CEILING: u16 = 127;

/// Out-of-band playback commands. Tracks the live player/transport object
/// paths so commands fail with `NoActiveSession` instead of calling into
/// a path that no longer exists.
pub struct PlaybackFacade {
    bus: Arc<Bus>,
    session: Arc<RwLock<Session>>,
    player_path: RwLock<Option<String>>,
    transport_path: RwLock<Option<String>>,
}

impl PlaybackFacade {
    pub fn new(bus: Arc<Bus>, session: Arc<RwLock<Session>>) -> Self {
        Self {
            bus,
            session,
            player_path: RwLock::new(None),
            transport_path: RwLock::new(None),
        }
    }

    /// Pick up player/transport objects already present at startup.
    pub async fn seed_paths(&self, objects: &ObjectMap) {
        for (path, interfaces) in objects {
            if interfaces.contains_key(PLAYER_IFACE) {
                self.set_player(path).await;
            }
            if interfaces.contains_key(TRANSPORT_IFACE) {
                self.set_transport(path).await;
            }
        }
    }

    pub async fn set_player(&self, path: &str) {
        tracing::debug!("Media player at {}", path);
        *self.player_path.write().await = Some(path.to_string());
    }

    pub async fn clear_player(&self, path: &str) {
        let mut player = self.player_path.write().await;
        if player.as_deref() == Some(path) {
            tracing::debug!("Media player at {} gone", path);
            *player = None;
        }
    }

    pub async fn set_transport(&self, path: &str) {
        tracing::debug!("Media transport at {}", path);
        *self.transport_path.write().await = Some(path.to_string());
    }

    pub async fn clear_transport(&self, path: &str) {
        let mut transport = self.transport_path.write().await;
        if transport.as_deref() == Some(path) {
            tracing::debug!("Media transport at {} gone", path);
            *transport = None;
        }
    }

    pub async fn play(&self) -> Result<()> {
        self.player_command("Play").await
    }

    pub async fn pause(&self) -> Result<()> {
        self.player_command("Pause").await
    }

    pub async fn next(&self) -> Result<()> {
        self.player_command("Next").await
    }

    pub async fn previous(&self) -> Result<()> {
        self.player_command("Previous").await
    }

    /// Push an absolute volume to the remote. Values outside the AVRCP
    /// range are rejected here, before anything reaches the transport or
    /// the mixer.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        if !volume_in_range(volume) {
            tracing::info!(
                "Volume must be between 0 and {}, {} was given. Ignoring...",
                VOLUME_CEILING,
                volume
            );
            return Ok(());
        }

        let state = self.session.read().await.state;
        let transport = target(state, &*self.transport_path.read().await)?;
        self.bus
            .set_u16(BLUEZ_SERVICE, &transport, TRANSPORT_IFACE, "Volume", volume)
            .await?;
        Ok(())
    }

    async fn player_command(&self, method: &str) -> Result<()> {
        let state = self.session.read().await.state;
        let player = target(state, &*self.player_path.read().await)?;
        tracing::debug!("Sending {} to {}", method, player);
        self.bus
            .call(BLUEZ_SERVICE, &player, PLAYER_IFACE, method)
            .await?;
        Ok(())
    }
}

/// A command needs both an active session and a live object path.
fn target(state: SessionState, path: &Option<String>) -> Result<String> {
    if state != SessionState::Active {
        return Err(DaemonError::NoActiveSession);
    }
    path.clone().ok_or(DaemonError::NoActiveSession)
}

pub(crate) fn volume_in_range(volume: u16) -> bool {
    volume <= VOLUME_CEILING
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_require_active_session() {
        let path = Some("/org/bluez/hci0/dev_AA/player0".to_string());
        assert!(matches!(
            target(SessionState::Idle, &path),
            Err(DaemonError::NoActiveSession)
        ));
        assert!(matches!(
            target(SessionState::AwaitingAuthorization, &path),
            Err(DaemonError::NoActiveSession)
        ));
        assert_eq!(target(SessionState::Active, &path).unwrap(), path.unwrap());
    }

    #[test]
    fn commands_require_live_player_path() {
        assert!(matches!(
            target(SessionState::Active, &None),
            Err(DaemonError::NoActiveSession)
        ));
    }

    #[test]
    fn volume_range_is_avrcp() {
        assert!(volume_in_range(0));
        assert!(volume_in_range(127));
        assert!(!volume_in_range(128));
    }
}
