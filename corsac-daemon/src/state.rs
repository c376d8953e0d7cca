/*!
 * Session State Store
 * Single source of truth for current track, playback status and volume
 */

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::events::PlayerUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
    Unknown,
}

impl PlaybackStatus {
    pub fn from_bus(value: &str) -> Self {
        match value {
            "playing" => PlaybackStatus::Playing,
            "paused" => PlaybackStatus::Paused,
            "stopped" => PlaybackStatus::Stopped,
            _ => PlaybackStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl TrackInfo {
    /// Metadata is complete only when all three fields carry text. An
    /// incomplete triple must never trigger an artwork lookup.
    pub fn is_complete(&self) -> bool {
        !self.title.is_empty() && !self.artist.is_empty() && !self.album.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub status: PlaybackStatus,
    pub track: Option<TrackInfo>,
    pub volume: u16,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Unknown,
            track: None,
            volume: 0,
        }
    }
}

/// Written only by the event router's dispatch task; everyone else reads
/// an owned copy. Replacing the inner Arc keeps the write window to a
/// pointer swap, so readers never observe a half-applied update.
pub struct StateStore {
    current: RwLock<Arc<PlaybackSnapshot>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(PlaybackSnapshot::default())),
        }
    }

    pub async fn snapshot(&self) -> PlaybackSnapshot {
        (**self.current.read().await).clone()
    }

    /// Fold one media-player update into the snapshot. `Status` overwrites
    /// the status; `Track` replaces the whole metadata triple. There is no
    /// partial merge: a Track map that omits a field still erases the old
    /// value of that field.
    pub async fn apply_player_update(&self, update: &PlayerUpdate) -> PlaybackSnapshot {
        let mut guard = self.current.write().await;
        let mut next = (**guard).clone();
        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(track) = &update.track {
            next.track = Some(track.clone());
        }
        *guard = Arc::new(next.clone());
        next
    }

    pub async fn apply_volume(&self, volume: u16) -> PlaybackSnapshot {
        let mut guard = self.current.write().await;
        let mut next = (**guard).clone();
        if volume <= 127 {
            next.volume = volume;
        } else {
            tracing::debug!("Ignoring out-of-range volume {} from bus", volume);
        }
        *guard = Arc::new(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(title: &str, artist: &str, album: &str) -> TrackInfo {
        TrackInfo {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
        }
    }

    fn status_update(status: PlaybackStatus) -> PlayerUpdate {
        PlayerUpdate {
            status: Some(status),
            track: None,
            changed: vec!["Status".to_string()],
        }
    }

    fn track_update(info: TrackInfo) -> PlayerUpdate {
        PlayerUpdate {
            status: None,
            track: Some(info),
            changed: vec!["Track".to_string()],
        }
    }

    #[tokio::test]
    async fn folds_updates_in_order() {
        let store = StateStore::new();
        store.apply_player_update(&track_update(track("A", "B", "C"))).await;
        let last = store
            .apply_player_update(&status_update(PlaybackStatus::Playing))
            .await;

        assert_eq!(last.status, PlaybackStatus::Playing);
        assert_eq!(last.track, Some(track("A", "B", "C")));
        assert_eq!(store.snapshot().await, last);
    }

    #[tokio::test]
    async fn later_status_wins() {
        let store = StateStore::new();
        store
            .apply_player_update(&status_update(PlaybackStatus::Playing))
            .await;
        store
            .apply_player_update(&status_update(PlaybackStatus::Paused))
            .await;
        assert_eq!(store.snapshot().await.status, PlaybackStatus::Paused);
    }

    #[tokio::test]
    async fn track_replaces_wholesale() {
        let store = StateStore::new();
        store
            .apply_player_update(&track_update(track("Old Song", "Old Artist", "Old Album")))
            .await;

        // New track map omitted Album: the decoded triple has an empty
        // album, and the old one must not bleed through.
        store
            .apply_player_update(&track_update(track("New Song", "New Artist", "")))
            .await;

        let snapshot = store.snapshot().await;
        let current = snapshot.track.unwrap();
        assert_eq!(current.title, "New Song");
        assert_eq!(current.album, "");
    }

    #[tokio::test]
    async fn volume_outside_range_is_ignored() {
        let store = StateStore::new();
        store.apply_volume(64).await;
        let snapshot = store.apply_volume(500).await;
        assert_eq!(snapshot.volume, 64);
    }

    #[test]
    fn completeness_requires_all_three_fields() {
        assert!(track("A", "B", "C").is_complete());
        assert!(!track("A", "", "C").is_complete());
        assert!(!TrackInfo::default().is_complete());
    }
}
