/*!
 * State-Push Sink
 * Fire-and-forget POST of the playback state to a metadata endpoint
 */

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::artwork::ArtworkResolver;
use crate::events::{EventBus, SessionEvent};
use crate::state::{PlaybackSnapshot, PlaybackStatus, TrackInfo};

#[derive(Debug, Serialize)]
struct StatePayload<'a> {
    status: PlaybackStatus,
    track: Option<&'a TrackInfo>,
    album_art: Option<String>,
}

/// Subscribes to playback changes and republishes them. Runs off the
/// dispatch path, so the artwork lookup never stalls event handling.
pub struct StatePusher {
    client: reqwest::Client,
    endpoint: String,
    artwork: Arc<ArtworkResolver>,
}

impl StatePusher {
    pub fn new(endpoint: String, artwork: Arc<ArtworkResolver>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            artwork,
        }
    }

    pub async fn run(self, events: EventBus) {
        let mut rx = events.subscribe();
        loop {
            match rx.recv().await {
                Ok(SessionEvent::PlaybackChanged { snapshot, .. }) => self.push(snapshot).await,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("State pusher lagged, {} events dropped", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn push(&self, snapshot: PlaybackSnapshot) {
        let album_art = match &snapshot.track {
            Some(track) => self
                .artwork
                .resolve(track)
                .await
                .map(|p| p.display().to_string()),
            None => None,
        };

        let payload = StatePayload {
            status: snapshot.status,
            track: snapshot.track.as_ref(),
            album_art,
        };

        match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::debug!("State push returned {}", response.status());
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("State push failed: {}", e),
        }
    }
}
