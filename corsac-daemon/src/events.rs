/*!
 * Typed Events
 * Interface updates decoded at the bus boundary, and the domain event bus
 */

use std::collections::HashMap;

use tokio::sync::broadcast;

use crate::bluetooth::Device;
use crate::bus::PropValue;
use crate::calls::CallInfo;
use crate::state::{PlaybackSnapshot, PlaybackStatus, TrackInfo};

/// A media-player property delta. Decoded once from the raw map; missing
/// or malformed keys are dropped here so downstream code never probes
/// string keys again.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerUpdate {
    pub status: Option<PlaybackStatus>,
    pub track: Option<TrackInfo>,
    /// Names of the recognized properties this delta carried, forwarded
    /// to playback-changed subscribers.
    pub changed: Vec<String>,
}

impl PlayerUpdate {
    pub fn from_props(props: &HashMap<String, PropValue>) -> Option<Self> {
        let mut update = PlayerUpdate {
            status: None,
            track: None,
            changed: Vec::new(),
        };

        if let Some(value) = props.get("Status") {
            match value.as_str() {
                Some(s) => {
                    update.status = Some(PlaybackStatus::from_bus(s));
                    update.changed.push("Status".to_string());
                }
                None => tracing::debug!("Malformed Status payload, skipping"),
            }
        }

        if let Some(value) = props.get("Track") {
            match value.as_map() {
                Some(map) => {
                    update.track = Some(TrackInfo {
                        title: string_field(map, "Title"),
                        artist: string_field(map, "Artist"),
                        album: string_field(map, "Album"),
                    });
                    update.changed.push("Track".to_string());
                }
                None => tracing::debug!("Malformed Track payload, skipping"),
            }
        }

        if update.changed.is_empty() {
            None
        } else {
            Some(update)
        }
    }
}

/// A media-transport property delta (volume/codec/stream state).
#[derive(Debug, Clone, PartialEq)]
pub struct TransportUpdate {
    pub state: Option<String>,
    pub volume: Option<u16>,
    pub codec: Option<u8>,
}

impl TransportUpdate {
    pub fn from_props(props: &HashMap<String, PropValue>) -> Option<Self> {
        let update = TransportUpdate {
            state: props
                .get("State")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            volume: props
                .get("Volume")
                .and_then(|v| v.as_u64())
                .and_then(|v| u16::try_from(v).ok()),
            codec: props
                .get("Codec")
                .and_then(|v| v.as_u64())
                .and_then(|v| u8::try_from(v).ok()),
        };

        if update.state.is_none() && update.volume.is_none() && update.codec.is_none() {
            None
        } else {
            Some(update)
        }
    }
}

/// A device property delta; only the connection flag matters to us.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub connected: Option<bool>,
}

impl DeviceUpdate {
    pub fn from_props(props: &HashMap<String, PropValue>) -> Option<Self> {
        let connected = props.get("Connected").and_then(|v| v.as_bool());
        connected.map(|c| DeviceUpdate { connected: Some(c) })
    }
}

/// Domain events published to any number of subscribers (display sink,
/// web push, tests). Replaces the per-constructor callback hooks of old.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    DeviceConnected { device: Device },
    DeviceDisconnected { address: String },
    PlaybackChanged {
        snapshot: PlaybackSnapshot,
        changed: Vec<String>,
    },
    CallAdded { call: CallInfo },
    CallRemoved { path: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publishing never blocks the dispatch task; with no subscribers the
    /// event is simply dropped.
    pub fn publish(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for session event");
        }
    }
}

fn string_field(map: &HashMap<String, PropValue>, key: &str) -> String {
    map.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: Vec<(&str, PropValue)>) -> HashMap<String, PropValue> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn decodes_status_and_track() {
        let mut track = HashMap::new();
        track.insert("Title".to_string(), PropValue::Str("A".to_string()));
        track.insert("Artist".to_string(), PropValue::Str("B".to_string()));
        track.insert("Album".to_string(), PropValue::Str("C".to_string()));

        let update = PlayerUpdate::from_props(&props(vec![
            ("Status", PropValue::Str("playing".to_string())),
            ("Track", PropValue::Map(track)),
        ]))
        .unwrap();

        assert_eq!(update.status, Some(PlaybackStatus::Playing));
        let info = update.track.unwrap();
        assert_eq!((info.title.as_str(), info.artist.as_str(), info.album.as_str()), ("A", "B", "C"));
        assert_eq!(update.changed.len(), 2);
    }

    #[test]
    fn track_with_missing_album_decodes_empty() {
        let mut track = HashMap::new();
        track.insert("Title".to_string(), PropValue::Str("A".to_string()));
        track.insert("Artist".to_string(), PropValue::Str("B".to_string()));

        let update =
            PlayerUpdate::from_props(&props(vec![("Track", PropValue::Map(track))])).unwrap();
        assert_eq!(update.track.unwrap().album, "");
    }

    #[test]
    fn unrelated_properties_produce_nothing() {
        assert!(PlayerUpdate::from_props(&props(vec![(
            "Position",
            PropValue::Uint(1000)
        )]))
        .is_none());
    }

    #[test]
    fn malformed_status_is_skipped() {
        // A Status that is not a string is dropped; with nothing else in
        // the delta the whole event is discarded rather than failing.
        assert!(
            PlayerUpdate::from_props(&props(vec![("Status", PropValue::Uint(1))])).is_none()
        );
    }

    #[test]
    fn transport_update_decodes_fields() {
        let update = TransportUpdate::from_props(&props(vec![
            ("State", PropValue::Str("active".to_string())),
            ("Codec", PropValue::Uint(1)),
            ("Volume", PropValue::Uint(64)),
        ]))
        .unwrap();
        assert_eq!(update.state.as_deref(), Some("active"));
        assert_eq!(update.volume, Some(64));
        assert_eq!(update.codec, Some(1));
    }

    #[test]
    fn event_bus_fans_out_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::DeviceDisconnected {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        });
        bus.publish(SessionEvent::CallRemoved {
            path: "/call0".to_string(),
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::DeviceDisconnected { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::CallRemoved { .. }));
    }
}
