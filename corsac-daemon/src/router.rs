/*!
 * Event Router
 * Classifies raw bus events and dispatches them to the subsystems
 */

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bluetooth::admission::AdmissionController;
use crate::bluetooth::playback::PlaybackFacade;
use crate::bluetooth::volume::VolumeBridge;
use crate::bluetooth::{
    address_from_path, DeviceRegistry, DEVICE_IFACE, PLAYER_IFACE, TRANSPORT_IFACE,
};
use crate::bus::{Bus, BusEvent, PropValue};
use crate::calls::CallTracker;
use crate::events::{DeviceUpdate, EventBus, PlayerUpdate, SessionEvent, TransportUpdate};
use crate::mixer::PactlMixer;
use crate::state::StateStore;

/// The single consumer of the raw event channel. One dispatch task per
/// process is what gives per-path, bus-delivery ordering; everything it
/// calls must return promptly or hand off to another task.
pub struct EventRouter {
    pub bus: Arc<Bus>,
    pub store: Arc<StateStore>,
    pub events: EventBus,
    pub registry: Arc<DeviceRegistry>,
    pub admission: Arc<AdmissionController>,
    pub facade: Arc<PlaybackFacade>,
    pub volume: VolumeBridge<PactlMixer>,
    pub calls: Option<Arc<CallTracker>>,
}

impl EventRouter {
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<BusEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(event).await;
        }
        tracing::debug!("Event channel closed, router stopping");
    }

    async fn dispatch(&self, event: BusEvent) {
        match event {
            BusEvent::PropertiesChanged {
                seq,
                path,
                interface,
                changed,
            } => {
                tracing::trace!("#{} PropertiesChanged {} on {}", seq, interface, path);
                match interface.as_str() {
                    TRANSPORT_IFACE => self.on_transport_props(&path, &changed).await,
                    PLAYER_IFACE => self.on_player_props(&changed).await,
                    DEVICE_IFACE => self.on_device_props(&path, &changed).await,
                    _ => {}
                }
            }
            BusEvent::ObjectAdded {
                path, interfaces, ..
            } => self.on_object_added(&path, &interfaces).await,
            BusEvent::ObjectRemoved {
                path, interfaces, ..
            } => self.on_object_removed(&path, &interfaces).await,
            BusEvent::CallAdded {
                call, properties, ..
            } => {
                if let Some(tracker) = &self.calls {
                    tracker.on_call_added(call, properties).await;
                }
            }
            BusEvent::CallRemoved { call, .. } => {
                if let Some(tracker) = &self.calls {
                    tracker.on_call_removed(call).await;
                }
            }
            BusEvent::CallPropertyChanged {
                call, name, value, ..
            } => {
                if let Some(tracker) = &self.calls {
                    tracker.on_call_property(call, name, value).await;
                }
            }
        }
    }

    async fn on_transport_props(&self, path: &str, changed: &HashMap<String, PropValue>) {
        let Some(update) = TransportUpdate::from_props(changed) else {
            tracing::debug!("Transport delta without usable properties, skipping");
            return;
        };
        // Keep the snapshot's volume in step before the mixer side effect.
        if let Some(volume) = update.volume {
            self.store.apply_volume(volume).await;
        }
        self.volume.on_transport_update(&self.bus, path, &update).await;
    }

    async fn on_player_props(&self, changed: &HashMap<String, PropValue>) {
        match PlayerUpdate::from_props(changed) {
            Some(update) => apply_player_update(&self.store, &self.events, &update).await,
            None => tracing::debug!("Player delta without usable properties, skipping"),
        }
    }

    async fn on_device_props(&self, path: &str, changed: &HashMap<String, PropValue>) {
        let Some(update) = DeviceUpdate::from_props(changed) else {
            return;
        };
        match update.connected {
            Some(true) => {
                if let Some(device) = self.registry.set_connected(path, true).await {
                    tracing::info!("Device {} ({}) connected", device.name, device.address);
                    self.events.publish(SessionEvent::DeviceConnected { device });
                }
            }
            Some(false) => {
                if let Some(device) = self.registry.set_connected(path, false).await {
                    tracing::info!("Device {} ({}) disconnected", device.name, device.address);
                    self.admission
                        .handle_device_disconnected(&device.address)
                        .await;
                    self.events.publish(SessionEvent::DeviceDisconnected {
                        address: device.address,
                    });
                }
            }
            None => {}
        }
    }

    async fn on_object_added(
        &self,
        path: &str,
        interfaces: &HashMap<String, HashMap<String, PropValue>>,
    ) {
        if interfaces.contains_key(PLAYER_IFACE) {
            self.facade.set_player(path).await;
        }
        if interfaces.contains_key(TRANSPORT_IFACE) {
            self.facade.set_transport(path).await;
        }
        if let Some(props) = interfaces.get(DEVICE_IFACE) {
            if let Some(device) = crate::bluetooth::Device::from_props(props) {
                self.registry.upsert(path, device).await;
            }
        }
    }

    async fn on_object_removed(&self, path: &str, interfaces: &[String]) {
        for interface in interfaces {
            match interface.as_str() {
                PLAYER_IFACE => self.facade.clear_player(path).await,
                TRANSPORT_IFACE => self.facade.clear_transport(path).await,
                DEVICE_IFACE => {
                    if self.registry.remove(path).await.is_some() {
                        if let Some(address) = address_from_path(path) {
                            self.admission.handle_device_disconnected(&address).await;
                            self.events
                                .publish(SessionEvent::DeviceDisconnected { address });
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Fold a player delta into the store, then notify. Subscribers only ever
/// see a snapshot that already contains the event that woke them.
pub(crate) async fn apply_player_update(
    store: &StateStore,
    events: &EventBus,
    update: &PlayerUpdate,
) {
    if let Some(status) = update.status {
        tracing::debug!("Playback status: {:?}", status);
    }
    if let Some(track) = &update.track {
        tracing::debug!(
            "Track info: {} / {} / {}",
            track.title,
            track.artist,
            track.album
        );
    }

    let snapshot = store.apply_player_update(update).await;
    events.publish(SessionEvent::PlaybackChanged {
        snapshot,
        changed: update.changed.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PlaybackStatus, TrackInfo};

    fn props(entries: Vec<(&str, PropValue)>) -> HashMap<String, PropValue> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn track_map(title: &str, artist: &str, album: &str) -> PropValue {
        PropValue::Map(props(vec![
            ("Title", PropValue::Str(title.to_string())),
            ("Artist", PropValue::Str(artist.to_string())),
            ("Album", PropValue::Str(album.to_string())),
        ]))
    }

    #[tokio::test]
    async fn player_event_stream_folds_and_notifies_in_order() {
        let store = StateStore::new();
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        let deltas = [
            props(vec![("Track", track_map("A", "B", "C"))]),
            props(vec![("Status", PropValue::Str("playing".to_string()))]),
        ];
        for delta in &deltas {
            let update = PlayerUpdate::from_props(delta).unwrap();
            apply_player_update(&store, &events, &update).await;
        }

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.status, PlaybackStatus::Playing);
        assert_eq!(
            snapshot.track,
            Some(TrackInfo {
                title: "A".to_string(),
                artist: "B".to_string(),
                album: "C".to_string(),
            })
        );

        // Two notifications, in order, each carrying the state as of its
        // own event.
        let first = rx.try_recv().unwrap();
        let SessionEvent::PlaybackChanged { snapshot, changed } = first else {
            panic!("expected PlaybackChanged");
        };
        assert_eq!(changed, vec!["Track".to_string()]);
        assert_eq!(snapshot.status, PlaybackStatus::Unknown);

        let second = rx.try_recv().unwrap();
        let SessionEvent::PlaybackChanged { snapshot, changed } = second else {
            panic!("expected PlaybackChanged");
        };
        assert_eq!(changed, vec!["Status".to_string()]);
        assert_eq!(snapshot.status, PlaybackStatus::Playing);
        assert!(rx.try_recv().is_err());
    }
}
