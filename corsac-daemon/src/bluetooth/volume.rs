/*!
 * Volume Bridge
 * Maps transport volume/codec/state changes to mixer gain
 */

use crate::bluetooth::{BLUEZ_SERVICE, DEVICE_IFACE, TRANSPORT_IFACE};
use crate::bus::Bus;
use crate::events::TransportUpdate;
use crate::mixer::Mixer;

pub struct VolumeBridge<M: Mixer> {
    mixer: M,
    volume_max: u16,
}

impl<M: Mixer> VolumeBridge<M> {
    pub fn new(mixer: M, volume_max: u16) -> Self {
        Self { mixer, volume_max }
    }

    /// Handle a MediaTransport1 delta. The transport path is resolved to
    /// its owning device on every event; a failed lookup means the object
    /// vanished mid-flight and the event is dropped.
    pub async fn on_transport_update(&self, bus: &Bus, path: &str, update: &TransportUpdate) {
        let device_path = match bus
            .get_object_path(BLUEZ_SERVICE, path, TRANSPORT_IFACE, "Device")
            .await
        {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Cannot resolve transport {} to a device: {}", path, e);
                return;
            }
        };
        let name = match bus
            .get_string(BLUEZ_SERVICE, &device_path, DEVICE_IFACE, "Name")
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Cannot read device name at {}: {}", device_path, e);
                return;
            }
        };
        let address = match bus
            .get_string(BLUEZ_SERVICE, &device_path, DEVICE_IFACE, "Address")
            .await
        {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!("Cannot read device address at {}: {}", device_path, e);
                return;
            }
        };

        if let Some(state) = &update.state {
            tracing::info!(
                "Bluetooth A2DP source: {} ({}) is now {}",
                name,
                address,
                state
            );
            if state == "active" {
                // A freshly active stream carries no Volume delta; read
                // codec and volume off the transport instead.
                if let Ok(codec) = bus
                    .get_byte(BLUEZ_SERVICE, path, TRANSPORT_IFACE, "Codec")
                    .await
                {
                    tracing::debug!(
                        "Bluetooth A2DP source: {} ({}) codec is {}",
                        name,
                        address,
                        codec
                    );
                }
                match bus
                    .get_u16(BLUEZ_SERVICE, path, TRANSPORT_IFACE, "Volume")
                    .await
                {
                    Ok(volume) => {
                        tracing::debug!(
                            "Bluetooth A2DP source: {} ({}) volume is {}",
                            name,
                            address,
                            volume
                        );
                        self.apply_volume(&address, volume).await;
                    }
                    Err(e) => tracing::debug!("Cannot read transport volume: {}", e),
                }
            }
        } else if let Some(volume) = update.volume {
            tracing::debug!(
                "Bluetooth A2DP source: {} ({}) volume is now {}",
                name,
                address,
                volume
            );
            self.apply_volume(&address, volume).await;
        } else if let Some(codec) = update.codec {
            tracing::debug!(
                "Bluetooth A2DP source: {} ({}) codec is {}",
                name,
                address,
                codec
            );
        }
    }

    /// Scale a raw AVRCP volume onto the mixer. No sink means the A2DP
    /// source is idle or tearing down; skip quietly.
    pub async fn apply_volume(&self, address: &str, raw: u16) {
        let Some(sink) = self.mixer.resolve_sink(address).await else {
            tracing::debug!("Skipping volume change");
            return;
        };
        let gain = (f64::from(raw) / f64::from(self.volume_max)).clamp(0.0, 1.0);
        self.mixer.set_gain(&sink, gain).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Mixer double: resolves a fixed sink and records gains.
    struct RecordingMixer {
        sink: Option<String>,
        gains: Mutex<Vec<(String, f64)>>,
    }

    impl RecordingMixer {
        fn with_sink(sink: &str) -> Self {
            Self {
                sink: Some(sink.to_string()),
                gains: Mutex::new(Vec::new()),
            }
        }

        fn without_sink() -> Self {
            Self {
                sink: None,
                gains: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Mixer for RecordingMixer {
        async fn resolve_sink(&self, _address: &str) -> Option<String> {
            self.sink.clone()
        }

        async fn set_gain(&self, sink: &str, gain: f64) -> bool {
            self.gains.lock().unwrap().push((sink.to_string(), gain));
            true
        }
    }

    #[tokio::test]
    async fn scales_raw_volume_to_unit_gain() {
        let bridge = VolumeBridge::new(RecordingMixer::with_sink("3"), 127);
        bridge.apply_volume("AA:BB:CC:DD:EE:FF", 0).await;
        bridge.apply_volume("AA:BB:CC:DD:EE:FF", 127).await;

        let gains = bridge.mixer.gains.lock().unwrap();
        assert_eq!(gains[0], ("3".to_string(), 0.0));
        assert_eq!(gains[1], ("3".to_string(), 1.0));
    }

    #[tokio::test]
    async fn raised_ceiling_scales_down() {
        let bridge = VolumeBridge::new(RecordingMixer::with_sink("3"), 141);
        bridge.apply_volume("AA:BB:CC:DD:EE:FF", 141).await;
        let gains = bridge.mixer.gains.lock().unwrap();
        assert_eq!(gains[0].1, 1.0);
    }

    #[tokio::test]
    async fn gain_never_exceeds_unit() {
        let bridge = VolumeBridge::new(RecordingMixer::with_sink("3"), 127);
        bridge.apply_volume("AA:BB:CC:DD:EE:FF", 300).await;
        let gains = bridge.mixer.gains.lock().unwrap();
        assert_eq!(gains[0].1, 1.0);
    }

    #[tokio::test]
    async fn missing_sink_is_a_no_op() {
        let bridge = VolumeBridge::new(RecordingMixer::without_sink(), 127);
        bridge.apply_volume("AA:BB:CC:DD:EE:FF", 64).await;
        assert!(bridge.mixer.gains.lock().unwrap().is_empty());
    }
}
