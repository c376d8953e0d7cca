/*!
 * Call Session Tracker
 * Voice-call tracking over oFono, same event pattern as the audio path
 */

use std::collections::HashMap;

use dbus::arg::PropMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::bus::{decode_prop_map, Bus, BusEvent, PropValue};
use crate::error::{DaemonError, Result};
use crate::events::{EventBus, SessionEvent};

pub const OFONO_SERVICE: &str = "org.ofono";
const MANAGER_IFACE: &str = "org.ofono.Manager";
const VCM_IFACE: &str = "org.ofono.VoiceCallManager";
const CALL_IFACE: &str = "org.ofono.VoiceCall";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub path: String,
    pub line_id: Option<String>,
    pub state: Option<String>,
}

impl CallInfo {
    pub fn from_props(path: String, props: &HashMap<String, PropValue>) -> Self {
        CallInfo {
            path,
            line_id: props
                .get("LineIdentification")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            state: props
                .get("State")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

/// Optional telephony subsystem. Holds its own bus connection so the
/// oFono event loop runs independently of the BlueZ one.
pub struct CallTracker {
    bus: Bus,
    modem: String,
    calls: RwLock<HashMap<String, CallInfo>>,
    events: EventBus,
}

impl CallTracker {
    /// Connect to oFono and seed the call list. Requires a modem; without
    /// one the subsystem cannot start, and the caller decides whether that
    /// is fatal (for this daemon it is not).
    pub async fn connect(events: EventBus, tx: mpsc::UnboundedSender<BusEvent>) -> Result<Self> {
        let bus = Bus::connect_system().await?;

        let modem = {
            let (modems,): (Vec<(dbus::Path<'static>, PropMap)>,) = bus
                .proxy(OFONO_SERVICE, "/")
                .method_call(MANAGER_IFACE, "GetModems", ())
                .await?;
            modems.first().map(|(path, _)| path.to_string())
        }
        .ok_or_else(|| DaemonError::DeviceNotFound("ofono modem".to_string()))?;
        tracing::info!("Tracking calls on modem {}", modem);

        bus.subscribe_calls(tx).await?;

        let tracker = Self {
            bus,
            modem,
            calls: RwLock::new(HashMap::new()),
            events,
        };
        tracker.refresh_calls().await?;
        Ok(tracker)
    }

    /// Fetch the current call list from the modem.
    async fn refresh_calls(&self) -> Result<()> {
        let seeded: Vec<CallInfo> = {
            let (raw,): (Vec<(dbus::Path<'static>, PropMap)>,) = self
                .bus
                .proxy(OFONO_SERVICE, &self.modem)
                .method_call(VCM_IFACE, "GetCalls", ())
                .await?;
            raw.iter()
                .map(|(path, props)| {
                    CallInfo::from_props(path.to_string(), &decode_prop_map(props))
                })
                .collect()
        };

        let mut calls = self.calls.write().await;
        calls.clear();
        for call in seeded {
            calls.insert(call.path.clone(), call);
        }
        Ok(())
    }

    pub async fn on_call_added(&self, path: String, props: HashMap<String, PropValue>) {
        let call = CallInfo::from_props(path, &props);
        tracing::info!(
            "Call added: {} ({})",
            call.path,
            call.line_id.as_deref().unwrap_or("unknown")
        );
        self.calls
            .write()
            .await
            .insert(call.path.clone(), call.clone());
        self.events.publish(SessionEvent::CallAdded { call });
    }

    pub async fn on_call_removed(&self, path: String) {
        if self.calls.write().await.remove(&path).is_some() {
            tracing::info!("Call removed: {}", path);
            self.events.publish(SessionEvent::CallRemoved { path });
        }
    }

    pub async fn on_call_property(&self, path: String, name: String, value: PropValue) {
        tracing::debug!("Call {} property {} changed", path, name);
        let mut calls = self.calls.write().await;
        let Some(call) = calls.get_mut(&path) else {
            return;
        };
        match (name.as_str(), value.as_str()) {
            ("State", Some(state)) => call.state = Some(state.to_string()),
            ("LineIdentification", Some(line)) => call.line_id = Some(line.to_string()),
            _ => {}
        }
    }

    pub async fn calls(&self) -> Vec<CallInfo> {
        let mut list: Vec<CallInfo> = self.calls.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    pub async fn dial(&self, number: &str) -> Result<()> {
        let (_path,): (dbus::Path<'static>,) = self
            .bus
            .proxy(OFONO_SERVICE, &self.modem)
            .method_call(VCM_IFACE, "Dial", (number, "default"))
            .await?;
        Ok(())
    }

    pub async fn answer(&self, call: &str) -> Result<()> {
        self.bus
            .call(OFONO_SERVICE, call, CALL_IFACE, "Answer")
            .await
    }

    pub async fn hangup(&self, call: &str) -> Result<()> {
        self.bus
            .call(OFONO_SERVICE, call, CALL_IFACE, "Hangup")
            .await
    }

    pub async fn hangup_all(&self) -> Result<()> {
        self.bus
            .call(OFONO_SERVICE, &self.modem, VCM_IFACE, "HangupAll")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_info_decodes_known_properties() {
        let mut props = HashMap::new();
        props.insert(
            "LineIdentification".to_string(),
            PropValue::Str("+15551234567".to_string()),
        );
        props.insert("State".to_string(), PropValue::Str("incoming".to_string()));

        let call = CallInfo::from_props("/phonesim/voicecall01".to_string(), &props);
        assert_eq!(call.line_id.as_deref(), Some("+15551234567"));
        assert_eq!(call.state.as_deref(), Some("incoming"));
    }

    #[test]
    fn call_info_tolerates_missing_properties() {
        let call = CallInfo::from_props("/phonesim/voicecall01".to_string(), &HashMap::new());
        assert!(call.line_id.is_none());
        assert!(call.state.is_none());
    }
}
