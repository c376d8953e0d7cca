use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub bluetooth: BluetoothConfig,
    pub artwork: ArtworkConfig,
    pub push: PushConfig,
    pub telephony: TelephonyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BluetoothConfig {
    /// Whether the adapter advertises itself while no session is active.
    pub discoverable: bool,
    /// Service UUIDs a remote may request during authorization.
    pub allowed_services: Vec<String>,
    /// Poll interval while waiting for a connected device, in milliseconds.
    pub connect_poll_ms: u64,
    /// Poll interval while waiting for service authorization, in milliseconds.
    pub authorize_poll_ms: u64,
    /// Hard deadline for await_connection, in seconds.
    pub connect_timeout_secs: u64,
    /// AVRCP volume ceiling. 127 is standard; raise it if the hardware
    /// saturates below full scale.
    pub volume_max: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtworkConfig {
    pub enabled: bool,
    pub cache_dir: String,
    /// Reachability probe target; artwork lookups are skipped when it
    /// cannot be fetched.
    pub probe_url: String,
    pub search_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushConfig {
    /// Endpoint receiving the playback state JSON. Disabled when unset.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelephonyConfig {
    pub enabled: bool,
}

// Advanced Audio Distribution and A/V Remote Control. A phone asking for
// anything else is refused.
pub const A2DP_UUID: &str = "0000110d-0000-1000-8000-00805f9b34fb";
pub const AVRCP_UUID: &str = "0000110e-0000-1000-8000-00805f9b34fb";

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/corsac/corsac.sock".to_string(),
            bluetooth: BluetoothConfig {
                discoverable: true,
                allowed_services: vec![A2DP_UUID.to_string(), AVRCP_UUID.to_string()],
                connect_poll_ms: 1000,
                authorize_poll_ms: 1500,
                connect_timeout_secs: 120,
                volume_max: 127,
            },
            artwork: ArtworkConfig {
                enabled: true,
                cache_dir: "/var/cache/corsac/art".to_string(),
                probe_url: "https://www.google.com".to_string(),
                search_url: "https://api.deezer.com/search/album".to_string(),
                timeout_secs: 5,
            },
            push: PushConfig { endpoint: None },
            telephony: TelephonyConfig { enabled: false },
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                let _ = fs::write(path, toml::to_string_pretty(&config)?);
                Ok(config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_audio_profiles_only() {
        let config = DaemonConfig::default();
        assert_eq!(
            config.bluetooth.allowed_services,
            vec![A2DP_UUID.to_string(), AVRCP_UUID.to_string()]
        );
        assert!(config.bluetooth.discoverable);
        assert_eq!(config.bluetooth.volume_max, 127);
        assert!(config.push.endpoint.is_none());
        assert!(!config.telephony.enabled);
    }

    #[test]
    fn parses_overridden_config() {
        let toml_str = r#"
            socket_path = "/tmp/corsac-test.sock"

            [bluetooth]
            discoverable = false
            allowed_services = ["0000110d-0000-1000-8000-00805f9b34fb"]
            connect_poll_ms = 500
            authorize_poll_ms = 750
            connect_timeout_secs = 30
            volume_max = 141

            [artwork]
            enabled = false
            cache_dir = "/tmp/art"
            probe_url = "https://example.com"
            search_url = "https://api.deezer.com/search/album"
            timeout_secs = 2

            [push]
            endpoint = "http://127.0.0.1:8080/state"

            [telephony]
            enabled = true
        "#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.socket_path, "/tmp/corsac-test.sock");
        assert_eq!(config.bluetooth.volume_max, 141);
        assert_eq!(config.bluetooth.allowed_services.len(), 1);
        assert_eq!(
            config.push.endpoint.as_deref(),
            Some("http://127.0.0.1:8080/state")
        );
        assert!(config.telephony.enabled);
    }
}
