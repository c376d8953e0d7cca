/*!
 * Mixer Sink Boundary
 * PulseAudio source resolution and gain control via pactl
 */

use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait Mixer: Send + Sync {
    /// Resolve a device address to a mixer sink id. None while the A2DP
    /// source does not exist (idle or mid-connect); callers treat that
    /// as a no-op, not an error.
    async fn resolve_sink(&self, address: &str) -> Option<String>;

    async fn set_gain(&self, sink: &str, gain: f64) -> bool;
}

pub struct PactlMixer;

#[async_trait]
impl Mixer for PactlMixer {
    async fn resolve_sink(&self, address: &str) -> Option<String> {
        let output = Command::new("pactl")
            .args(["list", "short", "sources"])
            .output()
            .await
            .ok()?;
        let listing = String::from_utf8_lossy(&output.stdout);
        match source_index(&listing, address) {
            Some(index) => {
                tracing::debug!("PulseAudio A2DP source {} is #{}", address, index);
                Some(index)
            }
            None => {
                tracing::debug!("Cannot find PulseAudio A2DP source {}", address);
                None
            }
        }
    }

    async fn set_gain(&self, sink: &str, gain: f64) -> bool {
        let value = format!("{:.2}", gain);
        tracing::debug!("Running pactl set-source-volume {} {}", sink, value);
        match Command::new("pactl")
            .args(["set-source-volume", sink, &value])
            .status()
            .await
        {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!("pactl set-source-volume exited with {}", status);
                false
            }
            Err(e) => {
                tracing::warn!("Failed to run pactl: {}", e);
                false
            }
        }
    }
}

/// The source index is the first field of the tab-separated line naming
/// the bluez source for this address.
fn source_index(listing: &str, address: &str) -> Option<String> {
    let needle = format!("bluez_source.{}", address.replace(':', "_"));
    listing
        .lines()
        .find(|line| line.contains(&needle))
        .and_then(|line| line.split('\t').next())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "0\talsa_input.platform-soc_sound.seeed-2mic\tmodule-alsa-card.c\ts16le 2ch 48000Hz\tSUSPENDED\n\
        3\tbluez_source.80_B9_89_1E_B5_6F.a2dp_source\tmodule-bluez5-device.c\ts16le 2ch 44100Hz\tRUNNING\n";

    #[test]
    fn finds_source_index_for_address() {
        assert_eq!(
            source_index(LISTING, "80:B9:89:1E:B5:6F"),
            Some("3".to_string())
        );
    }

    #[test]
    fn missing_source_resolves_to_none() {
        assert_eq!(source_index(LISTING, "11:22:33:44:55:66"), None);
        assert_eq!(source_index("", "80:B9:89:1E:B5:6F"), None);
    }
}
