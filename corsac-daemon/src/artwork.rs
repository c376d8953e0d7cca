/*!
 * Album Art Resolution
 * Cover lookup via the Deezer album search, with a filesystem cache
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::ArtworkConfig;
use crate::state::TrackInfo;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<AlbumEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AlbumEntry {
    pub(crate) artist: ArtistEntry,
    pub(crate) cover_xl: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ArtistEntry {
    pub(crate) name: String,
}

pub struct ArtworkResolver {
    client: reqwest::Client,
    config: ArtworkConfig,
}

impl ArtworkResolver {
    pub fn new(config: ArtworkConfig) -> Self {
        if config.enabled {
            if let Err(e) = std::fs::create_dir_all(&config.cache_dir) {
                tracing::warn!("Cannot create artwork cache {}: {}", config.cache_dir, e);
            }
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("corsac/0.1")
            .build()
            .expect("Failed to build HTTP client");
        Self { client, config }
    }

    /// Resolve cover art for the given track, or None. Never an error:
    /// artwork is decoration, and every failure path degrades to "no
    /// artwork".
    pub async fn resolve(&self, track: &TrackInfo) -> Option<PathBuf> {
        if !self.config.enabled {
            return None;
        }

        // No point doing any of this without connectivity.
        if !self.online().await {
            tracing::warn!("Can't get album art due to no internet connection");
            return None;
        }

        if !track.is_complete() {
            tracing::debug!("Track metadata incomplete, skipping album art");
            return None;
        }

        let cover = self.search_cover(&track.album, &track.artist).await?;
        let path = self.cache_path(&track.album);
        self.fetch_or_cached(&cover, &path).await
    }

    async fn online(&self) -> bool {
        match self.client.get(&self.config.probe_url).send().await {
            Ok(_) => {
                tracing::debug!("Internet connection found, proceeding with album art");
                true
            }
            Err(_) => false,
        }
    }

    async fn search_cover(&self, album: &str, artist: &str) -> Option<String> {
        let response = self
            .client
            .get(&self.config.search_url)
            .query(&[
                ("q", album),
                ("index", "0"),
                ("limit", "20"),
                ("output", "json"),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!("Album search returned {}", r.status());
                return None;
            }
            Err(e) => {
                tracing::warn!("Error when fetching album art: {}", e);
                return None;
            }
        };

        match response.json::<SearchResponse>().await {
            Ok(parsed) => pick_cover(&parsed.data, artist),
            Err(e) => {
                tracing::warn!("Could not parse album search response: {}", e);
                None
            }
        }
    }

    fn cache_path(&self, album: &str) -> PathBuf {
        Path::new(&self.config.cache_dir).join(format!("{}.jpg", cache_key(album)))
    }

    /// Return the cached file if present, otherwise download and persist
    /// it. An existing cache entry short-circuits before any fetch.
    async fn fetch_or_cached(&self, url: &str, path: &Path) -> Option<PathBuf> {
        if path.exists() {
            return Some(path.to_path_buf());
        }

        let bytes = match self.client.get(url).send().await {
            Ok(r) if r.status().is_success() => r.bytes().await.ok()?,
            Ok(r) => {
                tracing::warn!("Cover download returned {}", r.status());
                return None;
            }
            Err(e) => {
                tracing::warn!("Cover download failed: {}", e);
                return None;
            }
        };

        if let Err(e) = tokio::fs::write(path, &bytes).await {
            tracing::warn!("Cannot write cover to {}: {}", path.display(), e);
            return None;
        }
        Some(path.to_path_buf())
    }
}

/// Among the search hits, the first whose artist matches exactly wins.
/// Matching is case-sensitive; relaxing it is a candidate change.
fn pick_cover(entries: &[AlbumEntry], artist: &str) -> Option<String> {
    entries
        .iter()
        .find(|entry| entry.artist.name == artist)
        .and_then(|entry| entry.cover_xl.clone())
}

/// Filesystem-safe cache key: strip the album name to alphanumerics and
/// spaces, then hyphenate the spaces.
fn cache_key(album: &str) -> String {
    album
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ')
        .collect::<String>()
        .replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(artist: &str, cover: Option<&str>) -> AlbumEntry {
        AlbumEntry {
            artist: ArtistEntry {
                name: artist.to_string(),
            },
            cover_xl: cover.map(str::to_string),
        }
    }

    fn test_config(cache_dir: &str) -> ArtworkConfig {
        ArtworkConfig {
            enabled: true,
            cache_dir: cache_dir.to_string(),
            probe_url: "http://127.0.0.1:1/".to_string(),
            search_url: "http://127.0.0.1:1/".to_string(),
            timeout_secs: 1,
        }
    }

    #[test]
    fn cache_key_strips_punctuation_and_hyphenates() {
        assert_eq!(cache_key("OK Computer"), "OK-Computer");
        assert_eq!(cache_key("What's Going On?"), "Whats-Going-On");
        assert_eq!(cache_key("1989 (Taylor's Version)"), "1989-Taylors-Version");
    }

    #[test]
    fn picks_first_exact_artist_match() {
        let entries = vec![
            entry("Other Band", Some("http://img/0.jpg")),
            entry("The Band", Some("http://img/1.jpg")),
            entry("The Band", Some("http://img/2.jpg")),
        ];
        assert_eq!(
            pick_cover(&entries, "The Band"),
            Some("http://img/1.jpg".to_string())
        );
    }

    #[test]
    fn artist_match_is_case_sensitive() {
        let entries = vec![entry("the band", Some("http://img/1.jpg"))];
        assert_eq!(pick_cover(&entries, "The Band"), None);
    }

    #[test]
    fn no_match_means_no_artwork() {
        assert_eq!(pick_cover(&[], "Anyone"), None);
        let entries = vec![entry("The Band", None)];
        assert_eq!(pick_cover(&entries, "The Band"), None);
    }

    #[tokio::test]
    async fn existing_cache_entry_skips_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArtworkResolver::new(test_config(dir.path().to_str().unwrap()));

        let cached = resolver.cache_path("OK Computer");
        std::fs::write(&cached, b"jpeg").unwrap();

        // The URL is unroutable; returning the path proves no fetch ran.
        let first = resolver
            .fetch_or_cached("http://127.0.0.1:1/cover.jpg", &cached)
            .await;
        let second = resolver
            .fetch_or_cached("http://127.0.0.1:1/cover.jpg", &cached)
            .await;
        assert_eq!(first.as_deref(), Some(cached.as_path()));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn failed_download_yields_no_artwork() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArtworkResolver::new(test_config(dir.path().to_str().unwrap()));
        let path = resolver.cache_path("Missing Album");
        assert_eq!(
            resolver
                .fetch_or_cached("http://127.0.0.1:1/cover.jpg", &path)
                .await,
            None
        );
    }
}
