//! Media sources: what a queue entry points at and how to turn it into audio.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serenity::async_trait;

use crate::error::ResolveError;

pub mod custom;
pub mod strategies;
pub mod youtube;

pub use custom::CustomSource;
pub use strategies::{ProviderCache, StrategySet, ytdlp::PlaylistItem};
pub use youtube::YouTube;

/// Normalized track metadata shared by every source kind and by the portable
/// queue format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Seconds; absent exactly when the track is a live broadcast.
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub channel_url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub is_live: bool,
}

impl TrackMetadata {
    /// Enforces `length.is_none() == is_live`.
    pub fn normalized(mut self) -> Self {
        if self.is_live {
            self.length = None;
        } else if self.length.is_none() {
            self.length = Some(0);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Custom,
    #[default]
    YouTube,
}

/// Something the voice transport can open.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamInfo {
    /// A direct media or manifest url; the transport opens the connection.
    Url {
        url: String,
        user_agent: Option<String>,
        is_live: bool,
    },
    /// A page url that the transport hands to yt-dlp itself.
    YtDlp { url: String },
}

impl StreamInfo {
    pub fn url(&self) -> &str {
        match self {
            StreamInfo::Url { url, .. } | StreamInfo::YtDlp { url } => url,
        }
    }
}

/// A resolved audio source attached to a queue entry.
#[derive(Debug, Clone)]
pub enum AudioSource {
    YouTube(YouTube),
    Custom(CustomSource),
}

impl AudioSource {
    pub fn metadata(&self) -> &TrackMetadata {
        match self {
            AudioSource::YouTube(y) => y.metadata(),
            AudioSource::Custom(c) => c.metadata(),
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            AudioSource::YouTube(_) => SourceType::YouTube,
            AudioSource::Custom(_) => SourceType::Custom,
        }
    }

    pub async fn fetch(&mut self, force_url: bool) -> Result<StreamInfo, ResolveError> {
        match self {
            AudioSource::YouTube(y) => y.fetch(force_url).await,
            AudioSource::Custom(c) => Ok(c.fetch()),
        }
    }

    /// Combined audio+video stream. Needs provider data retained by an
    /// earlier `fetch`; direct files are their own video.
    pub fn fetch_video(&self) -> Result<StreamInfo, ResolveError> {
        match self {
            AudioSource::YouTube(y) => y.fetch_video(),
            AudioSource::Custom(c) => Ok(c.fetch()),
        }
    }

    pub fn related(&self) -> &[TrackMetadata] {
        match self {
            AudioSource::YouTube(y) => y.related(),
            AudioSource::Custom(_) => &[],
        }
    }

    pub fn purge_cache(&mut self) {
        if let AudioSource::YouTube(y) = self {
            y.purge_cache();
        }
    }
}

/// Builds `AudioSource`s from urls, sharing one strategy set.
#[derive(Clone)]
pub struct SourceResolver {
    strategies: Arc<StrategySet>,
}

impl SourceResolver {
    pub fn new(strategies: Arc<StrategySet>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &Arc<StrategySet> {
        &self.strategies
    }

    /// Resolves `url`; with `prefetched` metadata no network call is made.
    pub async fn resolve(
        &self,
        url: &str,
        source_type: Option<SourceType>,
        prefetched: Option<TrackMetadata>,
        force_cache: bool,
    ) -> Result<AudioSource, ResolveError> {
        let kind = source_type.unwrap_or_else(|| classify(url));
        match kind {
            SourceType::Custom => Ok(AudioSource::Custom(CustomSource::new(url, prefetched)?)),
            SourceType::YouTube => {
                let mut source = YouTube::new(self.strategies.clone());
                source.init(url, prefetched, force_cache).await?;
                Ok(AudioSource::YouTube(source))
            }
        }
    }
}

/// Enumerates the entries of a playlist url without resolving each one.
#[async_trait]
pub trait PlaylistLister: Send + Sync {
    async fn list(&self, url: &str, limit: usize) -> anyhow::Result<Vec<PlaylistItem>>;
}

pub struct YtDlpPlaylists;

#[async_trait]
impl PlaylistLister for YtDlpPlaylists {
    async fn list(&self, url: &str, limit: usize) -> anyhow::Result<Vec<PlaylistItem>> {
        let playlist = strategies::ytdlp::list_playlist(url, limit).await?;
        let mut entries = playlist.entries;
        entries.truncate(limit);
        Ok(entries)
    }
}

/// True for urls carrying a `list=` query parameter.
pub fn is_playlist_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|u| u.query_pairs().any(|(k, v)| k == "list" && !v.is_empty()))
        .unwrap_or(false)
}

/// Chooses a source kind for a url without touching the network.
pub fn classify(url: &str) -> SourceType {
    if custom::is_raw_audio_url(url) {
        SourceType::Custom
    } else {
        SourceType::YouTube
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_tracks_have_no_length() {
        let meta = TrackMetadata {
            url: "u".into(),
            title: "t".into(),
            description: String::new(),
            length: Some(30),
            channel: String::new(),
            channel_url: None,
            thumbnail: None,
            is_live: true,
        }
        .normalized();
        assert_eq!(meta.length, None);

        let vod = TrackMetadata {
            is_live: false,
            length: None,
            ..meta
        }
        .normalized();
        assert_eq!(vod.length, Some(0));
    }

    #[test]
    fn playlist_urls_need_a_list_parameter() {
        assert!(is_playlist_url(
            "https://www.youtube.com/playlist?list=PL590L5WQmH8fJ54F369BLDSqIwcs-TCfs"
        ));
        assert!(is_playlist_url(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL590L5WQmH8fJ54F369BLDSqIwcs-TCfs"
        ));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(!is_playlist_url("not a url"));
    }

    #[test]
    fn classify_by_extension() {
        assert_eq!(classify("https://cdn.example.com/a/song.mp3"), SourceType::Custom);
        assert_eq!(
            classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            SourceType::YouTube
        );
    }
}
