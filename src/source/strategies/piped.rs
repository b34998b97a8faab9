use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use serde::Deserialize;
use serenity::async_trait;

use super::{FetchOutput, HTTP, InitOutput, MediaStrategy, ProviderCache, SECONDARY_USER_AGENT};
use crate::{
    error::ResolveError,
    source::{StreamInfo, TrackMetadata, youtube::video_id},
};

pub const NAME: &str = "piped";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedStream {
    pub url: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub bitrate: u64,
    #[serde(default)]
    pub video_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedRelated {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uploader_name: Option<String>,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// `/streams/{id}` response from a Piped API instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipedStreams {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub uploader_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub livestream: bool,
    #[serde(default)]
    pub hls: Option<String>,
    #[serde(default)]
    pub audio_streams: Vec<PipedStream>,
    #[serde(default)]
    pub video_streams: Vec<PipedStream>,
    #[serde(default)]
    pub related_streams: Vec<PipedRelated>,
}

impl PipedStreams {
    pub fn metadata(&self, url: &str) -> TrackMetadata {
        TrackMetadata {
            url: url.to_string(),
            title: self.title.clone(),
            description: self.description.clone(),
            length: u64::try_from(self.duration).ok(),
            channel: self.uploader.clone(),
            channel_url: self
                .uploader_url
                .as_ref()
                .map(|u| format!("https://www.youtube.com{u}")),
            thumbnail: self.thumbnail_url.clone(),
            is_live: self.livestream,
        }
        .normalized()
    }

    /// Highest-bitrate stream with a video mime type; the HLS manifest when
    /// nothing progressive is available.
    pub fn best_video_url(&self) -> Option<String> {
        if self.livestream && self.hls.is_some() {
            return self.hls.clone();
        }
        self.video_streams
            .iter()
            .filter(|s| s.mime_type.starts_with("video"))
            .max_by_key(|s| s.bitrate)
            .map(|s| s.url.clone())
            .or_else(|| self.hls.clone())
    }

    pub fn best_audio_url(&self) -> Option<String> {
        if self.livestream {
            return self.hls.clone();
        }
        self.audio_streams
            .iter()
            .max_by_key(|s| s.bitrate)
            .map(|s| s.url.clone())
            .or_else(|| self.hls.clone())
    }

    pub fn related(&self) -> Vec<TrackMetadata> {
        self.related_streams
            .iter()
            .filter(|r| r.kind.as_deref().unwrap_or("stream") == "stream")
            .map(|r| {
                TrackMetadata {
                    url: format!("https://www.youtube.com{}", r.url),
                    title: r.title.clone(),
                    description: String::new(),
                    length: u64::try_from(r.duration).ok(),
                    channel: r.uploader_name.clone().unwrap_or_default(),
                    channel_url: None,
                    thumbnail: r.thumbnail.clone(),
                    is_live: r.duration < 0,
                }
                .normalized()
            })
            .collect()
    }
}

/// Queries a Piped instance over HTTP.
pub struct PipedStrategy {
    base: String,
}

impl PipedStrategy {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn streams(&self, url: &str) -> Result<PipedStreams> {
        let id = video_id(url).ok_or_else(|| anyhow!("no video id in {url}"))?;
        HTTP.get(format!("{}/streams/{}", self.base, id))
            .send()
            .await?
            .error_for_status()?
            .json::<PipedStreams>()
            .await
            .context("decoding piped response")
    }
}

#[async_trait]
impl MediaStrategy for PipedStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn try_init(&self, url: &str) -> Result<InitOutput> {
        let streams = self.streams(url).await?;
        Ok(InitOutput {
            data: streams.metadata(url),
            cache: Some(ProviderCache::Piped(Arc::new(streams))),
        })
    }

    async fn try_fetch(
        &self,
        url: &str,
        _force_url: bool,
        cache: Option<&ProviderCache>,
    ) -> Result<FetchOutput> {
        let streams = match cache {
            Some(ProviderCache::Piped(s)) => s.clone(),
            _ => Arc::new(self.streams(url).await?),
        };
        let direct = streams.best_audio_url().ok_or(ResolveError::NoPlayableUrl)?;
        Ok(FetchOutput {
            info: streams.metadata(url),
            stream: StreamInfo::Url {
                url: direct,
                user_agent: Some(SECONDARY_USER_AGENT.to_string()),
                is_live: streams.livestream,
            },
            related: streams.related(),
            cache: Some(ProviderCache::Piped(streams)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "title": "Song",
        "description": "desc",
        "uploader": "Artist",
        "uploaderUrl": "/channel/UC123",
        "thumbnailUrl": "thumb",
        "duration": 215,
        "livestream": false,
        "hls": null,
        "audioStreams": [
            {"url": "a-low", "mimeType": "audio/mp4", "bitrate": 48000},
            {"url": "a-high", "mimeType": "audio/webm", "bitrate": 160000}
        ],
        "videoStreams": [
            {"url": "v-720", "mimeType": "video/mp4", "bitrate": 1500000, "videoOnly": false},
            {"url": "v-1080", "mimeType": "video/webm", "bitrate": 3000000, "videoOnly": true},
            {"url": "odd", "mimeType": "application/x-mpegURL", "bitrate": 9000000}
        ],
        "relatedStreams": [
            {"url": "/watch?v=rrrrrrrrrrr", "title": "Next", "uploaderName": "Other", "duration": 100, "type": "stream"},
            {"url": "/playlist?list=PL1", "title": "A list", "type": "playlist"}
        ]
    }"#;

    #[test]
    fn format_selection() {
        let s: PipedStreams = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(s.best_video_url().as_deref(), Some("v-1080"));
        assert_eq!(s.best_audio_url().as_deref(), Some("a-high"));
        let meta = s.metadata("https://www.youtube.com/watch?v=xxxxxxxxxxx");
        assert_eq!(meta.length, Some(215));
        assert_eq!(meta.channel_url.as_deref(), Some("https://www.youtube.com/channel/UC123"));
    }

    #[test]
    fn related_skips_playlists() {
        let s: PipedStreams = serde_json::from_str(SAMPLE).unwrap();
        let related = s.related();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].url, "https://www.youtube.com/watch?v=rrrrrrrrrrr");
    }

    #[tokio::test]
    async fn fetch_reuses_cache() {
        // the base url is unroutable, so any request would fail the fetch
        let strategy = PipedStrategy::new("http://127.0.0.1:9");
        let cache = ProviderCache::Piped(Arc::new(serde_json::from_str(SAMPLE).unwrap()));
        let out = strategy
            .try_fetch("https://www.youtube.com/watch?v=xxxxxxxxxxx", true, Some(&cache))
            .await
            .unwrap();
        assert_eq!(out.stream.url(), "a-high");
        assert_eq!(out.related.len(), 1);
    }

    #[tokio::test]
    async fn streams_without_audio_are_no_playable_url() {
        let strategy = PipedStrategy::new("http://127.0.0.1:9");
        let mut streams: PipedStreams = serde_json::from_str(SAMPLE).unwrap();
        streams.audio_streams.clear();
        let cache = ProviderCache::Piped(Arc::new(streams));
        let err = strategy
            .try_fetch("https://www.youtube.com/watch?v=xxxxxxxxxxx", false, Some(&cache))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ResolveError>(),
            Some(ResolveError::NoPlayableUrl)
        ));
    }

    #[test]
    fn live_uses_manifest() {
        let mut s: PipedStreams = serde_json::from_str(SAMPLE).unwrap();
        s.livestream = true;
        s.duration = -1;
        s.hls = Some("live.m3u8".into());
        assert_eq!(s.best_video_url().as_deref(), Some("live.m3u8"));
        assert_eq!(s.best_audio_url().as_deref(), Some("live.m3u8"));
        assert_eq!(s.metadata("u").length, None);
    }
}
