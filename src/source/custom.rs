use url::Url;

use super::{StreamInfo, TrackMetadata};
use crate::error::ResolveError;

const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "wma", "mov", "mp4", "ogg", "m4a", "webm", "flac", "opus", "aac",
];

/// True for http(s) urls whose path ends in a known audio/video file extension.
pub fn is_raw_audio_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    url.path_segments()
        .and_then(|mut s| s.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// A direct link to an audio file.
#[derive(Debug, Clone)]
pub struct CustomSource {
    meta: TrackMetadata,
}

impl CustomSource {
    pub fn new(url: &str, prefetched: Option<TrackMetadata>) -> Result<Self, ResolveError> {
        if let Some(meta) = prefetched {
            return Ok(Self {
                meta: meta.normalized(),
            });
        }
        if !is_raw_audio_url(url) {
            return Err(ResolveError::Unsupported(url.to_string()));
        }
        let title = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(|n| n.to_string()))
            })
            .unwrap_or_else(|| url.to_string());
        let meta = TrackMetadata {
            url: url.to_string(),
            title,
            description: String::new(),
            length: None,
            channel: String::new(),
            channel_url: None,
            thumbnail: None,
            is_live: false,
        }
        .normalized();
        Ok(Self { meta })
    }

    pub fn metadata(&self) -> &TrackMetadata {
        &self.meta
    }

    pub fn fetch(&self) -> StreamInfo {
        StreamInfo::Url {
            url: self.meta.url.clone(),
            user_agent: None,
            is_live: false,
        }
    }
}
