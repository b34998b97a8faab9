use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use url::Url;

use super::{ProviderCache, StrategySet, StreamInfo, TrackMetadata};
use crate::{cancellation::CancellationToken, error::ResolveError, metrics::METRICS};

/// Shortest pause between two live-status polls.
pub const LIVE_POLL_FLOOR: Duration = Duration::from_secs(20);

/// Extracts the 11-character video id from the usual url shapes.
pub fn video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" => {
            if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
                Some(v.into_owned())
            } else {
                let mut segs = url.path_segments()?;
                match segs.next() {
                    Some("shorts" | "live" | "embed" | "v") => segs.next().map(str::to_string),
                    _ => None,
                }
            }
        }
        _ => None,
    }?;
    let valid = candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(candidate)
}

/// Delay before re-checking a broadcast scheduled for `start`.
pub fn next_poll_delay(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (start - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(LIVE_POLL_FLOOR)
}

/// A video-host source resolved through the strategy chain.
#[derive(Debug, Clone)]
pub struct YouTube {
    strategies: Arc<StrategySet>,
    url: String,
    meta: TrackMetadata,
    strategy_id: Option<usize>,
    cache: Option<ProviderCache>,
    upcoming: Option<DateTime<Utc>>,
    related: Vec<TrackMetadata>,
}

impl YouTube {
    pub fn new(strategies: Arc<StrategySet>) -> Self {
        Self {
            strategies,
            url: String::new(),
            meta: TrackMetadata {
                url: String::new(),
                title: String::new(),
                description: String::new(),
                length: Some(0),
                channel: String::new(),
                channel_url: None,
                thumbnail: None,
                is_live: false,
            },
            strategy_id: None,
            cache: None,
            upcoming: None,
            related: Vec::new(),
        }
    }

    /// Resolves metadata. `prefetched` skips the network entirely; `force_cache`
    /// keeps the raw provider response for a later `fetch`.
    pub async fn init(
        &mut self,
        url: &str,
        prefetched: Option<TrackMetadata>,
        force_cache: bool,
    ) -> Result<&mut Self, ResolveError> {
        self.url = match video_id(url) {
            Some(id) => format!("https://www.youtube.com/watch?v={id}"),
            None => url.to_string(),
        };
        if let Some(data) = prefetched {
            self.import(data);
            return Ok(self);
        }

        let (out, resolved) = self.strategies.attempt_get_info(&self.url).await?;
        self.strategy_id = Some(resolved);
        if self.is_fallbacked() {
            METRICS.inc_fallbacks();
        }

        self.upcoming = out.cache.as_ref().and_then(ProviderCache::upcoming_timestamp);
        if force_cache {
            self.cache = out.cache;
        }
        self.import(out.data);
        Ok(self)
    }

    pub async fn fetch(&mut self, force_url: bool) -> Result<StreamInfo, ResolveError> {
        let (out, resolved) = self
            .strategies
            .attempt_fetch(&self.url, force_url, self.cache.as_ref())
            .await?;
        self.strategy_id = Some(resolved);
        if self.is_fallbacked() {
            METRICS.inc_fallbacks();
        }
        self.related = out.related;
        self.import(out.info);
        if force_url {
            info!("Returning a url instead of stream for {}", self.url);
        }
        if out.cache.is_some() {
            self.cache = out.cache;
        }
        Ok(out.stream)
    }

    /// Combined audio+video stream from the retained provider response.
    pub fn fetch_video(&self) -> Result<StreamInfo, ResolveError> {
        self.cache
            .as_ref()
            .ok_or(ResolveError::NoData)?
            .video_stream()
    }

    /// Polls until the scheduled broadcast starts or `abort` fires. `tick` is
    /// called around every poll so callers can report progress.
    pub async fn wait_for_live(
        &mut self,
        abort: &CancellationToken,
        mut tick: impl FnMut(),
    ) -> Result<(), ResolveError> {
        if self.upcoming.is_none() {
            return Err(ResolveError::NotUpcoming);
        }

        loop {
            if abort.is_cancelled() {
                return Ok(());
            }
            tick();

            let Some(start) = self.upcoming else {
                return Ok(());
            };
            let wait = next_poll_delay(start, Utc::now());
            info!("Retrying after {}ms", wait.as_millis());

            tokio::select! {
                _ = abort.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }

            tick();
            self.purge_cache();
            let url = self.url.clone();
            if let Err(e) = self.init(&url, None, false).await {
                warn!("failed to refresh upcoming stream {url}: {e}");
            }
        }
    }

    pub fn purge_cache(&mut self) {
        self.cache = None;
    }

    fn import(&mut self, data: TrackMetadata) {
        let mut data = data.normalized();
        data.url = self.url.clone();
        self.meta = data;
    }

    pub fn metadata(&self) -> &TrackMetadata {
        &self.meta
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn strategy_id(&self) -> Option<usize> {
        self.strategy_id
    }

    pub fn is_fallbacked(&self) -> bool {
        self.strategy_id
            .is_some_and(|id| self.strategies.is_fallback(id))
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    pub fn available_after(&self) -> Option<DateTime<Utc>> {
        self.upcoming
    }

    pub fn related(&self) -> &[TrackMetadata] {
        &self.related
    }
}
