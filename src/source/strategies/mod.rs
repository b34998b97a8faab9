//! Ordered extraction strategies for the video host, tried with fallback.

use std::{fmt, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serenity::async_trait;
use tracing::{debug, info, warn};

use super::{StreamInfo, TrackMetadata};
use crate::error::ResolveError;

pub mod oembed;
pub mod piped;
pub mod ytdlp;

pub use oembed::OEmbedStrategy;
pub use piped::{PipedStrategy, PipedStreams};
pub use ytdlp::{YtDlpInfo, YtDlpStrategy};

/// User agent sent when the transport opens a host-provided stream url.
pub const SECONDARY_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub(crate) static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("chorus-bot/0.1 (+https://github.com/)")
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .expect("client")
});

/// Raw provider response retained between `init` and `fetch`.
#[derive(Debug, Clone)]
pub enum ProviderCache {
    YtDlp(Arc<YtDlpInfo>),
    Piped(Arc<PipedStreams>),
}

impl ProviderCache {
    pub fn strategy_name(&self) -> &'static str {
        match self {
            ProviderCache::YtDlp(_) => ytdlp::NAME,
            ProviderCache::Piped(_) => piped::NAME,
        }
    }

    /// Scheduled start of a broadcast that has not begun yet.
    pub fn upcoming_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ProviderCache::YtDlp(info) => info.upcoming_timestamp(),
            ProviderCache::Piped(_) => None,
        }
    }

    /// Best combined audio+video url, for transports that want a video stream.
    pub fn video_stream(&self) -> Result<StreamInfo, ResolveError> {
        let (url, is_live) = match self {
            ProviderCache::YtDlp(info) => (info.best_video_url(), info.is_live_now()),
            ProviderCache::Piped(streams) => (streams.best_video_url(), streams.livestream),
        };
        let url = url.ok_or(ResolveError::NoPlayableUrl)?;
        Ok(StreamInfo::Url {
            url,
            user_agent: Some(SECONDARY_USER_AGENT.to_string()),
            is_live,
        })
    }
}

pub struct InitOutput {
    pub data: TrackMetadata,
    pub cache: Option<ProviderCache>,
}

#[derive(Debug)]
pub struct FetchOutput {
    pub info: TrackMetadata,
    pub stream: StreamInfo,
    pub related: Vec<TrackMetadata>,
    pub cache: Option<ProviderCache>,
}

/// One way of extracting metadata and streams from the host.
#[async_trait]
pub trait MediaStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn try_init(&self, url: &str) -> Result<InitOutput>;

    /// `cache` is whatever an earlier call retained; a strategy reuses it only
    /// when it produced it.
    async fn try_fetch(
        &self,
        url: &str,
        force_url: bool,
        cache: Option<&ProviderCache>,
    ) -> Result<FetchOutput>;
}

/// Fixed-priority list of strategies. Indices below `primary` are the normal
/// paths, anything at or above it is a degraded fallback.
pub struct StrategySet {
    strategies: Vec<Arc<dyn MediaStrategy>>,
    primary: usize,
}

impl fmt::Debug for StrategySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("StrategySet")
            .field("strategies", &names)
            .field("primary", &self.primary)
            .finish()
    }
}

impl StrategySet {
    pub fn new(strategies: Vec<Arc<dyn MediaStrategy>>, primary: usize) -> Self {
        Self {
            strategies,
            primary,
        }
    }

    /// yt-dlp, then Piped, then oEmbed metadata as the last resort.
    pub fn default_chain(piped_base: &str, primary: usize) -> Self {
        let strategies: Vec<Arc<dyn MediaStrategy>> = vec![
            Arc::new(YtDlpStrategy),
            Arc::new(PipedStrategy::new(piped_base)),
            Arc::new(OEmbedStrategy),
        ];
        Self::new(strategies, primary)
    }

    pub fn is_fallback(&self, resolved: usize) -> bool {
        resolved >= self.primary
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub async fn attempt_get_info(&self, url: &str) -> Result<(InitOutput, usize), ResolveError> {
        for (idx, strategy) in self.strategies.iter().enumerate() {
            match strategy.try_init(url).await {
                Ok(out) => {
                    debug!("strategy #{idx} ({}) resolved info for {url}", strategy.name());
                    if self.is_fallback(idx) {
                        warn!("fell back to strategy #{idx} ({}) for {url}", strategy.name());
                    }
                    return Ok((out, idx));
                }
                Err(e) => {
                    warn!("strategy #{idx} ({}) failed to get info: {e:#}", strategy.name());
                }
            }
        }
        Err(ResolveError::AllStrategiesFailed {
            url: url.to_string(),
            attempts: self.strategies.len(),
        })
    }

    pub async fn attempt_fetch(
        &self,
        url: &str,
        force_url: bool,
        cache: Option<&ProviderCache>,
    ) -> Result<(FetchOutput, usize), ResolveError> {
        // some strategy had data for the video but nothing we could stream
        let mut unplayable = false;
        for (idx, strategy) in self.strategies.iter().enumerate() {
            match strategy.try_fetch(url, force_url, cache).await {
                Ok(out) => {
                    info!(
                        "strategy #{idx} ({}) fetched {url}{}",
                        strategy.name(),
                        if self.is_fallback(idx) { " (fallback)" } else { "" }
                    );
                    return Ok((out, idx));
                }
                Err(e) => {
                    if let Some(ResolveError::NoPlayableUrl) = e.downcast_ref::<ResolveError>() {
                        unplayable = true;
                    }
                    warn!("strategy #{idx} ({}) failed to fetch: {e:#}", strategy.name());
                }
            }
        }
        if unplayable {
            return Err(ResolveError::NoPlayableUrl);
        }
        Err(ResolveError::AllStrategiesFailed {
            url: url.to_string(),
            attempts: self.strategies.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;

    pub fn meta(url: &str, title: &str) -> TrackMetadata {
        TrackMetadata {
            url: url.to_string(),
            title: title.to_string(),
            description: String::new(),
            length: Some(120),
            channel: "channel".to_string(),
            channel_url: None,
            thumbnail: None,
            is_live: false,
        }
    }

    /// Strategy that either always fails or answers with fixed metadata.
    pub struct FakeStrategy {
        pub name: &'static str,
        pub ok: bool,
        pub init_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
        pub cache: Option<ProviderCache>,
    }

    impl FakeStrategy {
        pub fn new(name: &'static str, ok: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                ok,
                init_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
                cache: None,
            })
        }

        pub fn with_cache(name: &'static str, cache: ProviderCache) -> Arc<Self> {
            Arc::new(Self {
                name,
                ok: true,
                init_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
                cache: Some(cache),
            })
        }
    }

    /// Reports a premiere scheduled two hours out on every init.
    pub struct Upcoming;

    #[async_trait]
    impl MediaStrategy for Upcoming {
        fn name(&self) -> &'static str {
            "upcoming"
        }

        async fn try_init(&self, url: &str) -> Result<InitOutput> {
            let info = YtDlpInfo {
                id: "premiere001".into(),
                title: "Premiere".into(),
                live_status: Some("is_upcoming".into()),
                release_timestamp: Some((Utc::now() + chrono::Duration::hours(2)).timestamp()),
                ..Default::default()
            };
            Ok(InitOutput {
                data: info.metadata(url),
                cache: Some(ProviderCache::YtDlp(Arc::new(info))),
            })
        }

        async fn try_fetch(
            &self,
            _url: &str,
            _force_url: bool,
            _cache: Option<&ProviderCache>,
        ) -> Result<FetchOutput> {
            Err(anyhow!("not live yet"))
        }
    }

    pub fn upcoming_set() -> Arc<StrategySet> {
        Arc::new(StrategySet::new(vec![Arc::new(Upcoming) as Arc<dyn MediaStrategy>], 2))
    }

    pub fn strategy_set(items: &[Arc<FakeStrategy>], primary: usize) -> Arc<StrategySet> {
        Arc::new(StrategySet::new(
            items
                .iter()
                .map(|s| s.clone() as Arc<dyn MediaStrategy>)
                .collect(),
            primary,
        ))
    }

    #[async_trait]
    impl MediaStrategy for FakeStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn try_init(&self, url: &str) -> Result<InitOutput> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if !self.ok {
                return Err(anyhow!("{} is down", self.name));
            }
            Ok(InitOutput {
                data: meta(url, self.name),
                cache: self.cache.clone(),
            })
        }

        async fn try_fetch(
            &self,
            url: &str,
            _force_url: bool,
            _cache: Option<&ProviderCache>,
        ) -> Result<FetchOutput> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if !self.ok {
                return Err(anyhow!("{} is down", self.name));
            }
            Ok(FetchOutput {
                info: meta(url, self.name),
                stream: StreamInfo::Url {
                    url: format!("https://stream.invalid/{}", self.name),
                    user_agent: None,
                    is_live: false,
                },
                related: vec![meta("https://www.youtube.com/watch?v=related0001", "related")],
                cache: self.cache.clone(),
            })
        }
    }
}
