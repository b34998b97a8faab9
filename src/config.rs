use std::time::Duration;

use anyhow::{Result, anyhow};
use songbird::driver::MixMode;

pub const DEFAULT_PIPED_URL: &str = "https://pipedapi.kavin.rocks";

pub fn read_discord_token() -> Result<String> {
    const CANDIDATES: &[&str] = &[
        "DISCORD_TOKEN",
        "DISCORD_BOT_TOKEN",
        "BOT_TOKEN",
        "DOCKER_TOKEN",
    ];
    for key in CANDIDATES {
        if let Ok(val) = std::env::var(key)
            && !val.is_empty()
        {
            return Ok(val);
        }
    }
    Err(anyhow!(
        "Set one of DISCORD_TOKEN, DISCORD_BOT_TOKEN, BOT_TOKEN, or DOCKER_TOKEN in environment"
    ))
}

/// Process settings read from `CHORUS_*` environment variables. Out-of-range
/// or unparsable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: String,
    pub primary_strategies: usize,
    pub piped_url: String,
    pub backup_url: Option<String>,
    pub backup_interval: Duration,
    pub max_queue: usize,
    pub bitrate: u32,
    pub mix_mode: MixMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: ">".to_string(),
            primary_strategies: 2,
            piped_url: DEFAULT_PIPED_URL.to_string(),
            backup_url: None,
            backup_interval: Duration::from_secs(60),
            max_queue: 999,
            bitrate: 96_000,
            mix_mode: MixMode::Stereo,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let num = |key: &str| get(key).and_then(|s| s.trim().parse::<u64>().ok());
        let text = |key: &str| get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        Self {
            prefix: text("CHORUS_PREFIX").unwrap_or(defaults.prefix),
            primary_strategies: num("CHORUS_PRIMARY_STRATEGIES")
                .map(|v| v as usize)
                .unwrap_or(defaults.primary_strategies),
            piped_url: text("CHORUS_PIPED_URL").unwrap_or(defaults.piped_url),
            backup_url: text("CHORUS_BACKUP_URL"),
            backup_interval: num("CHORUS_BACKUP_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.backup_interval),
            max_queue: num("CHORUS_MAX_QUEUE")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_queue),
            bitrate: num("CHORUS_BITRATE")
                .filter(|v| (16_000..=192_000).contains(v))
                .map(|v| v as u32)
                .unwrap_or(defaults.bitrate),
            mix_mode: match text("CHORUS_MIX_MODE").as_deref() {
                Some("mono") => MixMode::Mono,
                _ => MixMode::Stereo,
            },
        }
    }
}
