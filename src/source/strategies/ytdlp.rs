use std::{collections::HashMap, path::PathBuf, process::Stdio, sync::Arc};

use anyhow::{Context as AnyhowContext, Result, anyhow};
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use serenity::async_trait;
use tokio::{fs, process::Command as TokioCommand, sync::OnceCell};
use tracing::info;

use super::{FetchOutput, HTTP, InitOutput, MediaStrategy, ProviderCache};
use crate::{
    error::ResolveError,
    source::{StreamInfo, TrackMetadata},
};

pub const NAME: &str = "yt-dlp";

const GITHUB_RELEASES_API: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    assets: Vec<ReleaseAsset>,
}

fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| anyhow!("no cache dir available on this system"))?;
    Ok(base.join("chorus").join("yt-dlp"))
}

fn platform_asset_name() -> &'static str {
    if cfg!(target_os = "windows") {
        if cfg!(target_arch = "x86_64") {
            "yt-dlp.exe"
        } else {
            "yt-dlp_x86.exe"
        }
    } else if cfg!(target_os = "linux") {
        "yt-dlp_linux"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    }
}

static YTDLP_PATH: OnceCell<PathBuf> = OnceCell::const_new();

/// Finds yt-dlp on PATH or downloads the release binary into the cache dir.
pub async fn ensure_yt_dlp() -> Result<PathBuf> {
    YTDLP_PATH
        .get_or_try_init(|| async {
            if let Ok(p) = which::which("yt-dlp") {
                return Ok(p);
            }

            let dir = cache_dir()?;
            fs::create_dir_all(&dir).await.ok();

            let local = dir.join(if cfg!(target_os = "windows") {
                "yt-dlp.exe"
            } else {
                "yt-dlp"
            });
            if fs::try_exists(&local).await.unwrap_or(false) {
                return Ok(local);
            }

            let resp = HTTP
                .get(GITHUB_RELEASES_API)
                .header(ACCEPT, "application/vnd.github+json")
                .send()
                .await?
                .error_for_status()?;
            let rel: ReleaseInfo = resp.json().await?;

            let wanted = platform_asset_name();
            let asset = rel
                .assets
                .into_iter()
                .find(|a| a.name == wanted)
                .ok_or_else(|| anyhow!("no suitable yt-dlp asset for this platform: {}", wanted))?;

            let bytes = HTTP
                .get(asset.browser_download_url)
                .header(USER_AGENT, "chorus-bot/0.1")
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;

            fs::write(&local, &bytes).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(&local).await?.permissions();
                perms.set_mode(0o755);
                fs::set_permissions(&local, perms).await?;
            }
            info!("Downloaded yt-dlp to {}", local.display());
            Ok::<_, anyhow::Error>(local)
        })
        .await
        .cloned()
}

async fn run_json(args: &[&str], url: &str) -> Result<serde_json::Value> {
    let ytdlp = ensure_yt_dlp().await?;
    let out = TokioCommand::new(&ytdlp)
        .args(args)
        .arg(url)
        .stdin(Stdio::null())
        .output()
        .await
        .context("running yt-dlp")?;
    if !out.status.success() {
        return Err(anyhow!(
            "yt-dlp failed with status {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    serde_json::from_slice(&out.stdout).context("parsing yt-dlp json")
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct YtDlpFormat {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl YtDlpFormat {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }

    fn is_manifest(&self) -> bool {
        self.protocol.as_deref().is_some_and(|p| p.starts_with("m3u8"))
    }
}

/// The subset of `yt-dlp -J` output this bot reads.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct YtDlpInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel_url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub is_live: Option<bool>,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub release_timestamp: Option<i64>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<YtDlpFormat>,
}

impl YtDlpInfo {
    pub fn is_live_now(&self) -> bool {
        self.is_live.unwrap_or(false) || self.live_status.as_deref() == Some("is_live")
    }

    pub fn upcoming_timestamp(&self) -> Option<DateTime<Utc>> {
        if self.live_status.as_deref() != Some("is_upcoming") {
            return None;
        }
        self.release_timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
    }

    pub fn metadata(&self, url: &str) -> TrackMetadata {
        let is_live = self.is_live_now() || self.live_status.as_deref() == Some("is_upcoming");
        TrackMetadata {
            url: url.to_string(),
            title: self.title.clone(),
            description: self.description.clone().unwrap_or_default(),
            length: self.duration.map(|d| d.max(0.0) as u64),
            channel: self
                .channel
                .clone()
                .or_else(|| self.uploader.clone())
                .unwrap_or_default(),
            channel_url: self.channel_url.clone(),
            thumbnail: self.thumbnail.clone(),
            is_live,
        }
        .normalized()
    }

    /// Live content prefers the HLS manifest; otherwise highest-bitrate video format.
    pub fn best_video_url(&self) -> Option<String> {
        if self.is_live_now()
            && let Some(f) = self.formats.iter().rev().find(|f| f.is_manifest())
        {
            return f.manifest_url.clone().or_else(|| f.url.clone());
        }
        self.formats
            .iter()
            .filter(|f| f.has_video() && f.url.is_some())
            .max_by(|a, b| a.tbr.unwrap_or(0.0).total_cmp(&b.tbr.unwrap_or(0.0)))
            .and_then(|f| f.url.clone())
    }

    /// Audio-only format with the best bitrate, or the manifest for live content.
    pub fn best_audio(&self) -> Option<&YtDlpFormat> {
        if self.is_live_now() {
            return self.formats.iter().rev().find(|f| f.is_manifest());
        }
        self.formats
            .iter()
            .filter(|f| f.has_audio() && !f.has_video() && f.url.is_some())
            .max_by(|a, b| a.abr.unwrap_or(0.0).total_cmp(&b.abr.unwrap_or(0.0)))
    }
}

/// Shells out to yt-dlp for full video info.
pub struct YtDlpStrategy;

impl YtDlpStrategy {
    async fn dump(url: &str) -> Result<YtDlpInfo> {
        let value = run_json(
            &["-J", "--no-playlist", "--ignore-no-formats-error", "-q"],
            url,
        )
        .await?;
        serde_json::from_value(value).context("unexpected yt-dlp output")
    }
}

#[async_trait]
impl MediaStrategy for YtDlpStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn try_init(&self, url: &str) -> Result<InitOutput> {
        let info = Self::dump(url).await?;
        Ok(InitOutput {
            data: info.metadata(url),
            cache: Some(ProviderCache::YtDlp(Arc::new(info))),
        })
    }

    async fn try_fetch(
        &self,
        url: &str,
        force_url: bool,
        cache: Option<&ProviderCache>,
    ) -> Result<FetchOutput> {
        let info = match cache {
            Some(ProviderCache::YtDlp(info)) => info.clone(),
            _ => Arc::new(Self::dump(url).await?),
        };
        let meta = info.metadata(url);
        let stream = if force_url || meta.is_live {
            let format = info.best_audio().ok_or(ResolveError::NoPlayableUrl)?;
            let direct = format
                .manifest_url
                .clone()
                .filter(|_| meta.is_live)
                .or_else(|| format.url.clone())
                .ok_or(ResolveError::NoPlayableUrl)?;
            StreamInfo::Url {
                url: direct,
                user_agent: format.http_headers.get("User-Agent").cloned(),
                is_live: meta.is_live,
            }
        } else {
            StreamInfo::YtDlp {
                url: url.to_string(),
            }
        };
        Ok(FetchOutput {
            info: meta,
            stream,
            related: Vec::new(),
            cache: Some(ProviderCache::YtDlp(info)),
        })
    }
}

/// One entry of a flat playlist listing.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlaylistItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub entries: Vec<PlaylistItem>,
}

impl PlaylistItem {
    pub fn to_metadata(&self, no_description: &str) -> TrackMetadata {
        let url = self
            .url
            .clone()
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", self.id));
        TrackMetadata {
            url,
            title: self.title.clone().unwrap_or_default(),
            description: no_description.to_string(),
            length: self.duration.map(|d| d.max(0.0) as u64),
            channel: self
                .channel
                .clone()
                .or_else(|| self.uploader.clone())
                .unwrap_or_default(),
            channel_url: None,
            thumbnail: self.thumbnails.first().map(|t| t.url.clone()),
            is_live: self.live_status.as_deref() == Some("is_live"),
        }
        .normalized()
    }
}

/// Lists up to `limit` playlist entries without resolving each video.
pub async fn list_playlist(url: &str, limit: usize) -> Result<Playlist> {
    let end = limit.max(1).to_string();
    let value = run_json(
        &["-J", "--flat-playlist", "--playlist-end", end.as_str(), "-q"],
        url,
    )
    .await?;
    serde_json::from_value(value).context("unexpected yt-dlp playlist output")
}
