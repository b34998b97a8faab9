use anyhow::{Result, bail};
use serde::Deserialize;
use serenity::async_trait;

use super::{FetchOutput, HTTP, InitOutput, MediaStrategy, ProviderCache};
use crate::source::TrackMetadata;

pub const NAME: &str = "oembed";

const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";

#[derive(Debug, Deserialize)]
struct OEmbed {
    title: String,
    #[serde(default)]
    author_name: String,
    #[serde(default)]
    author_url: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
}

/// Metadata-only last resort: keeps a track queueable when every extractor is
/// down. It can never produce a stream.
pub struct OEmbedStrategy;

#[async_trait]
impl MediaStrategy for OEmbedStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn try_init(&self, url: &str) -> Result<InitOutput> {
        let embed: OEmbed = HTTP
            .get(OEMBED_ENDPOINT)
            .query(&[("url", url), ("format", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(InitOutput {
            data: TrackMetadata {
                url: url.to_string(),
                title: embed.title,
                description: String::new(),
                length: None,
                channel: embed.author_name,
                channel_url: embed.author_url,
                thumbnail: embed.thumbnail_url,
                is_live: false,
            }
            .normalized(),
            cache: None,
        })
    }

    async fn try_fetch(
        &self,
        _url: &str,
        _force_url: bool,
        _cache: Option<&ProviderCache>,
    ) -> Result<FetchOutput> {
        bail!("oembed only provides metadata")
    }
}
