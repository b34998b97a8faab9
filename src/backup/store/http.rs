use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use serenity::async_trait;
use url::Url;

use super::KeyValueStore;
use crate::error::StoreError;

/// Key-value database over plain HTTP: `GET /{key}`, form `POST /` with
/// `key=value`, `DELETE /{key}`.
pub struct HttpStore {
    base: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(base: &str) -> Result<Self> {
        // validate early so a typo fails at startup
        Url::parse(base)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn key_url(&self, key: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        format!("{}/{}", self.base, encoded)
    }
}

#[async_trait]
impl KeyValueStore for HttpStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let resp = self.client.get(self.key_url(key)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        Ok((!body.is_empty()).then_some(body))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(&self.base)
            .form(&[(key, value)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StoreError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let resp = self.client.delete(self.key_url(key)).send().await?;
        // deleting an absent key is fine
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
