pub mod error;

pub use error::{ContentError, Result};

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use chek_common::{NormalizedItem, Platform, QueryReward};

/// Outcome of an ingestion upsert, as reported by the content service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Ok,
    Skipped,
    Failed,
}

/// Response envelope shared by every content-service ingest endpoint.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope<T> {
    success: bool,
    code: Option<String>,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct IngestData {
    status: Option<String>,
}

/// Client for the CHEK content service's `/v1/ingest` surface: external post
/// upserts and the adaptive crawler-query bank.
pub struct ContentClient {
    client: reqwest::Client,
    base_url: String,
    ingest_token: String,
}

impl ContentClient {
    pub fn new(base_url: &str, ingest_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ingest_token: ingest_token.trim().to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Option<T>> {
        let url = self.endpoint(path);
        let resp = self
            .client
            .post(&url)
            .header("x-ingest-token", &self.ingest_token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ContentError::Api {
                status: status.as_u16(),
                message: text.chars().take(500).collect(),
            });
        }

        let envelope: ResponseEnvelope<T> = serde_json::from_str(&text)
            .map_err(|e| ContentError::InvalidResponse(format!("{e}: {}", truncate(&text))))?;
        if !envelope.success {
            return Err(ContentError::Envelope {
                code: envelope.code.unwrap_or_else(|| "ERROR".to_string()),
                message: envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(envelope.data)
    }

    /// Upsert one normalized external post. The item is validated against the
    /// ingestion schema before any network call; a validation failure is an
    /// error the caller counts as `failed` without retrying.
    pub async fn ingest_external_post(&self, item: &NormalizedItem) -> Result<IngestStatus> {
        item.validate()
            .map_err(|e| ContentError::InvalidItem(e.to_string()))?;

        let body = serde_json::to_value(item)
            .map_err(|e| ContentError::InvalidItem(e.to_string()))?;
        let data: Option<IngestData> =
            self.post_json("v1/ingest/externalPosts:upsert", &body).await?;

        let status = match data.and_then(|d| d.status) {
            // The upsert succeeded; an envelope without an explicit status is
            // a plain ok.
            None => IngestStatus::Ok,
            Some(s) if s == "ok" => IngestStatus::Ok,
            Some(s) if s == "skipped" => IngestStatus::Skipped,
            Some(other) => {
                tracing::warn!(status = %other, "Unexpected ingest status from content service");
                IngestStatus::Failed
            }
        };
        Ok(status)
    }

    /// Seed the query bank with static keywords. Idempotent; a no-op on an
    /// empty list.
    pub async fn upsert_queries(&self, platform: Platform, queries: &[String]) -> Result<bool> {
        let queries: Vec<&str> = queries
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .collect();
        if queries.is_empty() {
            return Ok(false);
        }

        let body = serde_json::json!({ "platform": platform.as_str(), "queries": queries });
        self.post_json::<bool>("v1/ingest/crawlerQueries:upsert", &body)
            .await?;
        Ok(true)
    }

    /// Sample up to `limit` adaptively-weighted queries for a platform.
    pub async fn sample_queries(&self, platform: Platform, limit: u32) -> Result<Vec<String>> {
        let body = serde_json::json!({ "platform": platform.as_str(), "limit": limit });
        let data: Option<Vec<String>> = self
            .post_json("v1/ingest/crawlerQueries:sample", &body)
            .await?;

        Ok(data
            .unwrap_or_default()
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect())
    }

    /// Report per-query rewards for a platform in one batched call. A no-op
    /// on an empty list.
    pub async fn report_queries(&self, platform: Platform, items: &[QueryReward]) -> Result<bool> {
        if items.is_empty() {
            return Ok(false);
        }

        let body = serde_json::json!({ "platform": platform.as_str(), "items": items });
        self.post_json::<bool>("v1/ingest/crawlerQueries:report", &body)
            .await?;
        Ok(true)
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(500).collect()
}
