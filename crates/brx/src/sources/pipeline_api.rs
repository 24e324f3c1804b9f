//! 📡 The pipeline REST API as a usage-event source.
//!
//! 🎬 *[the API returns 200 OK. the body says `"status": "ERROR"`. the on-call engineer stares
//! into the middle distance.]*
//!
//! Every response comes wrapped in an envelope: `{"status": "OK", "payload": [...]}`. A non-2xx
//! HTTP status and a non-`OK` envelope status are both source read failures. We check both,
//! because the API has been known to lie with a straight face.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::entities::BillingEntity;
use crate::sources::{RawUsageEvent, RunUsageEvent, StorageUsageEvent, UsageEventSource};

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineApiConfig {
    /// 📡 Base URL of the API, e.g. `https://pipeline.example.org/pipeline`.
    pub url: String,
    /// 🔒 Bearer token. Optional, because some dev stacks are very trusting.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_run_events_path")]
    pub run_events_path: String,
    #[serde(default = "default_storage_events_path")]
    pub storage_events_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_run_events_path() -> String {
    "/restapi/billing/runs".to_string()
}

fn default_storage_events_path() -> String {
    "/restapi/billing/storages".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    message: Option<String>,
    payload: Option<Vec<T>>,
}

#[derive(Debug)]
pub struct PipelineApiSource {
    client: reqwest::Client,
    config: PipelineApiConfig,
}

impl PipelineApiSource {
    pub fn new(config: PipelineApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 Could not build the HTTP client for the pipeline API")?;
        Ok(Self { client, config })
    }

    fn events_url(&self, path: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        format!(
            "{}/{}?from={}&to={}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/'),
            from.to_rfc3339_opts(SecondsFormat::Secs, true),
            to.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    async fn fetch<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(ref token) = self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("💀 Pipeline API at '{url}' did not pick up the phone"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("💀 Pipeline API at '{url}' hung up mid-sentence"))?;
        if !status.is_success() {
            bail!("💀 Pipeline API at '{url}' answered {status}: {body}");
        }
        let envelope: Envelope<T> = serde_json::from_str(&body)
            .with_context(|| format!("💀 Pipeline API at '{url}' sent something that is not an envelope"))?;
        if envelope.status != "OK" {
            bail!(
                "💀 Pipeline API at '{url}' said '{}': {}",
                envelope.status,
                envelope.message.unwrap_or_default()
            );
        }
        Ok(envelope.payload.unwrap_or_default())
    }
}

#[async_trait]
impl UsageEventSource for PipelineApiSource {
    async fn fetch_raw_events(
        &self,
        entity: BillingEntity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawUsageEvent>> {
        let events: Vec<RawUsageEvent> = match entity.event_kind() {
            BillingEntity::Run | BillingEntity::RunBillingCenter => {
                let url = self.events_url(&self.config.run_events_path, from, to);
                self.fetch::<RunUsageEvent>(url)
                    .await?
                    .into_iter()
                    .map(RawUsageEvent::Run)
                    .collect()
            }
            BillingEntity::Storage => {
                let url = self.events_url(&self.config.storage_events_path, from, to);
                self.fetch::<StorageUsageEvent>(url)
                    .await?
                    .into_iter()
                    .map(RawUsageEvent::Storage)
                    .collect()
            }
        };
        debug!(entity = %entity, events = events.len(), "📡 fetched raw usage events");
        Ok(events)
    }
}
