//! 📡 Usage-event sources: where raw billing events come from before they become documents.
//!
//! 🎬 *[a pipeline run finishes. somewhere, a meter stops ticking. somewhere else, an invoice
//! starts growing.]*
//!
//! The daily synchronizers ask one question: "what happened between `from` and `to`?"
//! A [`UsageEventSource`] answers it, either over HTTP against the pipeline REST API or from a
//! `Vec` in RAM. The [`EventSourceBackend`] enum dispatches so nobody has to care which.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::entities::BillingEntity;

pub mod in_mem;
pub mod pipeline_api;

pub use in_mem::{InMemoryEventSource, InMemoryEventSourceConfig};
pub use pipeline_api::{PipelineApiConfig, PipelineApiSource};

/// 📡 The contract: hand over every raw event of `entity` whose timestamp falls in `[from, to]`.
///
/// A failure here is a source read failure. It sinks the calling synchronizer and nobody else.
#[async_trait]
pub trait UsageEventSource: Debug + Send + Sync {
    async fn fetch_raw_events(
        &self,
        entity: BillingEntity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawUsageEvent>>;
}

/// 🏃 One billed slice of a compute run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunUsageEvent {
    /// 🔑 Stable event id. Replaying a window upserts by it.
    #[serde(default)]
    pub id: Option<String>,
    pub run_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub billing_center: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub usage_minutes: f64,
    pub cost: f64,
}

/// 🗄️ One billed slice of a storage's life.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsageEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub storage_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub storage_name: Option<String>,
    #[serde(default)]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub usage_bytes: u64,
    pub cost: f64,
}

/// 🧾 A raw usage event, straight from the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub enum RawUsageEvent {
    Run(RunUsageEvent),
    Storage(StorageUsageEvent),
}

impl RawUsageEvent {
    pub fn entity(&self) -> BillingEntity {
        match self {
            Self::Run(_) => BillingEntity::Run,
            Self::Storage(_) => BillingEntity::Storage,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Run(event) => event.timestamp,
            Self::Storage(event) => event.timestamp,
        }
    }

    /// 📅 The UTC day this event is billed to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp().date_naive()
    }
}

/// 🎭 Where the raw events come from this time.
#[derive(Debug)]
pub enum EventSourceBackend {
    InMemory(InMemoryEventSource),
    PipelineApi(PipelineApiSource),
}

#[async_trait]
impl UsageEventSource for EventSourceBackend {
    async fn fetch_raw_events(
        &self,
        entity: BillingEntity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawUsageEvent>> {
        match self {
            Self::InMemory(source) => source.fetch_raw_events(entity, from, to).await,
            Self::PipelineApi(source) => source.fetch_raw_events(entity, from, to).await,
        }
    }
}
