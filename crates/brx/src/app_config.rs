//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." -- every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment: `BRX_*` environment variables (nested keys split on `__`), with an
//! optional TOML file layered on top. The file wins on conflicts.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{ElasticsearchStoreConfig, InMemoryStoreConfig};
use crate::frames::MergingFrame;
use crate::sources::{InMemoryEventSourceConfig, PipelineApiConfig};

/// 📦 One struct to rule them all: where the documents live, where the events come from,
/// and how hard to work.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub events: EventSourceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🗄️ Which document store to talk to.
#[derive(Debug, Deserialize, Clone)]
pub enum StoreConfig {
    Elasticsearch(ElasticsearchStoreConfig),
    InMemory(InMemoryStoreConfig),
}

/// 📡 Which usage-event source to ask.
#[derive(Debug, Deserialize, Clone)]
pub enum EventSourceConfig {
    PipelineApi(PipelineApiConfig),
    InMemory(InMemoryEventSourceConfig),
}

/// 🎛️ The knobs. Every one of them has a default, so `[runtime]` can be left out entirely.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 🏷️ First fragment of every index and alias name.
    pub index_prefix: String,
    /// 💾 Append-only watermark log.
    pub watermark_file: String,
    /// 🕰️ Where the very first cycle starts when there is no watermark yet.
    pub historical_start: DateTime<Utc>,
    pub sync_interval_secs: u64,
    /// 🧵 Upper bound on synchronizers running at once.
    pub worker_pool_size: usize,
    /// 📦 Bulk writer flush threshold.
    pub bulk_insert_size: usize,
    /// 📄 Terms buckets per loader page.
    pub aggregation_page_size: usize,
    /// 🔢 `size` of the terms aggregation. Effectively "all of them".
    pub entity_cardinality_limit: u64,
    /// 📅 Frames that get a merging synchronizer per entity.
    pub merge_frames: Vec<MergingFrame>,
    /// 🌱 Merge from the earliest source index instead of the window start.
    pub bootstrap: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            index_prefix: "billing".to_string(),
            watermark_file: "brx-watermark.log".to_string(),
            historical_start: Utc
                .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            sync_interval_secs: 3600,
            worker_pool_size: 4,
            bulk_insert_size: 1000,
            aggregation_page_size: 1000,
            entity_cardinality_limit: i32::MAX as u64,
            merge_frames: vec![MergingFrame::Month, MergingFrame::Year],
            bootstrap: false,
        }
    }
}

impl AppConfig {
    /// ✅ Reject the values that would make a cycle spin forever or do nothing at all.
    pub fn validate(&self) -> Result<()> {
        let runtime = &self.runtime;
        if runtime.worker_pool_size == 0 {
            bail!("💀 runtime.worker_pool_size must be at least 1. Zero workers get zero work done.");
        }
        if runtime.bulk_insert_size == 0 {
            bail!("💀 runtime.bulk_insert_size must be at least 1");
        }
        if runtime.aggregation_page_size == 0 {
            bail!("💀 runtime.aggregation_page_size must be at least 1");
        }
        if runtime.sync_interval_secs == 0 {
            bail!("💀 runtime.sync_interval_secs must be at least 1");
        }
        if runtime.index_prefix.is_empty() {
            bail!("💀 runtime.index_prefix must not be empty");
        }
        if runtime.merge_frames.contains(&MergingFrame::Day) {
            bail!("💀 runtime.merge_frames cannot contain Day: days are written by the daily synchronizers, not merged");
        }
        Ok(())
    }
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of hoping.
///
/// - `None` → env vars only.
/// - `Some(path)` → env vars + TOML file, merged. TOML wins on conflicts.
///
/// 💀 Unparseable or invalid config is an error with the file name in it.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("BRX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (BRX_*). \
             The file exists in our hearts, but apparently not in a shape serde recognises.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (BRX_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.validate()?;
    Ok(app_config)
}
