//! # 🧾 brx: the billing roll-up agent
//!
//! 🎬 *[narrator voice]* "Every night, the invoices multiply. Every night, someone has to add them up."
//!
//! Raw usage events for compute runs and storages go into day indexes (runs twice: once per run,
//! once per run and billing center). Day indexes roll up into
//! month indexes, month indexes into year indexes, each summary rebuilt from scratch and swapped
//! in behind an alias so readers never see half a month.
//!
//! 🧠 Knowledge graph:
//! - [`frames`]: DAY/MONTH/YEAR period math and index-name suffixes
//! - [`entities`]: what we bill for, its mapping, its naming
//! - [`sources`]: where raw events come from
//! - [`backends`]: the document store (Elasticsearch or in-memory)
//! - [`loaders`]: paginated terms aggregations → pre-aggregated documents
//! - [`bulk`]: the flush-on-close bulk writer
//! - [`synchronizers`]: daily sync and the alias-swapping merge
//! - [`scheduler`]: two-phase cycles on a bounded worker pool, plus the watermark log
//! - [`report`]: what a cycle did
//! - [`app_config`]: figment-loaded configuration 🦆

pub mod app_config;
pub mod backends;
pub mod bulk;
pub mod common;
pub mod entities;
pub mod frames;
pub mod loaders;
pub mod report;
pub mod scheduler;
pub mod sources;
pub mod synchronizers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::app_config::{AppConfig, EventSourceConfig, StoreConfig};
use crate::backends::{ElasticsearchStore, InMemoryStore, StoreBackend};
use crate::entities::BillingEntity;
use crate::loaders::EntityDocumentLoader;
use crate::report::CycleReport;
use crate::scheduler::{Scheduler, WatermarkLog};
use crate::sources::{EventSourceBackend, InMemoryEventSource, PipelineApiSource};
use crate::synchronizers::{DailySynchronizer, MergingSynchronizer, SynchronizerDescriptor};

/// 🗄️ Build (and for Elasticsearch, ping) the configured document store.
pub async fn build_store(config: &StoreConfig) -> Result<StoreBackend> {
    match config {
        StoreConfig::InMemory(_) => Ok(StoreBackend::InMemory(InMemoryStore::new())),
        StoreConfig::Elasticsearch(es_config) => {
            let store = ElasticsearchStore::new(es_config.clone())?;
            store.ping().await?;
            Ok(StoreBackend::Elasticsearch(store))
        }
    }
}

pub fn build_event_source(config: &EventSourceConfig) -> Result<EventSourceBackend> {
    match config {
        EventSourceConfig::InMemory(_) => Ok(EventSourceBackend::InMemory(InMemoryEventSource::default())),
        EventSourceConfig::PipelineApi(api_config) => Ok(EventSourceBackend::PipelineApi(
            PipelineApiSource::new(api_config.clone())?,
        )),
    }
}

/// 🏗️ Wire every entity into the scheduler: one daily synchronizer each, plus one merging
/// synchronizer per configured frame.
pub fn build_scheduler(
    config: &AppConfig,
    store: Arc<StoreBackend>,
    source: Arc<EventSourceBackend>,
) -> Result<Scheduler> {
    let runtime = &config.runtime;
    let mut scheduler = Scheduler::new(
        runtime.worker_pool_size,
        runtime.historical_start,
        WatermarkLog::new(&runtime.watermark_file),
    );
    for entity in BillingEntity::ALL {
        scheduler.register_daily(Arc::new(DailySynchronizer::new(
            entity,
            runtime.index_prefix.as_str(),
            source.clone(),
            store.clone(),
            runtime.bulk_insert_size,
        )))?;
        let loader = EntityDocumentLoader::new(
            entity,
            runtime.aggregation_page_size,
            runtime.entity_cardinality_limit,
        );
        for frame in &runtime.merge_frames {
            let descriptor = SynchronizerDescriptor::new(runtime.index_prefix.as_str(), *frame, loader);
            let synchronizer = if runtime.bootstrap {
                MergingSynchronizer::initial(descriptor, store.clone(), runtime.bulk_insert_size)
            } else {
                MergingSynchronizer::new(descriptor, store.clone(), runtime.bulk_insert_size)
            };
            scheduler.register_merging(Arc::new(synchronizer))?;
        }
    }
    info!(synchronizers = ?scheduler.synchronizer_names(), "🏗️ scheduler wired");
    Ok(scheduler)
}

async fn prepare(config: &AppConfig) -> Result<Scheduler> {
    config.validate()?;
    let store = build_store(&config.store)
        .await
        .context("💀 Could not set up the document store")?;
    let source = build_event_source(&config.events).context("💀 Could not set up the event source")?;
    build_scheduler(config, Arc::new(store), Arc::new(source))
}

/// 🎯 One cycle, start to finish, watermark included.
pub async fn run_once(config: AppConfig) -> Result<CycleReport> {
    let scheduler = prepare(&config).await?;
    Ok(scheduler.tick(Utc::now()).await)
}

/// ⏰ A cycle every `sync_interval_secs` until Ctrl-C.
///
/// Each cycle is spawned and not awaited by the trigger loop, so a slow cycle does not delay
/// the next trigger. Overlap avoidance is the operator's business (pick an interval longer
/// than a cycle).
pub async fn run(config: AppConfig) -> Result<()> {
    let scheduler = Arc::new(prepare(&config).await?);
    let mut interval = tokio::time::interval(Duration::from_secs(config.runtime.sync_interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(every_secs = config.runtime.sync_interval_secs, "⏰ periodic mode engaged");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    let report = scheduler.tick(Utc::now()).await;
                    if !report.is_clean() {
                        warn!(failed = report.failures().count(), "⚠️ cycle finished with isolated failures");
                    }
                });
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("💀 Could not listen for Ctrl-C")?;
                info!("🛑 Ctrl-C received; no new cycles will be started");
                return Ok(());
            }
        }
    }
}
