//! 📅 The daily synchronizer: raw events in, day indexes out.
//!
//! Fetch every event of one entity for the window, group by UTC day, make sure each day index
//! exists, bulk-write one document per event. Document ids come from the events, so replaying
//! a window after a failed watermark write overwrites instead of double-billing anyone.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, info};

use crate::backends::{DocumentStore, StoreBackend};
use crate::bulk::BulkWriter;
use crate::common::{EntityDocument, SyncWindow};
use crate::entities::{self, BillingEntity};
use crate::frames::MergingFrame;
use crate::sources::{EventSourceBackend, UsageEventSource};
use crate::synchronizers::Synchronizer;

#[derive(Debug)]
pub struct DailySynchronizer {
    name: String,
    entity: BillingEntity,
    index_prefix: String,
    source: Arc<EventSourceBackend>,
    store: Arc<StoreBackend>,
    bulk_insert_size: usize,
}

impl DailySynchronizer {
    pub fn new(
        entity: BillingEntity,
        index_prefix: impl Into<String>,
        source: Arc<EventSourceBackend>,
        store: Arc<StoreBackend>,
        bulk_insert_size: usize,
    ) -> Self {
        Self {
            name: format!("{entity}-daily"),
            entity,
            index_prefix: index_prefix.into(),
            source,
            store,
            bulk_insert_size,
        }
    }
}

#[async_trait]
impl Synchronizer for DailySynchronizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synchronize(&self, window: SyncWindow) -> Result<()> {
        let events = self
            .source
            .fetch_raw_events(self.entity, window.from, window.to)
            .await
            .with_context(|| format!("💀 {} could not fetch raw {} events", self.name, self.entity))?;

        let mut days: BTreeMap<NaiveDate, Vec<EntityDocument>> = BTreeMap::new();
        for event in &events {
            days.entry(event.day())
                .or_default()
                .push(self.entity.day_document(event)?);
        }

        let mapping = self.entity.mapping();
        for (day, documents) in days {
            let index = entities::index_name(
                &self.index_prefix,
                self.entity,
                &MergingFrame::Day.period_of(day),
            );
            self.store
                .create_index(&index, &mapping)
                .await
                .with_context(|| format!("💀 Could not create day index '{index}'"))?;
            let mut writer = BulkWriter::open(&self.store, index.as_str(), self.bulk_insert_size);
            for document in documents {
                writer.add(document).await?;
            }
            let written = writer.close().await?;
            debug!(synchronizer = %self.name, index = %index, documents = written, "📅 day index updated");
        }

        info!(synchronizer = %self.name, events = events.len(), "✅ raw events synchronized");
        Ok(())
    }
}
