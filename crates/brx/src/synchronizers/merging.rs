//! # 🔀 THE MERGING SYNCHRONIZER
//!
//! 🎬 COLD OPEN: INT. CLUSTER, 00:00:07 ON THE FIRST OF THE MONTH
//!
//! Thirty-one day indexes stand in a row. Each one holds a day of receipts. The month alias
//! points at yesterday's build. A new physical index is born with a random name, filled with
//! one document per run, refreshed, and then, in a single request, the alias moves.
//! The old index is deleted. The dashboard never blinked.
//!
//! Per period, in ascending order:
//! 1. alias = `{prefix}-{entity}-{period}`, creating = alias + random suffix
//! 2. find the child-frame indexes that exist; none means nothing to build
//! 3. snapshot the alias target
//! 4. create `creating` from the entity mapping
//! 5. load aggregated documents from the children, bulk-write them into `creating`, refresh
//! 6. point the alias at `creating`, delete the old target
//!
//! 💀 Anything failing before the swap deletes `creating` (best effort) and leaves the alias
//! exactly where it was. A failure after the swap (deleting the old target) only warns: the
//! new index is live and correct, the old one is just wasting disk.
//!
//! Periods are isolated from each other. One bad month does not stop the next month.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::backends::{DocumentStore, StoreBackend};
use crate::bulk::BulkWriter;
use crate::common::SyncWindow;
use crate::entities;
use crate::frames::{MergingFrame, Period};
use crate::synchronizers::{Synchronizer, SynchronizerDescriptor};

/// 🚦 Where a merge starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStart {
    /// The window's `from` date. The regular, every-cycle behaviour.
    Window,
    /// The earliest child-frame index in the store, whatever the window says. For bootstrapping.
    EarliestSource,
}

/// 🧾 What one merge run did, period by period.
#[derive(Debug, Default)]
pub struct MergeSummary {
    pub merged: Vec<(Period, usize)>,
    pub skipped: Vec<Period>,
    pub failed: Vec<(Period, anyhow::Error)>,
}

enum PeriodOutcome {
    Merged(usize),
    NoSources,
}

#[derive(Debug)]
pub struct MergingSynchronizer {
    descriptor: SynchronizerDescriptor,
    store: Arc<StoreBackend>,
    bulk_insert_size: usize,
    start: MergeStart,
}

impl MergingSynchronizer {
    pub fn new(descriptor: SynchronizerDescriptor, store: Arc<StoreBackend>, bulk_insert_size: usize) -> Self {
        Self {
            descriptor,
            store,
            bulk_insert_size,
            start: MergeStart::Window,
        }
    }

    /// 🌱 The bootstrap flavour: ignores the window's `from` and starts at the oldest source data.
    pub fn initial(descriptor: SynchronizerDescriptor, store: Arc<StoreBackend>, bulk_insert_size: usize) -> Self {
        Self {
            start: MergeStart::EarliestSource,
            ..Self::new(descriptor, store, bulk_insert_size)
        }
    }

    pub fn start(&self) -> MergeStart {
        self.start
    }

    fn child_frame(&self) -> Result<MergingFrame> {
        self.descriptor.frame.child_frame().with_context(|| {
            format!(
                "💀 {} merges into {}, which has no child frame to merge from",
                self.descriptor.name, self.descriptor.frame
            )
        })
    }

    /// 🔍 Start of the earliest period of `frame` that has an index in the store.
    async fn earliest_index_date(&self, frame: MergingFrame) -> Result<Option<NaiveDate>> {
        let base = self.descriptor.index_base();
        let names = self
            .store
            .list_index_names(&self.descriptor.source_index_pattern())
            .await
            .with_context(|| format!("💀 Could not list '{base}' indexes"))?;
        Ok(names
            .iter()
            .filter_map(|name| frame.period_from_index_name(&base, name))
            .map(|period| period.start())
            .min())
    }

    /// 🗓️ Merge every period touched by `[from, to]`.
    ///
    /// A missing `from` means "the first existing summary index of this frame", then "today".
    /// A missing `to` means today.
    pub async fn merge_range(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<MergeSummary> {
        let today = Utc::now().date_naive();
        let from = match from {
            Some(from) => from,
            None => self
                .earliest_index_date(self.descriptor.frame)
                .await?
                .unwrap_or(today),
        };
        let to = to.unwrap_or(today);
        let frame = self.descriptor.frame;
        debug!(synchronizer = %self.descriptor.name, %frame, %from, %to, "🗓️ merge range resolved");

        let mut summary = MergeSummary::default();
        for period in frame.periods(from, to) {
            match self.merge_period(period).await {
                Ok(PeriodOutcome::Merged(documents)) => summary.merged.push((period, documents)),
                Ok(PeriodOutcome::NoSources) => summary.skipped.push(period),
                Err(err) => {
                    error!(
                        synchronizer = %self.descriptor.name,
                        period = %period.name(),
                        "💀 period merge failed: {err:#}"
                    );
                    summary.failed.push((period, err));
                }
            }
        }
        Ok(summary)
    }

    /// 🔀 The build-new, swap-alias, delete-old dance for one period.
    async fn merge_period(&self, period: Period) -> Result<PeriodOutcome> {
        let descriptor = &self.descriptor;
        let alias = entities::index_name(&descriptor.index_prefix, descriptor.entity(), &period);
        let base = descriptor.index_base();

        let mut sources = Vec::new();
        for name in descriptor.frame.sub_period_names_of(&period)? {
            let child = format!("{base}-{name}");
            if self
                .store
                .index_exists(&child)
                .await
                .with_context(|| format!("💀 Could not check whether '{child}' exists"))?
            {
                sources.push(child);
            }
        }
        if sources.is_empty() {
            debug!(alias = %alias, "💤 no child indexes, nothing to merge");
            return Ok(PeriodOutcome::NoSources);
        }

        let creating = entities::unique_physical_name(&alias);
        let existing = self
            .store
            .resolve_alias(&alias)
            .await
            .with_context(|| format!("💀 Could not resolve alias '{alias}'"))?;

        let documents = match self.build_and_swap(&period, &alias, &creating, sources).await {
            Ok(documents) => documents,
            Err(err) => {
                if let Err(cleanup) = self.store.delete_index(&creating).await {
                    warn!(index = %creating, "⚠️ could not clean up half-built index: {cleanup:#}");
                }
                return Err(err);
            }
        };

        if let Some(old) = existing.filter(|old| *old != creating) {
            match self.store.delete_index(&old).await {
                Ok(()) => debug!(index = %old, "🗑️ previous index deleted"),
                Err(err) => warn!(index = %old, alias = %alias, "⚠️ alias moved but the old index could not be deleted: {err:#}"),
            }
        }
        info!(
            synchronizer = %descriptor.name,
            alias = %alias,
            index = %creating,
            documents,
            "✅ period merged"
        );
        Ok(PeriodOutcome::Merged(documents))
    }

    async fn build_and_swap(
        &self,
        period: &Period,
        alias: &str,
        creating: &str,
        sources: Vec<String>,
    ) -> Result<usize> {
        let entity = self.descriptor.entity();
        self.store
            .create_index(creating, &entity.mapping())
            .await
            .with_context(|| format!("💀 Could not create '{creating}'"))?;

        let pages = self
            .descriptor
            .loader
            .load(self.store.clone(), period.start(), period.end(), sources)
            .into_stream();
        let documents = BulkWriter::open(&self.store, creating, self.bulk_insert_size)
            .write_pages(pages)
            .await
            .with_context(|| format!("💀 Could not fill '{creating}' for alias '{alias}'"))?;

        self.store
            .refresh(creating)
            .await
            .with_context(|| format!("💀 Could not refresh '{creating}'"))?;
        self.store
            .set_alias(creating, alias)
            .await
            .with_context(|| format!("💀 Could not point '{alias}' at '{creating}'"))?;
        Ok(documents)
    }
}

#[async_trait]
impl Synchronizer for MergingSynchronizer {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn frame(&self) -> Option<MergingFrame> {
        Some(self.descriptor.frame)
    }

    async fn synchronize(&self, window: SyncWindow) -> Result<()> {
        let from = match self.start {
            MergeStart::Window => Some(window.from_date()),
            MergeStart::EarliestSource => {
                let child = self.child_frame()?;
                Some(
                    self.earliest_index_date(child)
                        .await?
                        .unwrap_or(window.to_date()),
                )
            }
        };
        let summary = self.merge_range(from, Some(window.to_date())).await?;
        info!(
            synchronizer = %self.descriptor.name,
            merged = summary.merged.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "🔀 merge run finished"
        );
        let total = summary.merged.len() + summary.skipped.len() + summary.failed.len();
        let mut failed = summary.failed;
        match failed.len() {
            0 => Ok(()),
            1 => {
                let (period, err) = failed.remove(0);
                Err(err.context(format!(
                    "💀 {} failed to merge {}",
                    self.descriptor.name,
                    period.name()
                )))
            }
            count => {
                let reasons: Vec<String> = failed
                    .iter()
                    .map(|(period, err)| format!("{}: {err:#}", period.name()))
                    .collect();
                bail!(
                    "💀 {} failed to merge {count} of {total} periods: {}",
                    self.descriptor.name,
                    reasons.join(" | ")
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::common::EntityDocument;
    use crate::entities::{BillingEntity, DATE_FIELD};
    use crate::loaders::EntityDocumentLoader;
    use chrono::TimeZone;
    use serde_json::{Map, json};

    fn run_doc(id: &str, run_id: u64, cost: f64, day: &str) -> EntityDocument {
        let mut fields = Map::new();
        fields.insert("run_id".into(), json!(run_id));
        fields.insert("owner".into(), json!("alice"));
        fields.insert("cost".into(), json!(cost));
        fields.insert("usage_minutes".into(), json!(10.0));
        fields.insert(DATE_FIELD.into(), json!(day));
        EntityDocument::new(id, fields)
    }

    fn synchronizer(peek: &InMemoryStore, frame: MergingFrame, bulk_insert_size: usize) -> MergingSynchronizer {
        let loader = EntityDocumentLoader::new(BillingEntity::Run, 1000, 2_147_483_647);
        MergingSynchronizer::new(
            SynchronizerDescriptor::new("billing", frame, loader),
            Arc::new(StoreBackend::InMemory(peek.clone())),
            bulk_insert_size,
        )
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seed_january(peek: &InMemoryStore) {
        peek
            .seed(
                "billing-run-2024-01-01",
                vec![run_doc("a", 1, 3.50, "2024-01-01"), run_doc("b", 2, 1.25, "2024-01-01")],
            )
            .await;
    }

    #[tokio::test]
    async fn the_one_where_january_rolls_up_into_one_month_index() -> Result<()> {
        let peek = InMemoryStore::new();
        seed_january(&peek).await;
        // 🧓 a previous build already holds the alias
        peek.create_index("billing-run-2024-01m-old", &json!({})).await?;
        peek.set_alias("billing-run-2024-01m-old", "billing-run-2024-01m").await?;

        let sync = synchronizer(&peek, MergingFrame::Month, 1000);
        let summary = sync.merge_range(Some(ymd(2024, 1, 1)), Some(ymd(2024, 1, 31))).await?;
        assert_eq!(summary.merged.len(), 1);

        let live = peek
            .resolve_alias("billing-run-2024-01m")
            .await?
            .expect("💀 the alias should exist after the merge");
        assert!(live.starts_with("billing-run-2024-01m-"));
        assert_ne!(live, "billing-run-2024-01m-old");
        assert_eq!(peek.mapping(&live).await, Some(BillingEntity::Run.mapping()));

        let documents = peek.documents("billing-run-2024-01m").await.unwrap_or_default();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents["1"]["cost"], json!(3.5));
        assert_eq!(documents["2"]["cost"], json!(1.25));
        assert!(!peek.index_exists("billing-run-2024-01m-old").await?);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_merging_twice_changes_nothing_but_the_suffix() -> Result<()> {
        let peek = InMemoryStore::new();
        seed_january(&peek).await;
        let sync = synchronizer(&peek, MergingFrame::Month, 1000);

        sync.merge_range(Some(ymd(2024, 1, 1)), Some(ymd(2024, 1, 1))).await?;
        let first_index = peek.resolve_alias("billing-run-2024-01m").await?;
        let first = peek.documents("billing-run-2024-01m").await;

        sync.merge_range(Some(ymd(2024, 1, 1)), Some(ymd(2024, 1, 1))).await?;
        let second_index = peek.resolve_alias("billing-run-2024-01m").await?;
        let second = peek.documents("billing-run-2024-01m").await;

        assert_eq!(first, second);
        assert_ne!(first_index, second_index);
        // 🧹 only the day index and the live month index remain
        assert_eq!(peek.index_names().await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_crash_mid_write_leaves_readers_on_the_old_index() -> Result<()> {
        let peek = InMemoryStore::new();
        let many: Vec<EntityDocument> = (1..=10)
            .map(|run_id| run_doc(&format!("d{run_id}"), run_id, 1.0, "2024-01-01"))
            .collect();
        peek.seed("billing-run-2024-01-01", many).await;
        let sync = synchronizer(&peek, MergingFrame::Month, 3);
        sync.merge_range(Some(ymd(2024, 1, 1)), Some(ymd(2024, 1, 1))).await?;
        let before_index = peek.resolve_alias("billing-run-2024-01m").await?;
        let before = peek.documents("billing-run-2024-01m").await;

        // 💣 new data arrives, and the rebuild dies at document 7 of 11
        peek
            .seed("billing-run-2024-01-02", vec![run_doc("late", 11, 9.0, "2024-01-02")])
            .await;
        peek.fail_bulk_at_document(7).await;
        let window = SyncWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        assert!(sync.synchronize(window).await.is_err());

        assert_eq!(peek.resolve_alias("billing-run-2024-01m").await?, before_index);
        assert_eq!(peek.documents("billing-run-2024-01m").await, before);
        // 🧹 the half-built index is gone
        assert_eq!(peek.index_names().await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_year_is_built_from_its_months() -> Result<()> {
        let peek = InMemoryStore::new();
        peek
            .seed("billing-run-2024-01-01", vec![run_doc("a", 1, 2.0, "2024-01-01")])
            .await;
        peek
            .seed("billing-run-2024-03-15", vec![run_doc("b", 1, 1.0, "2024-03-15")])
            .await;
        let month = synchronizer(&peek, MergingFrame::Month, 1000);
        let year = synchronizer(&peek, MergingFrame::Year, 1000);

        let months = month.merge_range(Some(ymd(2024, 1, 1)), Some(ymd(2024, 12, 31))).await?;
        assert_eq!(months.merged.len(), 2);
        assert_eq!(months.skipped.len(), 10);

        year.merge_range(Some(ymd(2024, 6, 1)), Some(ymd(2024, 6, 1))).await?;
        let documents = peek.documents("billing-run-2024y").await.unwrap_or_default();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents["1"]["cost"], json!(3.0));
        assert_eq!(documents["1"]["usage_minutes"], json!(20.0));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_bad_month_does_not_spoil_the_next() -> Result<()> {
        let peek = InMemoryStore::new();
        peek
            .seed("billing-run-2024-01-01", vec![run_doc("a", 1, 1.0, "2024-01-01")])
            .await;
        peek
            .seed("billing-run-2024-02-01", vec![run_doc("b", 2, 1.0, "2024-02-01")])
            .await;
        peek.make_unsearchable("billing-run-2024-01-01").await;

        let sync = synchronizer(&peek, MergingFrame::Month, 1000);
        let summary = sync.merge_range(Some(ymd(2024, 1, 1)), Some(ymd(2024, 2, 29))).await?;

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.merged.len(), 1);
        assert_eq!(peek.resolve_alias("billing-run-2024-01m").await?, None);
        assert!(peek.resolve_alias("billing-run-2024-02m").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bootstrap_starts_at_the_oldest_day_on_record() -> Result<()> {
        let peek = InMemoryStore::new();
        peek
            .seed("billing-run-2023-11-20", vec![run_doc("a", 1, 1.0, "2023-11-20")])
            .await;
        seed_january(&peek).await;
        let loader = EntityDocumentLoader::new(BillingEntity::Run, 1000, 2_147_483_647);
        let sync = MergingSynchronizer::initial(
            SynchronizerDescriptor::new("billing", MergingFrame::Month, loader),
            Arc::new(StoreBackend::InMemory(peek.clone())),
            1000,
        );
        assert_eq!(sync.start(), MergeStart::EarliestSource);

        // 🪟 the window claims January only; the bootstrap does not care
        let window = SyncWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
        );
        sync.synchronize(window).await?;
        assert!(peek.resolve_alias("billing-run-2023-11m").await?.is_some());
        assert!(peek.resolve_alias("billing-run-2024-01m").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_no_from_means_the_first_summary_on_record() -> Result<()> {
        let peek = InMemoryStore::new();
        peek
            .seed("billing-run-2023-12-05", vec![run_doc("a", 1, 1.0, "2023-12-05")])
            .await;
        peek.create_index("billing-run-2023-12m-0ld", &json!({})).await?;
        peek.set_alias("billing-run-2023-12m-0ld", "billing-run-2023-12m").await?;

        let sync = synchronizer(&peek, MergingFrame::Month, 1000);
        let summary = sync.merge_range(None, Some(ymd(2024, 1, 31))).await?;
        assert_eq!(
            summary.merged.first().map(|(period, _)| period.name()),
            Some("2023-12m".to_string())
        );
        assert_eq!(summary.skipped.len(), 1);
        Ok(())
    }
}
