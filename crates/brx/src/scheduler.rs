//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where day indexes pile up unmerged..."
//! 🎬 "One scheduler dared to roll them all up."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The scheduler runs one cycle per trigger:
//!
//! 1. window = `[last watermark or historical start, now]`
//! 2. **sync phase**: every daily synchronizer, concurrently, on the worker pool
//! 3. **merge phase**: merging synchronizers grouped by frame, groups in ascending frame
//!    duration (MONTH before YEAR), synchronizers within a group concurrently
//! 4. append the new watermark
//!
//! Each phase and each frame group is a hard barrier: YEAR never reads a MONTH index that the
//! same cycle is still writing. Failures are isolated per synchronizer and end up in the
//! [`CycleReport`], never in a panic.
//!
//! ⚠️ The workers are the scheduler's private minions. `workers` stays private.

mod watermark;
mod workers;

pub use watermark::WatermarkLog;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::common::SyncWindow;
use crate::frames::MergingFrame;
use crate::report::{CycleReport, Phase, SyncState};
use crate::synchronizers::Synchronizer;

#[derive(Debug)]
pub struct Scheduler {
    daily: Vec<Arc<dyn Synchronizer>>,
    merging: BTreeMap<MergingFrame, Vec<Arc<dyn Synchronizer>>>,
    worker_pool_size: usize,
    historical_start: DateTime<Utc>,
    watermark: WatermarkLog,
}

impl Scheduler {
    pub fn new(worker_pool_size: usize, historical_start: DateTime<Utc>, watermark: WatermarkLog) -> Self {
        Self {
            daily: Vec::new(),
            merging: BTreeMap::new(),
            worker_pool_size: worker_pool_size.max(1),
            historical_start,
            watermark,
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn Synchronizer>> {
        self.daily.iter().chain(self.merging.values().flatten())
    }

    fn ensure_unique(&self, synchronizer: &dyn Synchronizer) -> Result<()> {
        if self.all().any(|known| known.name() == synchronizer.name()) {
            bail!(
                "💀 A synchronizer named '{}' is already registered. Two of them would race for the same aliases.",
                synchronizer.name()
            );
        }
        Ok(())
    }

    /// ➕ Add a sync-phase synchronizer.
    pub fn register_daily(&mut self, synchronizer: Arc<dyn Synchronizer>) -> Result<()> {
        self.ensure_unique(synchronizer.as_ref())?;
        self.daily.push(synchronizer);
        Ok(())
    }

    /// ➕ Add a merge-phase synchronizer to the group of its frame.
    pub fn register_merging(&mut self, synchronizer: Arc<dyn Synchronizer>) -> Result<()> {
        let Some(frame) = synchronizer.frame() else {
            bail!(
                "💀 '{}' has no merging frame, so it belongs in the sync phase",
                synchronizer.name()
            );
        };
        self.ensure_unique(synchronizer.as_ref())?;
        self.merging.entry(frame).or_default().push(synchronizer);
        Ok(())
    }

    pub fn synchronizer_names(&self) -> Vec<&str> {
        self.all().map(|synchronizer| synchronizer.name()).collect()
    }

    pub fn watermark(&self) -> &WatermarkLog {
        &self.watermark
    }

    /// 🔄 One full cycle over `[state.last_synced or historical start, now]`. Pure with respect
    /// to the watermark: persisting the outcome is the caller's job.
    pub async fn run_cycle(&self, state: SyncState, now: DateTime<Utc>) -> CycleReport {
        let from = state.last_synced.unwrap_or(self.historical_start);
        let window = SyncWindow::new(from, now);
        info!(from = %window.from, to = %window.to, "🚀 cycle starting");

        let mut outcomes =
            workers::run_phase(self.worker_pool_size, Phase::Sync, &self.daily, window).await;
        for (frame, group) in &self.merging {
            info!(%frame, synchronizers = group.len(), "🔀 merge group starting");
            outcomes.extend(
                workers::run_phase(self.worker_pool_size, Phase::Merge(*frame), group, window).await,
            );
        }

        let report = CycleReport { window, outcomes };
        info!(
            synchronizers = report.outcomes.len(),
            failed = report.failures().count(),
            "🏁 cycle finished"
        );
        report
    }

    /// ⏰ Read the watermark, run a cycle, append the new watermark. The only place that writes it.
    pub async fn tick(&self, now: DateTime<Utc>) -> CycleReport {
        let state = self.watermark.load_state().await;
        let report = self.run_cycle(state, now).await;
        if let Err(err) = self.watermark.append(report.next_state()).await {
            error!("💀 could not persist the watermark; the next cycle will redo this window: {err:#}");
        }
        report
    }
}
