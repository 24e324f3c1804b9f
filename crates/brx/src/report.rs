//! 📊 Cycle reports: what happened, to whom, and how long it took.
//!
//! 🎬 *[the cycle ends. the scheduler clears its throat and reads the minutes.]*
//!
//! A [`CycleReport`] is the value a cycle returns instead of scribbling on global state:
//! the window it covered plus one [`SynchronizerOutcome`] per synchronizer. The scheduler
//! turns it into the next [`SyncState`]; the CLI turns it into a table.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use crate::common::SyncWindow;
use crate::frames::MergingFrame;

/// 💾 Everything a cycle needs to know about the past: where the last one stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
    pub last_synced: Option<DateTime<Utc>>,
}

/// 🎬 Which act of the cycle a synchronizer ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Sync,
    Merge(MergingFrame),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => f.write_str("sync"),
            Self::Merge(frame) => write!(f, "merge {frame}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "✅ ok",
            Self::Failed => "💀 failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SynchronizerOutcome {
    pub name: String,
    pub phase: Phase,
    pub status: OutcomeStatus,
    pub elapsed: Duration,
    /// 💀 The full error chain, when there was one.
    pub error: Option<String>,
}

impl SynchronizerOutcome {
    pub fn succeeded(name: impl Into<String>, phase: Phase, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            phase,
            status: OutcomeStatus::Succeeded,
            elapsed,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, phase: Phase, elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase,
            status: OutcomeStatus::Failed,
            elapsed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub window: SyncWindow,
    pub outcomes: Vec<SynchronizerOutcome>,
}

impl CycleReport {
    pub fn failures(&self) -> impl Iterator<Item = &SynchronizerOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == OutcomeStatus::Failed)
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn outcome(&self, name: &str) -> Option<&SynchronizerOutcome> {
        self.outcomes.iter().find(|outcome| outcome.name == name)
    }

    /// ⏭️ The state the next cycle starts from. The watermark advances even past isolated
    /// failures; the next cycle's work is idempotent either way.
    pub fn next_state(&self) -> SyncState {
        SyncState {
            last_synced: Some(self.window.to),
        }
    }

    /// 📊 A human-sized summary for the terminal.
    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["phase", "synchronizer", "status", "elapsed", "error"]);
        for outcome in &self.outcomes {
            table.add_row(vec![
                Cell::new(outcome.phase),
                Cell::new(&outcome.name),
                Cell::new(outcome.status),
                Cell::new(format!("{:.2}s", outcome.elapsed.as_secs_f64()))
                    .set_alignment(CellAlignment::Right),
                Cell::new(outcome.error.as_deref().unwrap_or("")),
            ]);
        }
        format!(
            "🪟 {} → {}\n{table}",
            self.window.from.to_rfc3339(),
            self.window.to.to_rfc3339()
        )
    }
}
