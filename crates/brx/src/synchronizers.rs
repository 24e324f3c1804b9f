//! 🔄 Synchronizers: the units of work the scheduler hands to its workers.
//!
//! 🎬 *[two kinds of synchronizer walk into a cycle. the daily one brings raw events.
//! the merging one brings an alias and a grudge against half-written indexes.]*
//!
//! - [`DailySynchronizer`]: raw usage events → day indexes (sync phase).
//! - [`MergingSynchronizer`]: child-frame indexes → one summary index per period, swapped in
//!   behind an alias (merge phase, grouped by frame).
//!
//! Both implement [`Synchronizer`]. `frame()` is what the scheduler groups by: `None` means
//! "sync phase", `Some(frame)` means "merge phase, in that frame's group".

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::SyncWindow;
use crate::entities::{self, BillingEntity};
use crate::frames::MergingFrame;
use crate::loaders::EntityDocumentLoader;

pub mod daily;
pub mod merging;

pub use daily::DailySynchronizer;
pub use merging::{MergeStart, MergeSummary, MergingSynchronizer};

/// 🔄 One schedulable unit of synchronization work.
#[async_trait]
pub trait Synchronizer: Debug + Send + Sync {
    /// 🏷️ Unique within a scheduler. Shows up in logs and in the cycle report.
    fn name(&self) -> &str;

    /// 📅 The frame this synchronizer merges into, or `None` for sync-phase work.
    fn frame(&self) -> Option<MergingFrame> {
        None
    }

    async fn synchronize(&self, window: SyncWindow) -> Result<()>;
}

/// 📜 Static description of one merging synchronizer: which entity, which frame, which loader.
#[derive(Debug, Clone)]
pub struct SynchronizerDescriptor {
    pub name: String,
    pub frame: MergingFrame,
    pub index_prefix: String,
    pub loader: EntityDocumentLoader,
}

impl SynchronizerDescriptor {
    /// 🏗️ Describe the merge of `loader`'s entity into `frame`, named `{entity}-{frame}`.
    pub fn new(index_prefix: impl Into<String>, frame: MergingFrame, loader: EntityDocumentLoader) -> Self {
        let name = format!("{}-{}", loader.entity(), frame).to_lowercase();
        Self {
            name,
            frame,
            index_prefix: index_prefix.into(),
            loader,
        }
    }

    pub fn entity(&self) -> BillingEntity {
        self.loader.entity()
    }

    /// 🏷️ `{prefix}-{entity}`: shared by every frame of this entity.
    pub fn index_base(&self) -> String {
        entities::index_base(&self.index_prefix, self.entity())
    }

    /// 🔍 Pattern matching every index this entity owns, across all frames.
    pub fn source_index_pattern(&self) -> String {
        format!("{}-*", self.index_base())
    }
}
