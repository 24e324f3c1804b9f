//! 🧪 An event source that lives in a `Vec`. Tests seed it, dry runs leave it empty.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::entities::BillingEntity;
use crate::sources::{RawUsageEvent, UsageEventSource};

/// 🧪 No knobs. An empty in-memory source is a valid (if quiet) source.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemoryEventSourceConfig {}

#[derive(Debug, Default, Clone)]
pub struct InMemoryEventSource {
    events: Arc<Vec<RawUsageEvent>>,
    broken: Arc<AtomicBool>,
}

impl InMemoryEventSource {
    pub fn new(events: Vec<RawUsageEvent>) -> Self {
        Self {
            events: Arc::new(events),
            broken: Arc::default(),
        }
    }

    /// 💣 Every fetch fails until further notice. Clones share the switch.
    pub fn break_source(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UsageEventSource for InMemoryEventSource {
    async fn fetch_raw_events(
        &self,
        entity: BillingEntity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RawUsageEvent>> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("💀 In-memory event source is broken on purpose. It's a test. Probably.");
        }
        Ok(self
            .events
            .iter()
            .filter(|event| event.entity() == entity.event_kind())
            .filter(|event| (from..=to).contains(&event.timestamp()))
            .cloned()
            .collect())
    }
}
