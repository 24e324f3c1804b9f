//! 📦 Common data structures: the building blocks every other module passes around.
//!
//! 🎬 *[A document walks into an index. The index asks for ID. The document says "optional."]*
//!
//! - [`EntityDocument`]: one billing document. Produced by loaders and daily synchronizers,
//!   consumed by the bulk writer. Immutable once built, like a receipt. Or a regret.
//! - [`SyncWindow`]: the `[from, to]` timestamps one scheduler cycle covers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// 🧾 The unit persisted to (and read back from) the document store.
///
/// `fields` keeps insertion order (serde_json's `preserve_order`), so a document reads the same
/// way on the way in as it did on the way out. Small things. They matter at 3am.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct EntityDocument {
    /// 🔑 Document id. `None` lets the store pick one, which nobody in this crate ever does.
    pub id: Option<String>,
    pub fields: Map<String, Value>,
}

impl EntityDocument {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: Some(id.into()),
            fields,
        }
    }

    /// 🔍 Convenience lookup for numeric fields; tests lean on it heavily.
    pub fn number(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    /// 📄 The `_source` body as JSON text.
    pub fn source_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}

/// 🪟 The time window one cycle synchronizes: `[from, to]`, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl SyncWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn from_date(&self) -> NaiveDate {
        self.from.date_naive()
    }

    pub fn to_date(&self) -> NaiveDate {
        self.to.date_naive()
    }
}
