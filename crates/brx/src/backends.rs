//! 🔌 Backends: where the document store lives, breathes, and occasionally returns a 429.
//!
//! 🗄️ Everything the roll-up needs from a document store fits in one trait: create, check,
//! delete and list indexes, move aliases, bulk-write, refresh, search. That's it. No ORM.
//! No query builder framework. Just the nine verbs that keep the billing dashboards honest.
//!
//! 🎭 Two casting choices: a real Elasticsearch cluster over HTTP, and an in-memory stand-in
//! that understands just enough of the query DSL to fool the loaders. The enum dispatches,
//! callers stay blissfully ignorant. Ignorance is a feature. It's called "abstraction."
//!
//! 🦆 The duck is here because every file must have one. This is law.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::common::EntityDocument;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchStore, ElasticsearchStoreConfig};
pub use in_mem::{InMemoryStore, InMemoryStoreConfig};

/// 🗄️ The document-store contract the whole pipeline leans on.
///
/// # Contract 📜
/// - `create_index` is idempotent: an index that already exists is a shrug, not an error.
/// - `index_exists` answers for aliases too. A name is a name.
/// - `delete_index` on a missing index is fine. It's already gone. Mission accomplished.
/// - `resolve_alias` returns the ONE physical index behind an alias, or `None`.
/// - `set_alias` moves the alias in a single atomic step. Readers never see two targets.
/// - `bulk_write` reports per-document outcomes; a transport failure is an `Err`.
/// - `search` hands back the raw response body. Interpreting it is the loader's problem.
#[async_trait]
pub trait DocumentStore: std::fmt::Debug + Send + Sync {
    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()>;
    async fn index_exists(&self, name: &str) -> Result<bool>;
    async fn delete_index(&self, name: &str) -> Result<()>;
    /// 📋 Physical index names matching `pattern` (a trailing `*` wildcard is supported).
    async fn list_index_names(&self, pattern: &str) -> Result<Vec<String>>;
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>>;
    async fn set_alias(&self, index: &str, alias: &str) -> Result<()>;
    async fn bulk_write(&self, index: &str, documents: &[EntityDocument]) -> Result<BulkResponse>;
    /// 🔄 Make everything written so far visible to search.
    async fn refresh(&self, index: &str) -> Result<()>;
    async fn search(&self, indices: &[String], body: &Value) -> Result<Value>;
}

/// 📬 What the store said about each document of a bulk request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemOutcome {
    pub id: Option<String>,
    pub status: u16,
    /// 💀 `Some(reason)` when this document was rejected.
    pub error: Option<String>,
}

impl BulkResponse {
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemOutcome> {
        self.items.iter().filter(|item| item.error.is_some())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// 🎭 The many faces of a document store: a polymorphic casting call.
///
/// Each variant wraps a concrete store and the enum forwards every call, so synchronizers hold
/// one `Arc<StoreBackend>` and never ask which cluster (or which `BTreeMap`) they're talking to.
#[derive(Debug)]
pub enum StoreBackend {
    InMemory(InMemoryStore),
    Elasticsearch(ElasticsearchStore),
}

#[async_trait]
impl DocumentStore for StoreBackend {
    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()> {
        match self {
            Self::InMemory(store) => store.create_index(name, mapping).await,
            Self::Elasticsearch(store) => store.create_index(name, mapping).await,
        }
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        match self {
            Self::InMemory(store) => store.index_exists(name).await,
            Self::Elasticsearch(store) => store.index_exists(name).await,
        }
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        match self {
            Self::InMemory(store) => store.delete_index(name).await,
            Self::Elasticsearch(store) => store.delete_index(name).await,
        }
    }

    async fn list_index_names(&self, pattern: &str) -> Result<Vec<String>> {
        match self {
            Self::InMemory(store) => store.list_index_names(pattern).await,
            Self::Elasticsearch(store) => store.list_index_names(pattern).await,
        }
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        match self {
            Self::InMemory(store) => store.resolve_alias(alias).await,
            Self::Elasticsearch(store) => store.resolve_alias(alias).await,
        }
    }

    async fn set_alias(&self, index: &str, alias: &str) -> Result<()> {
        match self {
            Self::InMemory(store) => store.set_alias(index, alias).await,
            Self::Elasticsearch(store) => store.set_alias(index, alias).await,
        }
    }

    async fn bulk_write(&self, index: &str, documents: &[EntityDocument]) -> Result<BulkResponse> {
        match self {
            Self::InMemory(store) => store.bulk_write(index, documents).await,
            Self::Elasticsearch(store) => store.bulk_write(index, documents).await,
        }
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        match self {
            Self::InMemory(store) => store.refresh(index).await,
            Self::Elasticsearch(store) => store.refresh(index).await,
        }
    }

    async fn search(&self, indices: &[String], body: &Value) -> Result<Value> {
        match self {
            Self::InMemory(store) => store.search(indices, body).await,
            Self::Elasticsearch(store) => store.search(indices, body).await,
        }
    }
}
