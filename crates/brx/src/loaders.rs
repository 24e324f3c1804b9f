//! # 📦 ENTITY DOCUMENT LOADERS
//!
//! 🎬 *[a month of day indexes. thirty-one of them. each one full of small receipts.
//! the accountant wants one line per run. the accountant always wants one line per run.]*
//!
//! A loader turns `(from, to, source indexes)` into pre-aggregated [`EntityDocument`]s, one per
//! distinct entity key, using a single terms aggregation:
//!
//! - a `range` filter on the billing date
//! - `terms` on the entity key, ordered by key, sized to the cardinality limit
//! - one `sum` per summed field, named after the field
//! - `last_document`: `top_hits` size 1, latest event timestamp first (billing date as the
//!   fallback key), so descriptive attributes (owner, tool, region...) come from the freshest
//!   document even when one day holds several events for the same key
//! - `page`: `bucket_sort` with `from`/`size`, which is how we page through terms buckets
//!
//! 🔄 Paging stops when a page comes back short. A page that is exactly full therefore costs one
//! extra search that returns zero buckets, and that empty page ends the walk. Nothing is lost at
//! the boundary, nothing is fetched past it.
//!
//! 💀 A source index that is missing or unsearchable fails the whole load. A roll-up built from
//! the wrong set of sources is worse than no roll-up at all.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures::Stream;
use serde_json::{Map, Value, json};
use tracing::{debug, trace};

use crate::backends::{DocumentStore, StoreBackend};
use crate::common::EntityDocument;
use crate::entities::{BillingEntity, DATE_FIELD, TIMESTAMP_FIELD};

const ENTITIES_AGG: &str = "entities";
const LAST_DOCUMENT_AGG: &str = "last_document";
const PAGE_AGG: &str = "page";

/// 📦 Static loader configuration for one entity. Cheap to clone, cheap to keep around.
#[derive(Debug, Clone, Copy)]
pub struct EntityDocumentLoader {
    entity: BillingEntity,
    page_size: usize,
    cardinality_limit: u64,
}

impl EntityDocumentLoader {
    pub fn new(entity: BillingEntity, page_size: usize, cardinality_limit: u64) -> Self {
        Self {
            entity,
            page_size: page_size.max(1),
            cardinality_limit,
        }
    }

    pub fn entity(&self) -> BillingEntity {
        self.entity
    }

    /// 🚀 Start a lazy, paginated load. No search happens until the first page is asked for.
    pub fn load(
        &self,
        store: Arc<StoreBackend>,
        from: NaiveDate,
        to: NaiveDate,
        indices: Vec<String>,
    ) -> DocumentPages {
        let has_next = !indices.is_empty();
        DocumentPages {
            loader: *self,
            store,
            from,
            to,
            indices,
            offset: 0,
            has_next,
        }
    }
}

/// 🔄 The lazy page iterator behind one load.
#[derive(Debug)]
pub struct DocumentPages {
    loader: EntityDocumentLoader,
    store: Arc<StoreBackend>,
    from: NaiveDate,
    to: NaiveDate,
    indices: Vec<String>,
    offset: usize,
    has_next: bool,
}

impl DocumentPages {
    /// 🔍 The search body for the page starting at the current bucket offset.
    pub fn page_query(&self) -> Value {
        let entity = self.loader.entity;
        let mut sub_aggs = Map::new();
        for field in entity.summed_fields() {
            sub_aggs.insert((*field).to_string(), json!({ "sum": { "field": field } }));
        }
        sub_aggs.insert(
            LAST_DOCUMENT_AGG.to_string(),
            json!({ "top_hits": { "size": 1, "sort": [
                { TIMESTAMP_FIELD: { "order": "desc", "unmapped_type": "date" } },
                { DATE_FIELD: { "order": "desc" } },
            ] } }),
        );
        sub_aggs.insert(
            PAGE_AGG.to_string(),
            json!({ "bucket_sort": { "from": self.offset, "size": self.loader.page_size } }),
        );
        json!({
            "size": 0,
            "query": { "bool": { "filter": [ { "range": { DATE_FIELD: {
                "gte": self.from.format("%Y-%m-%d").to_string(),
                "lte": self.to.format("%Y-%m-%d").to_string(),
                "format": "yyyy-MM-dd",
            } } } ] } },
            "aggs": { ENTITIES_AGG: {
                "terms": {
                    "field": entity.key_field(),
                    "size": self.loader.cardinality_limit,
                    "order": { "_key": "asc" },
                },
                "aggs": sub_aggs,
            } },
        })
    }

    /// 📄 The next page of documents, or `None` once the buckets run out.
    pub async fn next_page(&mut self) -> Result<Option<Vec<EntityDocument>>> {
        if !self.has_next {
            return Ok(None);
        }
        let response = self
            .store
            .search(&self.indices, &self.page_query())
            .await
            .with_context(|| {
                format!(
                    "💀 Aggregation over [{}] failed at bucket offset {}",
                    self.indices.join(","),
                    self.offset
                )
            })?;
        let buckets = response
            .pointer(&format!("/aggregations/{ENTITIES_AGG}/buckets"))
            .and_then(Value::as_array)
            .with_context(|| {
                format!(
                    "💀 Aggregation response over [{}] has no '{ENTITIES_AGG}' buckets",
                    self.indices.join(",")
                )
            })?;

        self.has_next = buckets.len() == self.loader.page_size;
        self.offset += buckets.len();
        trace!(offset = self.offset, buckets = buckets.len(), "📄 aggregation page fetched");

        if buckets.is_empty() {
            debug!(entity = %self.loader.entity, "🏁 empty page, load complete");
            return Ok(None);
        }
        let documents = buckets
            .iter()
            .map(|bucket| self.bucket_to_document(bucket))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(documents))
    }

    /// 🧾 One bucket becomes one document: the latest source document, with the sums pasted on top.
    fn bucket_to_document(&self, bucket: &Value) -> Result<EntityDocument> {
        let key = bucket
            .get("key")
            .context("💀 Aggregation bucket without a key. A bucket of nothing, for no one.")?;
        let id = match key {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let mut fields = bucket
            .pointer(&format!("/{LAST_DOCUMENT_AGG}/hits/hits/0/_source"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        fields.insert(self.loader.entity.key_field().to_string(), key.clone());
        for field in self.loader.entity.summed_fields() {
            let total = bucket
                .pointer(&format!("/{field}/value"))
                .and_then(Value::as_f64)
                .with_context(|| format!("💀 Bucket '{id}' is missing the '{field}' sum"))?;
            fields.insert((*field).to_string(), json!(total));
        }
        Ok(EntityDocument::new(id, fields))
    }

    /// 🌊 The same pages as a `Stream`, for callers that prefer to `try_next()` their way through.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<EntityDocument>>> + Send {
        futures::stream::try_unfold(self, |mut pages| async move {
            let page = pages.next_page().await?;
            anyhow::Ok(page.map(|documents| (documents, pages)))
        })
    }
}
