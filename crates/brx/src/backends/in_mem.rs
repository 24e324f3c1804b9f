//! # Previously, on brx...
//!
//! 🎬 The cluster was down. The tests still had to run. Someone had to pretend to be
//! Elasticsearch, convincingly enough that the loaders would never know. That someone
//! was a `BTreeMap` in a trench coat.
//!
//! [`InMemoryStore`] keeps indexes, aliases and documents in RAM behind an
//! `Arc<Mutex<...>>`, so tests hand one clone to the pipeline and keep another to peek.
//! Its `search` understands exactly the query shape the loaders emit:
//!
//! - `query.bool.filter[].range` on one field (`gte`/`lte`/`gt`/`lt`)
//! - top-level `terms` aggregations (buckets ordered by key, ascending, capped by `size`)
//! - sub-aggregations `sum`, `max`, `top_hits` (sorted by any number of fields) and `bucket_sort`
//!
//! Anything fancier gets an honest error instead of a wrong answer.
//!
//! 🧪 Fault injection for the crash-safety tests: fail the N-th bulk document, or make a named
//! index unsearchable. ⚠️ Not for production. If you deploy this to prod, also deploy a therapist.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::backends::{BulkItemOutcome, BulkResponse, DocumentStore};
use crate::common::EntityDocument;

/// 🧪 Nothing to configure. The RAM is already there.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemoryStoreConfig {}

#[derive(Debug, Default)]
struct StoredIndex {
    mapping: Value,
    documents: BTreeMap<String, Map<String, Value>>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    indices: BTreeMap<String, StoredIndex>,
    /// alias -> physical index
    aliases: BTreeMap<String, String>,
    bulk_documents_seen: usize,
    fail_bulk_at_document: Option<usize>,
    unsearchable: BTreeSet<String>,
    search_calls: usize,
}

/// 📦 A document store that never forgets (until the process exits).
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💣 The `n`-th document handed to `bulk_write` from now on (1-based) fails the request.
    /// Documents before it in the same request are kept, like a real half-finished bulk.
    pub async fn fail_bulk_at_document(&self, n: usize) {
        let mut state = self.state.lock().await;
        state.bulk_documents_seen = 0;
        state.fail_bulk_at_document = Some(n);
    }

    /// 💣 Searches touching `index` fail from now on.
    pub async fn make_unsearchable(&self, index: &str) {
        self.state.lock().await.unsearchable.insert(index.to_string());
    }

    /// 🧹 Drop every injected fault.
    pub async fn heal(&self) {
        let mut state = self.state.lock().await;
        state.fail_bulk_at_document = None;
        state.unsearchable.clear();
    }

    pub async fn search_calls(&self) -> usize {
        self.state.lock().await.search_calls
    }

    /// 🔍 Documents of `name` (alias or index), keyed by id. `None` if no such thing exists.
    pub async fn documents(&self, name: &str) -> Option<BTreeMap<String, Map<String, Value>>> {
        let state = self.state.lock().await;
        let physical = state.aliases.get(name).map_or(name, String::as_str);
        state.indices.get(physical).map(|index| index.documents.clone())
    }

    pub async fn mapping(&self, name: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.indices.get(name).map(|index| index.mapping.clone())
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.state.lock().await.indices.keys().cloned().collect()
    }

    /// 🌱 Seed an index with documents directly, skipping the bulk path and its faults.
    pub async fn seed(&self, index: &str, documents: Vec<EntityDocument>) {
        let mut state = self.state.lock().await;
        let stored = state.indices.entry(index.to_string()).or_default();
        for (position, document) in documents.into_iter().enumerate() {
            let id = document.id.unwrap_or_else(|| format!("seed-{position}"));
            stored.documents.insert(id, document.fields);
        }
    }
}

impl InMemoryState {
    fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map_or(name, String::as_str)
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.aliases.contains_key(name) {
            bail!("💀 '{name}' is already an alias; an index cannot share its name");
        }
        state
            .indices
            .entry(name.to_string())
            .or_insert_with(|| StoredIndex {
                mapping: mapping.clone(),
                documents: BTreeMap::new(),
            });
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.indices.contains_key(state.resolve(name)))
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.indices.remove(name);
        state.aliases.retain(|_, target| *target != name);
        Ok(())
    }

    async fn list_index_names(&self, pattern: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .indices
            .keys()
            .filter(|name| matches_pattern(pattern, name))
            .cloned()
            .collect())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.aliases.get(alias).cloned())
    }

    async fn set_alias(&self, index: &str, alias: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.indices.contains_key(index) {
            bail!("💀 Cannot point alias '{alias}' at '{index}': no such index");
        }
        if state.indices.contains_key(alias) {
            bail!("💀 Cannot create alias '{alias}': an index already has that name");
        }
        state.aliases.insert(alias.to_string(), index.to_string());
        Ok(())
    }

    async fn bulk_write(&self, index: &str, documents: &[EntityDocument]) -> Result<BulkResponse> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let physical = state.resolve(index).to_string();
        if !state.indices.contains_key(&physical) {
            bail!("💀 Bulk write into '{index}' failed: no such index");
        }
        let mut items = Vec::with_capacity(documents.len());
        for document in documents {
            state.bulk_documents_seen += 1;
            if state.fail_bulk_at_document == Some(state.bulk_documents_seen) {
                bail!(
                    "💀 Injected bulk failure at document #{} while writing '{index}'",
                    state.bulk_documents_seen
                );
            }
            let id = document
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            if let Some(stored) = state.indices.get_mut(&physical) {
                stored.documents.insert(id.clone(), document.fields.clone());
            }
            items.push(BulkItemOutcome {
                id: Some(id),
                status: 201,
                error: None,
            });
        }
        Ok(BulkResponse { items })
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        if self.index_exists(index).await? {
            Ok(())
        } else {
            bail!("💀 Cannot refresh '{index}': no such index")
        }
    }

    async fn search(&self, indices: &[String], body: &Value) -> Result<Value> {
        let mut state = self.state.lock().await;
        state.search_calls += 1;

        let mut documents: Vec<(&str, &str, &Map<String, Value>)> = Vec::new();
        for name in indices {
            let physical = state.resolve(name);
            if state.unsearchable.contains(name) || state.unsearchable.contains(physical) {
                bail!("💀 Injected search failure on '{name}'");
            }
            let stored = state
                .indices
                .get(physical)
                .with_context(|| format!("💀 index_not_found_exception: no such index [{name}]"))?;
            for (id, source) in &stored.documents {
                documents.push((physical, id.as_str(), source));
            }
        }

        let filters = range_filters(body)?;
        let hits: Vec<Hit<'_>> = documents
            .into_iter()
            .filter(|(_, _, source)| filters.iter().all(|filter| filter.accepts(source)))
            .map(|(index, id, source)| Hit { index, id, source })
            .collect();

        let mut aggregations = Map::new();
        if let Some(aggs) = body.get("aggs").or_else(|| body.get("aggregations")) {
            let aggs = aggs.as_object().context("💀 aggs must be an object")?;
            for (name, definition) in aggs {
                aggregations.insert(name.clone(), terms_aggregation(definition, &hits)?);
            }
        }

        let size = body.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;
        let returned: Vec<Value> = hits.iter().take(size).map(Hit::to_json).collect();
        Ok(json!({
            "hits": { "total": { "value": hits.len() }, "hits": returned },
            "aggregations": aggregations,
        }))
    }
}

// ============================================================
//  🧮 The tiny query evaluator. Just enough Elasticsearch to be dangerous.
// ============================================================

struct Hit<'a> {
    index: &'a str,
    id: &'a str,
    source: &'a Map<String, Value>,
}

impl Hit<'_> {
    fn to_json(&self) -> Value {
        json!({ "_index": self.index, "_id": self.id, "_source": self.source })
    }
}

struct RangeFilter {
    field: String,
    bounds: Map<String, Value>,
}

impl RangeFilter {
    fn accepts(&self, source: &Map<String, Value>) -> bool {
        let Some(value) = source.get(&self.field) else {
            return false;
        };
        self.bounds.iter().all(|(op, bound)| {
            let ordering = compare_values(value, bound);
            match op.as_str() {
                "gte" => ordering != Ordering::Less,
                "gt" => ordering == Ordering::Greater,
                "lte" => ordering != Ordering::Greater,
                "lt" => ordering == Ordering::Less,
                _ => true,
            }
        })
    }
}

fn range_filters(body: &Value) -> Result<Vec<RangeFilter>> {
    let Some(query) = body.get("query") else {
        return Ok(Vec::new());
    };
    if query.get("match_all").is_some() {
        return Ok(Vec::new());
    }
    let clauses = query
        .pointer("/bool/filter")
        .and_then(Value::as_array)
        .context("💀 in-memory search only understands match_all or bool.filter[range]")?;
    let mut filters = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let range = clause
            .get("range")
            .and_then(Value::as_object)
            .context("💀 in-memory search only understands range filters")?;
        for (field, bounds) in range {
            let bounds = bounds
                .as_object()
                .context("💀 range bounds must be an object")?
                .iter()
                .filter(|(op, _)| matches!(op.as_str(), "gte" | "gt" | "lte" | "lt"))
                .map(|(op, bound)| (op.clone(), bound.clone()))
                .collect();
            filters.push(RangeFilter {
                field: field.clone(),
                bounds,
            });
        }
    }
    Ok(filters)
}

/// 🔢 Numbers compare as numbers, everything else compares as text (ISO dates sort fine as text).
fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => value_text(left).cmp(&value_text(right)),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn terms_aggregation(definition: &Value, hits: &[Hit<'_>]) -> Result<Value> {
    let terms = definition
        .get("terms")
        .context("💀 in-memory search only understands top-level terms aggregations")?;
    let field = terms
        .get("field")
        .and_then(Value::as_str)
        .context("💀 terms aggregation needs a field")?;
    let size = terms.get("size").and_then(Value::as_u64).unwrap_or(10) as usize;

    // keyed on the canonical JSON text, so `1` and `"1"` stay separate buckets
    let mut by_key: BTreeMap<String, (Value, Vec<&Hit<'_>>)> = BTreeMap::new();
    for hit in hits {
        let Some(key) = hit.source.get(field) else {
            continue;
        };
        by_key
            .entry(key.to_string())
            .or_insert_with(|| (key.clone(), Vec::new()))
            .1
            .push(hit);
    }
    let mut groups: Vec<(Value, Vec<&Hit<'_>>)> = by_key.into_values().collect();
    groups.sort_by(|(a, _), (b, _)| compare_values(a, b));
    groups.truncate(size);

    let sub_aggs = definition
        .get("aggs")
        .or_else(|| definition.get("aggregations"))
        .and_then(Value::as_object);

    let mut buckets = Vec::with_capacity(groups.len());
    let mut page: Option<(usize, Option<usize>)> = None;
    for (key, members) in &groups {
        let mut bucket = Map::new();
        bucket.insert("key".to_string(), key.clone());
        bucket.insert("doc_count".to_string(), json!(members.len()));
        for (name, sub) in sub_aggs.into_iter().flatten() {
            if let Some(sum) = sub.get("sum") {
                let field = metric_field(sum)?;
                let total: f64 = members
                    .iter()
                    .filter_map(|hit| hit.source.get(field).and_then(Value::as_f64))
                    .sum();
                bucket.insert(name.clone(), json!({ "value": total }));
            } else if let Some(max) = sub.get("max") {
                let field = metric_field(max)?;
                let top = members
                    .iter()
                    .filter_map(|hit| hit.source.get(field).and_then(Value::as_f64))
                    .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
                bucket.insert(name.clone(), json!({ "value": top }));
            } else if let Some(top_hits) = sub.get("top_hits") {
                bucket.insert(name.clone(), top_hits_of(top_hits, members)?);
            } else if let Some(bucket_sort) = sub.get("bucket_sort") {
                let from = bucket_sort.get("from").and_then(Value::as_u64).unwrap_or(0) as usize;
                let size = bucket_sort.get("size").and_then(Value::as_u64).map(|s| s as usize);
                page = Some((from, size));
            } else {
                bail!("💀 in-memory search does not understand sub-aggregation '{name}'");
            }
        }
        buckets.push(Value::Object(bucket));
    }

    if let Some((from, size)) = page {
        buckets = buckets
            .into_iter()
            .skip(from)
            .take(size.unwrap_or(usize::MAX))
            .collect();
    }
    Ok(json!({ "buckets": buckets }))
}

fn metric_field(metric: &Value) -> Result<&str> {
    metric
        .get("field")
        .and_then(Value::as_str)
        .context("💀 metric aggregation needs a field")
}

struct SortKey<'a> {
    field: &'a str,
    descending: bool,
}

/// 🔀 `[{field: {order}}, {field: "desc"}, ...]`, applied left to right. Ties keep index order.
fn sort_keys(definition: &Value) -> Result<Vec<SortKey<'_>>> {
    let Some(clauses) = definition.get("sort") else {
        return Ok(Vec::new());
    };
    let clauses = clauses.as_array().context("💀 top_hits sort must be an array")?;
    let mut keys = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let clause = clause
            .as_object()
            .context("💀 in-memory top_hits only understands {field: order} sort clauses")?;
        for (field, order) in clause {
            let descending = order
                .get("order")
                .or(Some(order))
                .and_then(Value::as_str)
                .is_some_and(|o| o == "desc");
            keys.push(SortKey { field, descending });
        }
    }
    Ok(keys)
}

fn top_hits_of(definition: &Value, members: &[&Hit<'_>]) -> Result<Value> {
    let size = definition.get("size").and_then(Value::as_u64).unwrap_or(3) as usize;
    let keys = sort_keys(definition)?;
    let mut sorted: Vec<&Hit<'_>> = members.to_vec();
    sorted.sort_by(|a, b| {
        keys.iter()
            .map(|key| {
                let ordering = match (a.source.get(key.field), b.source.get(key.field)) {
                    (Some(x), Some(y)) => compare_values(x, y),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if key.descending { ordering.reverse() } else { ordering }
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    });
    let hits: Vec<Value> = sorted.into_iter().take(size).map(Hit::to_json).collect();
    Ok(json!({ "hits": { "total": { "value": members.len() }, "hits": hits } }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, run_id: u64, cost: f64, date: &str) -> EntityDocument {
        let mut fields = Map::new();
        fields.insert("run_id".into(), json!(run_id));
        fields.insert("cost".into(), json!(cost));
        fields.insert("created_date".into(), json!(date));
        EntityDocument::new(id, fields)
    }

    #[tokio::test]
    async fn the_one_where_terms_sum_and_top_hits_behave_like_the_real_thing() -> Result<()> {
        let store = InMemoryStore::new();
        store
            .seed(
                "day-1",
                vec![doc("a", 2, 1.0, "2024-01-01"), doc("b", 1, 2.0, "2024-01-01")],
            )
            .await;
        store.seed("day-2", vec![doc("c", 1, 0.5, "2024-01-02")]).await;

        let body = json!({
            "size": 0,
            "query": { "bool": { "filter": [ { "range": { "created_date": { "gte": "2024-01-01", "lte": "2024-01-31" } } } ] } },
            "aggs": { "entities": {
                "terms": { "field": "run_id", "size": 100, "order": { "_key": "asc" } },
                "aggs": {
                    "cost": { "sum": { "field": "cost" } },
                    "last_document": { "top_hits": { "size": 1, "sort": [ { "created_date": { "order": "desc" } } ] } }
                }
            } }
        });
        let response = store
            .search(&["day-1".to_string(), "day-2".to_string()], &body)
            .await?;
        let buckets = response["aggregations"]["entities"]["buckets"]
            .as_array()
            .expect("💀 buckets should be an array");

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key"], json!(1));
        assert_eq!(buckets[0]["cost"]["value"], json!(2.5));
        assert_eq!(
            buckets[0]["last_document"]["hits"]["hits"][0]["_id"],
            json!("c")
        );
        assert_eq!(buckets[1]["key"], json!(2));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_second_sort_key_only_breaks_ties() -> Result<()> {
        let store = InMemoryStore::new();
        let stamped = |id: &str, run_id: u64, date: &str, timestamp: &str| {
            let mut document = doc(id, run_id, 1.0, date);
            document.fields.insert("timestamp".into(), json!(timestamp));
            document
        };
        store
            .seed(
                "days",
                vec![
                    stamped("a", 10, "2024-01-01", "2024-01-01T17:00:00.000Z"),
                    stamped("z", 10, "2024-01-01", "2024-01-01T09:00:00.000Z"),
                    stamped("m", 9, "2024-01-02", "2024-01-02T00:00:00.000Z"),
                    doc("n", 9, 1.0, "2024-01-01"),
                ],
            )
            .await;

        let body = json!({
            "size": 0,
            "aggs": { "entities": {
                "terms": { "field": "run_id", "size": 100 },
                "aggs": {
                    "last_document": { "top_hits": { "size": 1, "sort": [
                        { "timestamp": { "order": "desc", "unmapped_type": "date" } },
                        { "created_date": "desc" },
                    ] } }
                }
            } }
        });
        let response = store.search(&["days".to_string()], &body).await?;
        let buckets = response["aggregations"]["entities"]["buckets"]
            .as_array()
            .expect("💀 buckets should be an array");

        // 🔢 numeric keys sort as numbers, 9 before 10
        assert_eq!(buckets[0]["key"], json!(9));
        assert_eq!(buckets[0]["last_document"]["hits"]["hits"][0]["_id"], json!("m"));
        assert_eq!(buckets[1]["key"], json!(10));
        assert_eq!(buckets[1]["doc_count"], json!(2));
        assert_eq!(buckets[1]["last_document"]["hits"]["hits"][0]["_id"], json!("a"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_healing_clears_every_injected_fault() -> Result<()> {
        let store = InMemoryStore::new();
        store.create_index("victim", &json!({ "mappings": {} })).await?;
        assert_eq!(store.mapping("victim").await, Some(json!({ "mappings": {} })));
        store.make_unsearchable("victim").await;
        store.fail_bulk_at_document(1).await;
        assert!(store.search(&["victim".to_string()], &json!({ "size": 0 })).await.is_err());

        store.heal().await;
        store
            .bulk_write("victim", &[doc("a", 1, 1.0, "2024-01-01")])
            .await?;
        let response = store.search(&["victim".to_string()], &json!({ "size": 10 })).await?;
        assert_eq!(response["hits"]["total"]["value"], json!(1));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_aliases_move_and_deleted_indexes_take_them_along() -> Result<()> {
        let store = InMemoryStore::new();
        store.create_index("month-a", &json!({})).await?;
        store.create_index("month-b", &json!({})).await?;
        store.set_alias("month-a", "month").await?;
        store.set_alias("month-b", "month").await?;
        assert_eq!(store.resolve_alias("month").await?.as_deref(), Some("month-b"));
        assert!(store.index_exists("month").await?);

        store.delete_index("month-b").await?;
        assert_eq!(store.resolve_alias("month").await?, None);
        assert_eq!(store.list_index_names("month-*").await?, vec!["month-a"]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_injected_failure_leaves_earlier_documents_behind() -> Result<()> {
        let store = InMemoryStore::new();
        store.create_index("victim", &json!({})).await?;
        store.fail_bulk_at_document(3).await;

        let documents: Vec<EntityDocument> = (0..5)
            .map(|i| doc(&i.to_string(), i, 1.0, "2024-01-01"))
            .collect();
        assert!(store.bulk_write("victim", &documents).await.is_err());
        assert_eq!(store.documents("victim").await.map(|d| d.len()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_unknown_indexes_fail_the_search_loudly() {
        let store = InMemoryStore::new();
        let result = store.search(&["ghost".to_string()], &json!({ "size": 0 })).await;
        assert!(result.is_err());
    }
}
