//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM, FIRST OF THE MONTH, 00:03 AM
//!
//! The finance dashboard refreshes. Somewhere, a monthly index is half built.
//! The dashboard does not notice, because the dashboard reads an alias, and the alias
//! still points at last night's fully-baked index. Nobody pages anyone. This is the dream.
//!
//! 🚀 This module is the HTTP client that makes the dream possible: index CRUD, the `_aliases`
//! atomic swap, `_bulk` NDJSON writes, `_refresh`, `_cat/indices` listing, and `_search`.
//! It does not retry. Retries are the next cycle's problem, and the next cycle is idempotent.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, trace, warn};

use crate::backends::{BulkItemOutcome, BulkResponse, DocumentStore};
use crate::common::EntityDocument;

// 📡 ElasticsearchStoreConfig: "It's just Elasticsearch", they said, before the cluster went red.
//
// 🔧 auth is tri-modal: api_key, username+password, or "I hope anonymous works" (it might, in dev).
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchStoreConfig {
    /// 📡 The URL of your cluster. Scheme and port included. Yes, all of it.
    pub url: String,
    /// 🔒 Username for basic auth. Optional, like flossing.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key. Beats basic auth when both are set. This is not a democracy.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🫁 gzip the `_bulk` body. The cluster needs `http.compression` enabled to enjoy it.
    #[serde(default)]
    pub compress_requests: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// 📡 The Elasticsearch document store. One `reqwest::Client`, reused for every call.
#[derive(Debug)]
pub struct ElasticsearchStore {
    client: reqwest::Client,
    config: ElasticsearchStoreConfig,
}

// 📋 One row of `_cat/indices?format=json&h=index`. We only asked for the name. We only got the name.
#[derive(Debug, Deserialize)]
struct CatIndexRow {
    index: String,
}

#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct RawBulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

impl ElasticsearchStore {
    /// 🚀 Build the client with the configured timeouts. No network traffic yet; see [`Self::ping`].
    pub fn new(config: ElasticsearchStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Probably a missing cert or a cursed system OpenSSL. Either way: tragic.")?;
        Ok(Self { client, config })
    }

    /// 📡 "Hello? Is this thing on?" A GET on the cluster root, so a wrong URL fails at startup
    /// instead of halfway through the first monthly rebuild.
    pub async fn ping(&self) -> Result<()> {
        let response = self
            .request(Method::GET, "")
            .send()
            .await
            .with_context(|| format!("💀 Could not reach Elasticsearch at '{}'. The cluster is giving us the silent treatment.", self.config.url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("💀 Elasticsearch at '{}' answered the ping with {status}: {body}", self.config.url);
        }
        debug!("✅ Elasticsearch is home and answering the door");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// 🔒 Every request goes through here so the auth dance happens exactly once.
    /// api_key beats basic auth in this club.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    fn json_request(&self, method: Method, path: &str, body: &Value) -> RequestBuilder {
        self.request(method, path)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    /// 🔍 Every physical index currently carrying `alias`. Usually zero or one. Should be.
    async fn alias_holders(&self, alias: &str) -> Result<Vec<String>> {
        let response = self
            .request(Method::GET, &format!("_alias/{alias}"))
            .send()
            .await
            .with_context(|| format!("💀 Failed to ask who holds alias '{alias}'. The network shrugged."))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("💀 Alias lookup for '{alias}' came back {status}: {body}");
        }
        let holders: Map<String, Value> = serde_json::from_str(&body)
            .with_context(|| format!("💀 Alias lookup for '{alias}' returned something that is not a JSON object: {body}"))?;
        Ok(holders.into_iter().map(|(index, _)| index).collect())
    }

    /// 📦 Render the `_bulk` NDJSON body: an action line, then the source line, per document.
    fn render_bulk(index: &str, documents: &[EntityDocument]) -> String {
        let estimated_size: usize = documents.iter().map(|d| d.fields.len() * 32 + 100).sum();
        let mut bulk_body = String::with_capacity(estimated_size);
        for document in documents {
            let mut action = json!({ "index": { "_index": index } });
            // 🔑 _id makes the write an upsert, which makes a replayed window harmless
            if let Some(ref id) = document.id {
                action["index"]["_id"] = json!(id);
            }
            bulk_body.push_str(&action.to_string());
            bulk_body.push('\n');
            bulk_body.push_str(&document.source_json());
            bulk_body.push('\n');
        }
        bulk_body
    }

    fn gzip(payload: &str) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload.as_bytes())
            .context("💀 gzip choked on the bulk body")?;
        encoder.finish().context("💀 gzip could not finish the bulk body")
    }

    fn parse_bulk_response(body: &str) -> Result<BulkResponse> {
        let raw: RawBulkResponse = serde_json::from_str(body)
            .with_context(|| format!("💀 The _bulk response was not the JSON we were promised: {body}"))?;
        let mut items = Vec::with_capacity(raw.items.len());
        for entry in raw.items {
            // 📬 each item is {"<action>": {...}}; we only ever send "index", but read whatever came back
            let Some((_, outcome)) = entry.into_iter().next() else {
                continue;
            };
            let item: RawBulkItem = serde_json::from_value(outcome)
                .context("💀 A _bulk item was missing its status. Elasticsearch, are you okay?")?;
            items.push(BulkItemOutcome {
                id: item.id,
                status: item.status,
                error: item.error.map(|error| {
                    error
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string())
                }),
            });
        }
        Ok(BulkResponse { items })
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn create_index(&self, name: &str, mapping: &Value) -> Result<()> {
        let response = self
            .json_request(Method::PUT, name, mapping)
            .send()
            .await
            .with_context(|| format!("💀 Failed to send the create request for index '{name}'"))?;
        let status = response.status();
        if status.is_success() {
            debug!(index = name, "🏗️ Index created");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            // 🤷 already there. creating it again is a no-op, not a crisis
            trace!(index = name, "🏗️ Index already exists, carrying on");
            return Ok(());
        }
        anyhow::bail!("💀 Creating index '{name}' failed with {status}: {body}")
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self
            .request(Method::HEAD, name)
            .send()
            .await
            .with_context(|| format!("💀 Failed to check whether index '{name}' exists"))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!("💀 Existence check for '{name}' came back {status}. Schrodinger's index."),
        }
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, name)
            .send()
            .await
            .with_context(|| format!("💀 Failed to send the delete request for index '{name}'"))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(index = name, "🗑️ Index deleted (or was never there, which is the same from here)");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("💀 Deleting index '{name}' failed with {status}: {body}")
    }

    async fn list_index_names(&self, pattern: &str) -> Result<Vec<String>> {
        let response = self
            .request(Method::GET, &format!("_cat/indices/{pattern}?format=json&h=index"))
            .send()
            .await
            .with_context(|| format!("💀 Failed to list indexes matching '{pattern}'"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("💀 Listing indexes matching '{pattern}' failed with {status}: {body}");
        }
        let rows: Vec<CatIndexRow> = serde_json::from_str(&body)
            .with_context(|| format!("💀 _cat/indices returned something unexpected: {body}"))?;
        let mut names: Vec<String> = rows.into_iter().map(|row| row.index).collect();
        names.sort();
        Ok(names)
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let mut holders = self.alias_holders(alias).await?;
        if holders.len() > 1 {
            anyhow::bail!(
                "💀 Alias '{alias}' points at {} indexes ({}). It should point at one. Someone swapped by hand.",
                holders.len(),
                holders.join(", ")
            );
        }
        Ok(holders.pop())
    }

    async fn set_alias(&self, index: &str, alias: &str) -> Result<()> {
        // 🔄 remove + add in ONE _aliases call. Elasticsearch applies the actions atomically,
        // so readers see either the old target or the new one, never both, never neither.
        let mut actions: Vec<Value> = self
            .alias_holders(alias)
            .await?
            .into_iter()
            .filter(|holder| holder != index)
            .map(|holder| json!({ "remove": { "index": holder, "alias": alias } }))
            .collect();
        actions.push(json!({ "add": { "index": index, "alias": alias } }));

        let response = self
            .json_request(Method::POST, "_aliases", &json!({ "actions": actions }))
            .send()
            .await
            .with_context(|| format!("💀 Failed to send the alias swap '{alias}' -> '{index}'"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("💀 Alias swap '{alias}' -> '{index}' failed with {status}: {body}");
        }
        debug!(alias, index, "🔀 Alias now points at the new index");
        Ok(())
    }

    async fn bulk_write(&self, index: &str, documents: &[EntityDocument]) -> Result<BulkResponse> {
        if documents.is_empty() {
            return Ok(BulkResponse::default());
        }
        let payload = Self::render_bulk(index, documents);
        let request = self
            .request(Method::POST, "_bulk")
            // ⚠️ application/x-ndjson, not application/json. Elasticsearch has opinions.
            .header("Content-Type", "application/x-ndjson");
        let request = if self.config.compress_requests {
            request
                .header("Content-Encoding", "gzip")
                .body(Self::gzip(&payload)?)
        } else {
            request.body(payload)
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("💀 The bulk request for '{index}' never made it to Elasticsearch. Check connectivity, timeouts, and your feelings."))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("💀 Elasticsearch rejected the bulk request for '{index}' with {status}: {body}");
        }
        let parsed = Self::parse_bulk_response(&body)?;
        if parsed.has_failures() {
            warn!(index, failed = parsed.failures().count(), "⚠️ Some bulk items were rejected");
        } else {
            trace!(index, documents = documents.len(), "🚀 Bulk request landed");
        }
        Ok(parsed)
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("{index}/_refresh"))
            .send()
            .await
            .with_context(|| format!("💀 Failed to send refresh for '{index}'"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("💀 Refreshing '{index}' failed with {status}: {body}");
        }
        Ok(())
    }

    async fn search(&self, indices: &[String], body: &Value) -> Result<Value> {
        let target = indices.join(",");
        let response = self
            .json_request(Method::POST, &format!("{target}/_search"), body)
            .send()
            .await
            .with_context(|| format!("💀 The search against '{target}' never made it to Elasticsearch"))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            // 💀 a missing or closed source index lands here, and it is NOT skipped: a wrong
            // source set would quietly corrupt the roll-up above it
            anyhow::bail!("💀 Search against '{target}' failed with {status}: {text}");
        }
        serde_json::from_str(&text)
            .with_context(|| format!("💀 Search against '{target}' returned invalid JSON"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> ElasticsearchStore {
        ElasticsearchStore::new(ElasticsearchStoreConfig {
            url: server.uri(),
            username: None,
            password: None,
            api_key: Some("s3cr3t".to_string()),
            compress_requests: false,
            connect_timeout_secs: 2,
            request_timeout_secs: 5,
        })
        .expect("💀 client should build. The TLS stack is having a day.")
    }

    #[tokio::test]
    async fn the_one_where_creating_an_existing_index_is_a_shrug() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/billing-run-2024-01-01"))
            .and(header("Authorization", "ApiKey s3cr3t"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":{"type":"resource_already_exists_exception"},"status":400}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server)
            .create_index("billing-run-2024-01-01", &json!({ "mappings": {} }))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_real_create_failure_is_not_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":{"type":"mapper_parsing_exception"},"status":400}"#,
            ))
            .mount(&server)
            .await;

        let result = store_for(&server).create_index("broken", &json!({})).await;
        assert!(result.is_err(), "a bad mapping should not pass for idempotence");
    }

    #[tokio::test]
    async fn the_one_where_missing_aliases_resolve_to_nothing() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_alias/billing-run-2024-01m"))
            .respond_with(ResponseTemplate::new(404).set_body_string(r#"{"error":"alias [billing-run-2024-01m] missing","status":404}"#))
            .mount(&server)
            .await;

        assert_eq!(store_for(&server).resolve_alias("billing-run-2024-01m").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_alias_swap_is_one_atomic_request() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_alias/billing-run-2024-01m"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"billing-run-2024-01m-old":{"aliases":{"billing-run-2024-01m":{}}}}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_aliases"))
            .and(body_json(json!({
                "actions": [
                    { "remove": { "index": "billing-run-2024-01m-old", "alias": "billing-run-2024-01m" } },
                    { "add": { "index": "billing-run-2024-01m-new", "alias": "billing-run-2024-01m" } }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"acknowledged":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(
            store.resolve_alias("billing-run-2024-01m").await?.as_deref(),
            Some("billing-run-2024-01m-old")
        );
        store.set_alias("billing-run-2024-01m-new", "billing-run-2024-01m").await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bulk_reports_each_rejected_document() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string_contains(r#"{"index":{"_index":"billing-run-2024-01m-x","_id":"1"}}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"took":3,"errors":true,"items":[
                    {"index":{"_id":"1","status":201}},
                    {"index":{"_id":"2","status":400,"error":{"type":"mapper_parsing_exception","reason":"cost is not a number"}}}
                ]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut fields = Map::new();
        fields.insert("cost".to_string(), json!(3.5));
        let documents = vec![
            EntityDocument::new("1", fields.clone()),
            EntityDocument::new("2", fields),
        ];
        let response = store_for(&server)
            .bulk_write("billing-run-2024-01m-x", &documents)
            .await?;

        let failures: Vec<&BulkItemOutcome> = response.failures().collect();
        assert_eq!(response.items.len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id.as_deref(), Some("2"));
        assert_eq!(failures[0].error.as_deref(), Some("cost is not a number"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_compressed_bulk_says_so_in_the_headers() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"errors":false,"items":[{"index":{"_id":"7","status":201}}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut store = store_for(&server);
        store.config.compress_requests = true;
        let response = store
            .bulk_write("idx", &[EntityDocument::new("7", Map::new())])
            .await?;
        assert!(!response.has_failures());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_missing_source_index_fails_the_search() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/billing-run-2024-01-01,billing-run-2024-01-02/_search"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                r#"{"error":{"type":"index_not_found_exception"},"status":404}"#,
            ))
            .mount(&server)
            .await;

        let indices = vec!["billing-run-2024-01-01".to_string(), "billing-run-2024-01-02".to_string()];
        let result = store_for(&server).search(&indices, &json!({ "size": 0 })).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn the_one_where_listing_and_existence_checks_speak_http() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cat/indices/billing-run-*"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"index":"billing-run-2024-01-02"},{"index":"billing-run-2024-01-01"}]"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/billing-run-2024-01-01"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/billing-run-2024-01-03"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/billing-run-2024-01-03"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert_eq!(
            store.list_index_names("billing-run-*").await?,
            vec!["billing-run-2024-01-01", "billing-run-2024-01-02"]
        );
        assert!(store.index_exists("billing-run-2024-01-01").await?);
        assert!(!store.index_exists("billing-run-2024-01-03").await?);
        store.delete_index("billing-run-2024-01-03").await?;
        Ok(())
    }
}
