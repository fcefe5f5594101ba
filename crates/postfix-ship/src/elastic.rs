// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch client backing [`DocumentStore`].

use crate::document::{MessageDocument, StoreLinkage};
use crate::store::{BulkItemError, BulkOperation, BulkResponse, DocumentStore, StoreError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Every document matches at most a handful of hits across partitions.
const HITS_PER_ID: usize = 3;
const MIN_SEARCH_SIZE: usize = 10;
/// Elasticsearch rejects searches past `index.max_result_window`
pub const MAX_RESULT_WINDOW: usize = 10_000;
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub hosts: Vec<String>,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

pub struct ElasticStore {
    client: reqwest::Client,
    hosts: Vec<String>,
}

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(proxy_url: Option<&str>, timeout: Duration) -> Result<reqwest::Client, StoreError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        let proxy = reqwest::Proxy::https(proxy)
            .map_err(|e| StoreError::Transport(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| StoreError::Transport(format!("failed to build client: {e}")))
}

impl ElasticStore {
    pub fn new(config: ElasticConfig) -> Result<Self, StoreError> {
        if config.hosts.is_empty() {
            return Err(StoreError::NoHosts);
        }
        let client = build_client(config.https_proxy.as_deref(), config.timeout)?;
        let hosts = config
            .hosts
            .into_iter()
            .map(|host| host.trim_end_matches('/').to_string())
            .collect();
        Ok(ElasticStore { client, hosts })
    }

    /// Sends the request built by `build` to each host in turn until one
    /// answers. Only transport failures move on to the next host.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut last_error = StoreError::NoHosts;
        for host in &self.hosts {
            let start = Instant::now();
            match build(&self.client, host).send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        "STORE | Request to {} failed after {} ms: {}",
                        host,
                        start.elapsed().as_millis(),
                        e
                    );
                    last_error = StoreError::Transport(e.to_string());
                }
            }
        }
        Err(last_error)
    }

    /// Checks that a cluster answers before any line is read.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let response = self.send(|client, host| client.get(format!("{host}/"))).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }
        debug!("STORE | Cluster is reachable");
        Ok(())
    }

    /// Installs (or replaces) the index template `name` covering
    /// `index_glob`, so partitions created later get the document mapping.
    pub async fn install_template(&self, name: &str, index_glob: &str) -> Result<(), StoreError> {
        let template = index_template(index_glob);
        let response = self
            .send(|client, host| {
                client
                    .put(format!("{host}/_index_template/{name}"))
                    .json(&template)
            })
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }
        info!("STORE | Index template {} covers {}", name, index_glob);
        Ok(())
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    /// Kept raw so one unreadable hit does not fail the whole fetch
    #[serde(default)]
    hits: Vec<Value>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_routing", default)]
    routing: Option<String>,
    #[serde(rename = "_source")]
    source: MessageDocument,
}

impl SearchHit {
    fn into_document(self) -> MessageDocument {
        self.source.with_linkage(StoreLinkage {
            location: self.index,
            id: self.id,
            parent_key: self.routing,
        })
    }
}

/// Decodes each hit on its own. Hits that do not read as a message document
/// are reported and skipped.
fn linked_documents(hits: Vec<Value>) -> Vec<MessageDocument> {
    hits.into_iter()
        .filter_map(|hit| {
            let location = format!(
                "{}/{}",
                hit.get("_index").and_then(Value::as_str).unwrap_or("?"),
                hit.get("_id").and_then(Value::as_str).unwrap_or("?")
            );
            match serde_json::from_value::<SearchHit>(hit) {
                Ok(hit) => Some(hit.into_document()),
                Err(e) => {
                    error!("PARSE ERROR for store: skipping stored document {location}: {e}");
                    None
                }
            }
        })
        .collect()
}

fn search_body(ids: &[String]) -> Value {
    let size = (ids.len() * HITS_PER_ID).clamp(MIN_SEARCH_SIZE, MAX_RESULT_WINDOW);
    json!({
        "size": size,
        "query": { "terms": { "qid": ids } }
    })
}

/// Composable index template for every partition the pattern produces.
/// `qid` must be a keyword, otherwise the exact-match lookup by queue id
/// misses mixed-case ids.
fn index_template(index_glob: &str) -> Value {
    json!({
        "index_patterns": [index_glob],
        "template": {
            "mappings": {
                "properties": {
                    "qid": { "type": "keyword" },
                    "host": { "type": "keyword" },
                    "date": { "type": "date" },
                    "isFinal": { "type": "boolean" },
                    "from": { "type": "keyword" },
                    "size": { "type": "long" },
                    "nrcpt": { "type": "integer" },
                    "uid": { "type": "integer" },
                    "message-id": { "type": "keyword" },
                    "resent-message-id": { "type": "keyword" },
                    "delay": { "type": "keyword" },
                    "delays": { "type": "keyword" },
                    "events": {
                        "properties": {
                            "action": { "type": "keyword" },
                            "date": { "type": "date" }
                        }
                    }
                }
            }
        }
    })
}

#[derive(Deserialize)]
struct BulkResponseBody {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BTreeMap<String, BulkItemResult>>,
}

#[derive(Deserialize)]
struct BulkItemResult {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

fn action_line(operation: &BulkOperation) -> Value {
    let (action, meta) = match operation {
        BulkOperation::Create {
            partition, parent, ..
        } => {
            let mut meta = Map::new();
            meta.insert("_index".to_string(), json!(partition));
            if let Some(parent) = parent {
                meta.insert("routing".to_string(), json!(parent));
            }
            ("create", meta)
        }
        BulkOperation::Update {
            location,
            id,
            parent,
            ..
        } => {
            let mut meta = Map::new();
            meta.insert("_index".to_string(), json!(location));
            meta.insert("_id".to_string(), json!(id));
            if let Some(parent) = parent {
                meta.insert("routing".to_string(), json!(parent));
            }
            ("index", meta)
        }
    };
    let mut line = Map::new();
    line.insert(action.to_string(), Value::Object(meta));
    Value::Object(line)
}

/// Newline-delimited bulk body: one action line followed by the document.
fn bulk_body(operations: &[BulkOperation]) -> Result<String, StoreError> {
    let mut body = String::new();
    for operation in operations {
        let action = serde_json::to_string(&action_line(operation))
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        let document = serde_json::to_string(operation.document())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        body.push_str(&action);
        body.push('\n');
        body.push_str(&document);
        body.push('\n');
    }
    Ok(body)
}

fn bulk_response(body: BulkResponseBody) -> BulkResponse {
    let items = body.items.len();
    let mut errors = Vec::new();
    if body.errors {
        for (index, item) in body.items.into_iter().enumerate() {
            let Some(result) = item.into_values().next() else {
                continue;
            };
            if let Some(error) = result.error {
                let reason = error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                errors.push(BulkItemError {
                    index,
                    status: result.status,
                    reason,
                });
            }
        }
    }
    BulkResponse { items, errors }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn search(
        &self,
        ids: &[String],
        partitions: &[String],
    ) -> Result<Vec<MessageDocument>, StoreError> {
        if ids.is_empty() || partitions.is_empty() {
            return Ok(Vec::new());
        }
        let indices = partitions.join(",");
        let query = search_body(ids);

        let response = self
            .send(|client, host| {
                client
                    .post(format!("{host}/{indices}/_search?ignore_unavailable=true"))
                    .json(&query)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = error_body(response).await;
            if body.contains("index_not_found_exception") {
                debug!("STORE | No partition exists yet in {}", indices);
                return Ok(Vec::new());
            }
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        debug!(
            "STORE | Found {} persisted documents for {} ids",
            parsed.hits.hits.len(),
            ids.len()
        );
        Ok(linked_documents(parsed.hits.hits))
    }

    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse, StoreError> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = bulk_body(&operations)?;

        let response = self
            .send(|client, host| {
                client
                    .post(format!("{host}/_bulk"))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: error_body(response).await,
            });
        }
        let parsed: BulkResponseBody = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(bulk_response(parsed))
    }
}
