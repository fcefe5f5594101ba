// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory stand-ins for the store, the linkage cache and the reader

use async_trait::async_trait;
use postfix_ship::cache::{CacheError, LinkageCache};
use postfix_ship::document::{MessageDocument, StoreLinkage};
use postfix_ship::errors::ReaderError;
use postfix_ship::reader::{LineReader, ReaderEvent};
use postfix_ship::store::{BulkItemError, BulkOperation, BulkResponse, DocumentStore, StoreError};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub index: String,
    pub id: String,
    pub document: MessageDocument,
}

#[derive(Default)]
struct MockStoreState {
    documents: Vec<StoredDocument>,
    next_id: usize,
    search_failures: u32,
    bulk_failures: u32,
    partial_failures: u32,
    search_calls: usize,
    bulks: Vec<Vec<BulkOperation>>,
}

/// Store that keeps documents in memory and fails on demand
#[derive(Default)]
pub struct MockStore {
    state: Mutex<MockStoreState>,
}

#[allow(dead_code)]
impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `n` searches with a transport error
    pub fn fail_searches(&self, n: u32) {
        self.state.lock().unwrap().search_failures = n;
    }

    /// Fails the next `n` bulk requests outright
    pub fn fail_bulks(&self, n: u32) {
        self.state.lock().unwrap().bulk_failures = n;
    }

    /// Applies only the first operation of the next `n` bulk requests
    pub fn fail_bulk_items(&self, n: u32) {
        self.state.lock().unwrap().partial_failures = n;
    }

    pub fn search_calls(&self) -> usize {
        self.state.lock().unwrap().search_calls
    }

    pub fn bulk_calls(&self) -> usize {
        self.state.lock().unwrap().bulks.len()
    }

    pub fn bulks(&self) -> Vec<Vec<BulkOperation>> {
        self.state.lock().unwrap().bulks.clone()
    }

    pub fn stored(&self) -> Vec<StoredDocument> {
        self.state.lock().unwrap().documents.clone()
    }

    pub fn insert(&self, index: &str, document: MessageDocument) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("doc-{}", state.next_id);
        state.documents.push(StoredDocument {
            index: index.to_string(),
            id,
            document,
        });
    }
}

fn apply(state: &mut MockStoreState, operation: BulkOperation) {
    match operation {
        BulkOperation::Create {
            partition,
            document,
            ..
        } => {
            state.next_id += 1;
            let id = format!("doc-{}", state.next_id);
            state.documents.push(StoredDocument {
                index: partition,
                id,
                document,
            });
        }
        BulkOperation::Update {
            location,
            id,
            document,
            ..
        } => {
            match state
                .documents
                .iter_mut()
                .find(|stored| stored.index == location && stored.id == id)
            {
                Some(stored) => stored.document = document,
                None => state.documents.push(StoredDocument {
                    index: location,
                    id,
                    document,
                }),
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    async fn search(
        &self,
        ids: &[String],
        partitions: &[String],
    ) -> Result<Vec<MessageDocument>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.search_calls += 1;
        if state.search_failures > 0 {
            state.search_failures -= 1;
            return Err(StoreError::Transport("connection refused".to_string()));
        }
        Ok(state
            .documents
            .iter()
            .filter(|stored| {
                ids.contains(&stored.document.message_id) && partitions.contains(&stored.index)
            })
            .map(|stored| {
                stored.document.clone().with_linkage(StoreLinkage {
                    location: stored.index.clone(),
                    id: stored.id.clone(),
                    parent_key: None,
                })
            })
            .collect())
    }

    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.bulks.push(operations.clone());
        if state.bulk_failures > 0 {
            state.bulk_failures -= 1;
            return Err(StoreError::Status {
                status: 503,
                body: "cluster unavailable".to_string(),
            });
        }

        let items = operations.len();
        let partial = state.partial_failures > 0;
        if partial {
            state.partial_failures -= 1;
        }
        let mut errors = Vec::new();
        for (index, operation) in operations.into_iter().enumerate() {
            if partial && index > 0 {
                errors.push(BulkItemError {
                    index,
                    status: 429,
                    reason: "rejected".to_string(),
                });
                continue;
            }
            apply(&mut state, operation);
        }
        Ok(BulkResponse { items, errors })
    }
}

/// Linkage cache backed by a fixed map
pub struct StaticLinkageCache {
    pub parents: HashMap<String, String>,
    pub available: bool,
}

#[async_trait]
impl LinkageCache for StaticLinkageCache {
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, String>, CacheError> {
        if !self.available {
            return Err(CacheError::Unavailable("connection reset".to_string()));
        }
        Ok(keys
            .iter()
            .filter_map(|key| self.parents.get(key).map(|p| (key.clone(), p.clone())))
            .collect())
    }
}

/// Reader over a fixed list of lines that closes once they are consumed
pub struct VecReader {
    lines: VecDeque<String>,
    batch_limit: usize,
    unconfirmed: usize,
    resumes: Arc<AtomicUsize>,
}

impl VecReader {
    pub fn new(lines: &[&str], batch_limit: usize) -> (Self, Arc<AtomicUsize>) {
        let resumes = Arc::new(AtomicUsize::new(0));
        let reader = VecReader {
            lines: lines.iter().map(|line| line.to_string()).collect(),
            batch_limit,
            unconfirmed: 0,
            resumes: Arc::clone(&resumes),
        };
        (reader, resumes)
    }
}

#[async_trait]
impl LineReader for VecReader {
    async fn next_event(&mut self) -> Result<ReaderEvent, ReaderError> {
        if self.unconfirmed >= self.batch_limit {
            return Ok(ReaderEvent::Batch);
        }
        match self.lines.pop_front() {
            Some(line) => {
                self.unconfirmed += 1;
                Ok(ReaderEvent::Line(line))
            }
            None if self.unconfirmed > 0 => Ok(ReaderEvent::Batch),
            None => Ok(ReaderEvent::Closed),
        }
    }

    async fn resume(&mut self) -> Result<(), ReaderError> {
        self.unconfirmed = 0;
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
