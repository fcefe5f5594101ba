// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::document::MessageDocument;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no store hosts configured")]
    NoHosts,
    #[error("store request failed: {0}")]
    Transport(String),
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid store response: {0}")]
    Decode(String),
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("bulk write failed for {failed} of {total} items: {first}")]
    PartialBulk {
        failed: usize,
        total: usize,
        first: String,
    },
}

/// One write of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Document not yet in the store
    Create {
        partition: String,
        document: MessageDocument,
        parent: Option<String>,
    },
    /// Replaces the stored copy at `location`/`id`
    Update {
        location: String,
        id: String,
        document: MessageDocument,
        parent: Option<String>,
    },
}

impl BulkOperation {
    pub fn document(&self) -> &MessageDocument {
        match self {
            BulkOperation::Create { document, .. } | BulkOperation::Update { document, .. } => {
                document
            }
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, BulkOperation::Create { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemError {
    /// Position of the failed operation within the request
    pub index: usize,
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: usize,
    pub errors: Vec<BulkItemError>,
}

impl BulkResponse {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// A bulk write only counts when every item was applied.
    pub fn into_result(self) -> Result<usize, StoreError> {
        match self.errors.first() {
            None => Ok(self.items),
            Some(first) => Err(StoreError::PartialBulk {
                failed: self.errors.len(),
                total: self.items,
                first: format!("item {} ({}): {}", first.index, first.status, first.reason),
            }),
        }
    }
}

/// Searchable document store holding the correlated message documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the persisted documents for `ids` found in `partitions`,
    /// each carrying its store linkage. Missing partitions are not an error.
    async fn search(
        &self,
        ids: &[String],
        partitions: &[String],
    ) -> Result<Vec<MessageDocument>, StoreError>;

    /// Submits all operations as a single request.
    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse, StoreError>;
}
