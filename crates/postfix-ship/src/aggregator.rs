// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::document::MessageDocument;
use crate::normalizer;
use crate::record::StructuredRecord;
use hashbrown::HashMap;
use tracing::debug;

/// Documents open in the current batch cycle, keyed by queue id.
#[derive(Debug, Default)]
pub struct DocumentAggregator {
    open_docs: HashMap<String, MessageDocument>,
}

impl DocumentAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs persisted copies fetched from the store.
    ///
    /// A document already open locally wins; it only adopts the store
    /// linkage when it has none, so that a retry after a partially applied
    /// bulk write updates the stored copy instead of creating another one.
    pub fn seed(&mut self, existing: Vec<MessageDocument>) {
        for persisted in existing {
            match self.open_docs.get_mut(&persisted.message_id) {
                Some(local) => {
                    if local.linkage.is_none() {
                        local.linkage = persisted.linkage;
                    }
                }
                None => {
                    self.open_docs
                        .insert(persisted.message_id.clone(), persisted);
                }
            }
        }
        debug!("Seeded aggregator, {} open documents", self.open_docs.len());
    }

    pub fn fold(&mut self, record: StructuredRecord) {
        let doc = self
            .open_docs
            .entry(record.message_id.clone())
            .or_insert_with(|| {
                MessageDocument::new(
                    record.message_id.clone(),
                    record.host.clone(),
                    record.timestamp,
                )
            });
        normalizer::apply(doc, record);
    }

    /// Hands every open document over for persistence, ordered by queue id.
    pub fn drain_all(&mut self) -> Vec<MessageDocument> {
        let mut docs: Vec<MessageDocument> = self.open_docs.drain().map(|(_, doc)| doc).collect();
        docs.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        docs
    }

    /// Read-only view used to build a bulk request without consuming the
    /// documents, ordered by queue id.
    pub fn snapshot(&self) -> Vec<&MessageDocument> {
        let mut docs: Vec<&MessageDocument> = self.open_docs.values().collect();
        docs.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        docs
    }

    pub fn get(&self, message_id: &str) -> Option<&MessageDocument> {
        self.open_docs.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.open_docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_docs.is_empty()
    }

    pub fn clear(&mut self) {
        self.open_docs.clear();
    }
}
