// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch coordinator: fetch persisted state, merge pending records, persist,
//! and only then let the reader move on.
//!
//! A record counts as consumed once the bulk write holding its document is
//! confirmed. Failed cycles keep the pending queue and the open documents
//! and are retried after a backoff; once the retry ceiling is exceeded the
//! coordinator shuts down and refuses further cycles.

use crate::aggregator::DocumentAggregator;
use crate::cache::LinkageCache;
use crate::constants::{DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_CEILING};
use crate::document::MessageDocument;
use crate::partition::PartitionScheme;
use crate::record::StructuredRecord;
use crate::store::{BulkOperation, DocumentStore, StoreError};
use crate::watchdog::Watchdog;
use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Fetching,
    Merging,
    Persisting,
    Cooling,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Trigger,
    Fetched,
    Merged,
    Persisted,
    Failed,
    RetryDue,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal batch transition from {from:?} on {event:?}")]
pub struct IllegalTransition {
    pub from: BatchState,
    pub event: BatchEvent,
}

impl BatchState {
    /// Transition table. `ShuttingDown` is terminal.
    pub fn on(self, event: BatchEvent) -> Result<BatchState, IllegalTransition> {
        use BatchEvent as E;
        use BatchState as S;

        let next = match (self, event) {
            (S::ShuttingDown, _) => None,
            (_, E::Shutdown) => Some(S::ShuttingDown),
            (S::Idle, E::Trigger) => Some(S::Fetching),
            (S::Fetching, E::Fetched) => Some(S::Merging),
            (S::Merging, E::Merged) => Some(S::Persisting),
            (S::Persisting, E::Persisted) => Some(S::Idle),
            (S::Fetching | S::Merging | S::Persisting, E::Failed) => Some(S::Cooling),
            (S::Cooling, E::RetryDue) => Some(S::Fetching),
            _ => None,
        };
        next.ok_or(IllegalTransition { from: self, event })
    }

    pub fn is_idle(self) -> bool {
        self == BatchState::Idle
    }

    /// A cycle has started and not yet returned to `Idle`.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            BatchState::Fetching | BatchState::Merging | BatchState::Persisting | BatchState::Cooling
        )
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing was pending
    Empty,
    /// Every pending record is durably stored. The reader may resume after
    /// `resume_after`.
    Committed {
        records: usize,
        documents: usize,
        resume_after: Duration,
    },
    /// Not `Idle` when triggered; nothing happened
    Refused(BatchState),
    /// Shutdown requested while cooling down; pending records were kept
    Interrupted { pending: usize },
    /// Retry ceiling exceeded; the coordinator is shutting down
    Fatal { attempts: u32, error: StoreError },
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub retry_ceiling: u32,
    pub retry_backoff: Duration,
    pub inter_batch_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            retry_ceiling: DEFAULT_RETRY_CEILING,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            inter_batch_delay: Duration::ZERO,
        }
    }
}

pub struct BatchCoordinator {
    store: Arc<dyn DocumentStore>,
    cache: Option<Arc<dyn LinkageCache>>,
    partitions: PartitionScheme,
    config: CoordinatorConfig,
    watchdog: Watchdog,
    aggregator: DocumentAggregator,
    pending: Vec<StructuredRecord>,
    parents: HashMap<String, String>,
    retries: u32,
    state: watch::Sender<BatchState>,
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        partitions: PartitionScheme,
        config: CoordinatorConfig,
        watchdog: Watchdog,
    ) -> Self {
        let (state, _) = watch::channel(BatchState::Idle);
        BatchCoordinator {
            store,
            cache: None,
            partitions,
            config,
            watchdog,
            aggregator: DocumentAggregator::new(),
            pending: Vec::new(),
            parents: HashMap::new(),
            retries: 0,
            state,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn LinkageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> BatchState {
        *self.state.borrow()
    }

    /// Observes state changes from outside the pipeline task.
    pub fn subscribe(&self) -> watch::Receiver<BatchState> {
        self.state.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn open_documents(&self) -> usize {
        self.aggregator.len()
    }

    /// Queues a record for the next cycle. Hands the record back when a
    /// cycle is in flight or the coordinator is shutting down.
    pub fn enqueue(&mut self, record: StructuredRecord) -> Result<(), StructuredRecord> {
        if !self.state().is_idle() {
            return Err(record);
        }
        self.pending.push(record);
        Ok(())
    }

    fn advance(&mut self, event: BatchEvent) -> Result<(), IllegalTransition> {
        let from = self.state();
        let to = from.on(event)?;
        trace!("BATCH | {:?} -> {:?} on {:?}", from, to, event);
        self.state.send_replace(to);
        Ok(())
    }

    /// Runs one batch cycle over the pending queue, retrying failures until
    /// it commits, is interrupted by `shutdown`, or exhausts its retries.
    ///
    /// Exhausting the retries cancels `shutdown`.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> CycleOutcome {
        let state = self.state();
        if !state.is_idle() {
            debug!("BATCH | Ignoring trigger while {:?}", state);
            return CycleOutcome::Refused(state);
        }
        if self.pending.is_empty() {
            return CycleOutcome::Empty;
        }
        match self.cycle(shutdown).await {
            Ok(outcome) => outcome,
            Err(illegal) => {
                error!("BATCH | {}", illegal);
                CycleOutcome::Refused(self.state())
            }
        }
    }

    async fn cycle(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<CycleOutcome, IllegalTransition> {
        self.advance(BatchEvent::Trigger)?;
        loop {
            self.watchdog.reset();
            let failure = match self.fetch().await {
                Err(e) => e,
                Ok(()) => {
                    self.advance(BatchEvent::Fetched)?;
                    self.merge();
                    self.advance(BatchEvent::Merged)?;
                    match self.persist().await {
                        Ok(()) => {
                            self.advance(BatchEvent::Persisted)?;
                            return Ok(self.commit());
                        }
                        Err(e) => e,
                    }
                }
            };

            self.advance(BatchEvent::Failed)?;
            self.retries += 1;
            if self.retries > self.config.retry_ceiling {
                self.advance(BatchEvent::Shutdown)?;
                error!(
                    "BATCH | Giving up after {} failed attempts, {} records not persisted: {}",
                    self.retries,
                    self.pending.len(),
                    failure
                );
                shutdown.cancel();
                return Ok(CycleOutcome::Fatal {
                    attempts: self.retries,
                    error: failure,
                });
            }
            warn!(
                "BATCH | Attempt {} failed, retrying in {:?}: {}",
                self.retries, self.config.retry_backoff, failure
            );
            tokio::select! {
                () = sleep(self.config.retry_backoff) => self.advance(BatchEvent::RetryDue)?,
                () = shutdown.cancelled() => {
                    self.advance(BatchEvent::Shutdown)?;
                    warn!(
                        "BATCH | Shutdown during backoff, {} records left unpersisted",
                        self.pending.len()
                    );
                    return Ok(CycleOutcome::Interrupted {
                        pending: self.pending.len(),
                    });
                }
            }
        }
    }

    async fn fetch(&mut self) -> Result<(), StoreError> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .map(|record| record.message_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let partitions = self
            .partitions
            .search_partitions(self.pending.iter().map(|record| &record.timestamp));
        debug!(
            "BATCH | Fetching {} ids from {} partitions",
            ids.len(),
            partitions.len()
        );

        let existing = self.store.search(&ids, &partitions).await?;
        self.aggregator.seed(existing);

        if let Some(cache) = &self.cache {
            match cache.multi_get(&ids).await {
                Ok(parents) => self.parents = parents,
                Err(e) => warn!("BATCH | Skipping linkage enrichment: {}", e),
            }
        }
        Ok(())
    }

    fn merge(&mut self) {
        for record in &self.pending {
            self.aggregator.fold(record.clone());
        }
    }

    fn operation_for(&self, doc: &MessageDocument) -> BulkOperation {
        let cached_parent = || self.parents.get(&doc.message_id).cloned();
        match &doc.linkage {
            Some(linkage) => BulkOperation::Update {
                location: linkage.location.clone(),
                id: linkage.id.clone(),
                parent: linkage.parent_key.clone().or_else(cached_parent),
                document: doc.clone(),
            },
            None => BulkOperation::Create {
                partition: self.partitions.partition_for(&doc.first_seen),
                parent: cached_parent(),
                document: doc.clone(),
            },
        }
    }

    async fn persist(&mut self) -> Result<(), StoreError> {
        let operations: Vec<BulkOperation> = self
            .aggregator
            .snapshot()
            .into_iter()
            .map(|doc| self.operation_for(doc))
            .collect();
        let creates = operations.iter().filter(|op| op.is_create()).count();
        debug!(
            "BATCH | Persisting {} documents ({} new)",
            operations.len(),
            creates
        );
        self.store.bulk(operations).await?.into_result()?;
        Ok(())
    }

    fn commit(&mut self) -> CycleOutcome {
        let records = self.pending.len();
        let documents = self.aggregator.drain_all().len();
        self.pending.clear();
        self.parents.clear();
        self.retries = 0;
        info!(
            "BATCH | Committed {} records into {} documents",
            records, documents
        );
        CycleOutcome::Committed {
            records,
            documents,
            resume_after: self.config.inter_batch_delay,
        }
    }
}
