// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::coordinator::{BatchCoordinator, BatchState, CycleOutcome};
use crate::record::StructuredRecord;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum FlowSignal {
    /// Keep reading
    Continue,
    /// The queue filled up and a batch cycle ran
    Cycle(CycleOutcome),
    /// The coordinator no longer accepts records
    Refused(BatchState),
}

/// Bounded hand-off between the reader and the batch coordinator.
///
/// The caller awaits every cycle this controller starts, so the reader is
/// suspended for as long as a batch is in flight.
pub struct FlowController {
    coordinator: BatchCoordinator,
    limit: usize,
}

impl FlowController {
    pub fn new(coordinator: BatchCoordinator, limit: usize) -> Self {
        FlowController {
            coordinator,
            limit: limit.max(1),
        }
    }

    pub async fn push(
        &mut self,
        record: StructuredRecord,
        shutdown: &CancellationToken,
    ) -> FlowSignal {
        if let Err(record) = self.coordinator.enqueue(record) {
            let state = self.coordinator.state();
            warn!(
                "FLOW | Coordinator is {:?}, not accepting record for {}",
                state, record.message_id
            );
            return FlowSignal::Refused(state);
        }
        if self.coordinator.pending_len() < self.limit {
            return FlowSignal::Continue;
        }
        debug!("FLOW | Pending queue reached {} records", self.limit);
        FlowSignal::Cycle(self.coordinator.run_cycle(shutdown).await)
    }

    /// The reader has nothing more to offer right now.
    pub async fn input_drained(&mut self, shutdown: &CancellationToken) -> CycleOutcome {
        self.coordinator.run_cycle(shutdown).await
    }

    pub fn pending_len(&self) -> usize {
        self.coordinator.pending_len()
    }

    pub fn state(&self) -> BatchState {
        self.coordinator.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchState> {
        self.coordinator.subscribe()
    }
}
