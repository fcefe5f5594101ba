// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::SHUTDOWN_POLL_INTERVAL;
use crate::coordinator::BatchState;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why the process is going down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT/SIGTERM from the operator or supervisor
    Signal,
    /// Stop requested from inside the pipeline (watchdog, exhausted retries,
    /// or end of input)
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No batch was in flight
    Immediate,
    /// The in-flight batch finished before the deadline
    Drained,
    /// Gave up waiting for the in-flight batch
    DeadlineExceeded,
}

/// Graceful drain: stop the producer, then give an in-flight batch until
/// the deadline to return the coordinator to a resting state.
pub struct ShutdownCoordinator {
    producer: CancellationToken,
    state: watch::Receiver<BatchState>,
    deadline: Duration,
    poll_interval: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        producer: CancellationToken,
        state: watch::Receiver<BatchState>,
        deadline: Duration,
    ) -> Self {
        ShutdownCoordinator {
            producer,
            state,
            deadline,
            poll_interval: SHUTDOWN_POLL_INTERVAL,
        }
    }

    fn in_flight(&self) -> bool {
        self.state.borrow().is_in_flight()
    }

    pub async fn drain(&self, reason: ShutdownReason) -> ShutdownOutcome {
        info!("SHUTDOWN | Stopping reader ({:?})", reason);
        self.producer.cancel();

        if !self.in_flight() {
            return ShutdownOutcome::Immediate;
        }

        let deadline = Instant::now() + self.deadline;
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if !self.in_flight() {
                info!("SHUTDOWN | In-flight batch finished");
                return ShutdownOutcome::Drained;
            }
            if Instant::now() >= deadline {
                warn!(
                    "SHUTDOWN | Batch still {:?} after {:?}, exiting anyway",
                    *self.state.borrow(),
                    self.deadline
                );
                return ShutdownOutcome::DeadlineExceeded;
            }
        }
    }
}
