// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Inactivity timer reset on every batch attempt.
///
/// Clones share the same timer: the coordinator keeps one to reset it and
/// [`Watchdog::run`] consumes another.
#[derive(Debug, Clone)]
pub struct Watchdog {
    idle_timeout: Duration,
    last_attempt: Arc<Mutex<Instant>>,
}

impl Watchdog {
    pub fn new(idle_timeout: Duration) -> Self {
        Watchdog {
            idle_timeout,
            last_attempt: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn reset(&self) {
        match self.last_attempt.lock() {
            Ok(mut last) => *last = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    fn deadline(&self) -> Instant {
        let last = match self.last_attempt.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last + self.idle_timeout
    }

    /// Waits until no batch was attempted for the idle timeout, then requests
    /// shutdown through `shutdown`. Returns whether the watchdog fired.
    pub async fn run(self, shutdown: CancellationToken) -> bool {
        loop {
            let deadline = self.deadline();
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("WATCHDOG | Stopped");
                    return false;
                }
                () = sleep_until(deadline) => {
                    if Instant::now() >= self.deadline() {
                        error!(
                            "WATCHDOG | No batch attempted in {:?}, shutting down",
                            self.idle_timeout
                        );
                        shutdown.cancel();
                        return true;
                    }
                }
            }
        }
    }
}
