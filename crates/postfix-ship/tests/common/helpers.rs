// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use super::mocks::MockStore;
use chrono::{DateTime, FixedOffset};
use postfix_ship::coordinator::{BatchCoordinator, CoordinatorConfig};
use postfix_ship::partition::PartitionScheme;
use postfix_ship::record::{StructuredRecord, Subsystem};
use postfix_ship::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;

pub fn ts(stamp: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(stamp).unwrap()
}

pub fn partitions() -> PartitionScheme {
    PartitionScheme::new("postfix-%Y-%m-%d", chrono_tz::America::Phoenix, 1).unwrap()
}

pub fn coordinator(store: &Arc<MockStore>) -> BatchCoordinator {
    coordinator_with(store, CoordinatorConfig::default())
}

pub fn coordinator_with(store: &Arc<MockStore>, config: CoordinatorConfig) -> BatchCoordinator {
    BatchCoordinator::new(
        store.clone(),
        partitions(),
        config,
        Watchdog::new(Duration::from_secs(6 * 60 * 60)),
    )
}

/// Coordinator that resets `watchdog` on each batch attempt
pub fn coordinator_watched(store: &Arc<MockStore>, watchdog: Watchdog) -> BatchCoordinator {
    BatchCoordinator::new(store.clone(), partitions(), CoordinatorConfig::default(), watchdog)
}

pub fn enqueue(qid: &str, at: &str, from: &str, size: &str, nrcpt: &str) -> StructuredRecord {
    StructuredRecord::new(Subsystem::QueueManager, qid, "mx12", ts(at))
        .with_field("from", from)
        .with_field("size", size)
        .with_field("nrcpt", nrcpt)
}

pub fn delivery(qid: &str, at: &str, delay: &str) -> StructuredRecord {
    StructuredRecord::new(Subsystem::Smtp, qid, "mx12", ts(at))
        .with_field("to", "user@example.com")
        .with_field("relay", "127.0.0.2[127.0.0.2]:25")
        .with_field("delay", delay)
        .with_field("status", "sent (250 Queued!)")
}

pub fn removed(qid: &str, at: &str) -> StructuredRecord {
    StructuredRecord::new(Subsystem::QueueManager, qid, "mx12", ts(at)).with_field("msg", "removed")
}

/// Enqueue, delivery attempt and removal of one message
pub fn lifecycle(qid: &str) -> Vec<StructuredRecord> {
    vec![
        enqueue(qid, "2015-07-26T04:18:34-07:00", "sys", "813", "1"),
        delivery(qid, "2015-07-26T04:18:35-07:00", "0.5"),
        removed(qid, "2015-07-26T04:18:36-07:00"),
    ]
}
