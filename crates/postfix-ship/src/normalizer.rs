// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Folds a single record into the document of its queue id.
//!
//! Malformed records never fail the batch: they are reported as
//! `PARSE ERROR` diagnostics and dropped.

use crate::document::{EventAction, LifecycleEvent, MessageDocument};
use crate::record::{StructuredRecord, Subsystem};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::error;

/// Applies `record` to `doc` in place.
pub fn apply(doc: &mut MessageDocument, record: StructuredRecord) {
    let StructuredRecord {
        subsystem,
        message_id,
        timestamp,
        mut fields,
        ..
    } = record;

    match subsystem {
        Subsystem::QueueManager => {
            if fields.get("msg").map(String::as_str) == Some("removed") {
                doc.append_event(LifecycleEvent::bare(EventAction::Removed, timestamp));
                doc.mark_final();
                return;
            }
            if let Some(status) = fields.remove("status") {
                if status.contains("expired, returned") {
                    doc.append_event(LifecycleEvent::new(
                        EventAction::Expired,
                        timestamp,
                        fields,
                    ));
                } else {
                    parse_error(&subsystem, &message_id, &format!("unexpected status {status:?}"));
                }
                return;
            }
            doc.sender = Some(fields.remove("from").unwrap_or_default());
            if let Some(size) = take_number(&mut fields, "size", &subsystem, &message_id) {
                doc.size_bytes = Some(size);
            }
            if let Some(nrcpt) = take_number(&mut fields, "nrcpt", &subsystem, &message_id) {
                doc.recipient_count = Some(nrcpt);
            }
            doc.append_event(LifecycleEvent::new(EventAction::Queued, timestamp, fields));
        }
        Subsystem::Smtp => {
            if let Some(delay) = fields.remove("delay") {
                doc.delivery_delay = Some(delay);
            }
            if let Some(delays) = fields.remove("delays") {
                doc.delivery_delay_breakdown = Some(delays);
            }
            doc.append_event(LifecycleEvent::new(
                EventAction::DeliveryAttempt,
                timestamp,
                fields,
            ));
        }
        Subsystem::Cleanup => {
            if let Some(header) = fields.remove("message-id") {
                doc.message_id_header = Some(header);
            }
            if let Some(header) = fields.remove("resent-message-id") {
                doc.resent_message_id_header = Some(header);
            }
        }
        Subsystem::Scache => {
            // connection cache statistics carry nothing per-message
            if !fields.contains_key("statistics") {
                parse_error(&subsystem, &message_id, "unrecognized scache record");
            }
        }
        Subsystem::Pickup => {
            if let Some(uid) = take_number(&mut fields, "uid", &subsystem, &message_id) {
                doc.local_uid = Some(uid);
            } else if !fields.contains_key("uid") {
                parse_error(&subsystem, &message_id, "missing uid");
            }
        }
        Subsystem::Error => {
            doc.append_event(LifecycleEvent::new(EventAction::Error, timestamp, fields));
        }
        Subsystem::Bounce => {
            doc.append_event(LifecycleEvent::new(EventAction::Bounced, timestamp, fields));
        }
        Subsystem::Local => {
            doc.append_event(LifecycleEvent::new(
                EventAction::Custom("local".to_string()),
                timestamp,
                fields,
            ));
        }
        Subsystem::Postsuper => {
            let Some(msg) = fields.remove("msg") else {
                parse_error(&subsystem, &message_id, "missing action");
                return;
            };
            let removed = msg == "removed";
            doc.append_event(LifecycleEvent::bare(EventAction::from(msg), timestamp));
            if removed {
                doc.mark_final();
            }
        }
        Subsystem::Other(name) => {
            doc.append_event(LifecycleEvent::new(
                EventAction::Custom(name),
                timestamp,
                fields,
            ));
        }
    }
}

/// Removes `key` and parses it. An unparseable value is reported and left
/// in place so callers can tell it apart from an absent one.
fn take_number<T: FromStr>(
    fields: &mut BTreeMap<String, String>,
    key: &str,
    subsystem: &Subsystem,
    message_id: &str,
) -> Option<T> {
    let value = fields.get(key)?;
    match value.parse::<T>() {
        Ok(n) => {
            fields.remove(key);
            Some(n)
        }
        Err(_) => {
            parse_error(subsystem, message_id, &format!("{key} is not a number: {value:?}"));
            None
        }
    }
}

fn parse_error(subsystem: &Subsystem, message_id: &str, detail: &str) {
    error!(qid = message_id, "PARSE ERROR for {subsystem}: {detail}");
}
