// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-message lifecycle document and its events.
//!
//! The serialized field names match the documents already present in the
//! store (`qid`, `date`, `isFinal`, `from`, ...) so that a restarted process
//! keeps correlating against what earlier runs persisted.

use crate::constants::RESERVED_FIELDS;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::trace;

/// What happened to a message at one point of its lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventAction {
    Queued,
    Removed,
    Bounced,
    Expired,
    Error,
    /// Stored events without an action predate the action field and were
    /// always delivery attempts.
    #[default]
    DeliveryAttempt,
    Custom(String),
}

impl EventAction {
    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Queued => "queued",
            EventAction::Removed => "removed",
            EventAction::Bounced => "bounced",
            EventAction::Expired => "expired",
            EventAction::Error => "error",
            EventAction::DeliveryAttempt => "delivery",
            EventAction::Custom(name) => name,
        }
    }
}

/// Parsing is canonical: a name that matches a known action always yields
/// that variant, never `Custom`.
impl From<String> for EventAction {
    fn from(name: String) -> Self {
        match name.as_str() {
            "queued" => EventAction::Queued,
            "removed" => EventAction::Removed,
            "bounced" => EventAction::Bounced,
            "expired" => EventAction::Expired,
            "error" => EventAction::Error,
            "delivery" => EventAction::DeliveryAttempt,
            _ => EventAction::Custom(name),
        }
    }
}

impl From<&str> for EventAction {
    fn from(name: &str) -> Self {
        EventAction::from(name.to_string())
    }
}

impl From<EventAction> for String {
    fn from(action: EventAction) -> Self {
        match action {
            EventAction::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// Immutable value; two events are duplicates when every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(default)]
    pub action: EventAction,
    #[serde(rename = "date")]
    pub timestamp: DateTime<FixedOffset>,
    #[serde(flatten, deserialize_with = "scalar_fields")]
    pub fields: BTreeMap<String, String>,
}

impl LifecycleEvent {
    /// Builds an event, dropping the line metadata (`qid`, `host`, `prog`)
    /// and any key that would shadow `action` or `date` once serialized.
    pub fn new(
        action: EventAction,
        timestamp: DateTime<FixedOffset>,
        mut fields: BTreeMap<String, String>,
    ) -> Self {
        fields.retain(|key, _| {
            !RESERVED_FIELDS.contains(&key.as_str()) && key != "action" && key != "date"
        });
        LifecycleEvent {
            action,
            timestamp,
            fields,
        }
    }

    pub fn bare(action: EventAction, timestamp: DateTime<FixedOffset>) -> Self {
        LifecycleEvent::new(action, timestamp, BTreeMap::new())
    }
}

/// Where a persisted document lives. Present only on documents fetched from
/// the store, which turns their write into an update instead of a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLinkage {
    /// Partition (index) holding the document
    pub location: String,
    /// Store-assigned document id
    pub id: String,
    pub parent_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDocument {
    #[serde(rename = "qid")]
    pub message_id: String,
    pub host: String,
    #[serde(rename = "date")]
    pub first_seen: DateTime<FixedOffset>,
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(
        rename = "size",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub size_bytes: Option<u64>,
    #[serde(
        rename = "nrcpt",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub recipient_count: Option<u32>,
    #[serde(
        rename = "uid",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_number"
    )]
    pub local_uid: Option<u32>,
    #[serde(rename = "message-id", default, skip_serializing_if = "Option::is_none")]
    pub message_id_header: Option<String>,
    #[serde(
        rename = "resent-message-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resent_message_id_header: Option<String>,
    #[serde(rename = "delay", default, skip_serializing_if = "Option::is_none")]
    pub delivery_delay: Option<String>,
    #[serde(rename = "delays", default, skip_serializing_if = "Option::is_none")]
    pub delivery_delay_breakdown: Option<String>,
    #[serde(default)]
    events: Vec<LifecycleEvent>,
    #[serde(rename = "isFinal", default)]
    is_final: bool,
    #[serde(skip)]
    pub linkage: Option<StoreLinkage>,
}

impl MessageDocument {
    /// Skeleton document for a queue id seen for the first time.
    pub fn new(
        message_id: impl Into<String>,
        host: impl Into<String>,
        first_seen: DateTime<FixedOffset>,
    ) -> Self {
        MessageDocument {
            message_id: message_id.into(),
            host: host.into(),
            first_seen,
            sender: None,
            size_bytes: None,
            recipient_count: None,
            local_uid: None,
            message_id_header: None,
            resent_message_id_header: None,
            delivery_delay: None,
            delivery_delay_breakdown: None,
            events: Vec::new(),
            is_final: false,
            linkage: None,
        }
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Terminal actions only ever move the flag forward.
    pub fn mark_final(&mut self) {
        self.is_final = true;
    }

    /// Appends `event` unless it is redundant. A document keeps at most one
    /// `Queued` event (the first one) and never two equal events.
    ///
    /// Returns whether the event was appended.
    pub fn append_event(&mut self, event: LifecycleEvent) -> bool {
        if event.action == EventAction::Queued
            && self.events.iter().any(|e| e.action == EventAction::Queued)
        {
            trace!(qid = %self.message_id, "skipping redundant queued event");
            return false;
        }
        if self.events.contains(&event) {
            trace!(qid = %self.message_id, action = event.action.as_str(), "skipping duplicate event");
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn with_linkage(mut self, linkage: StoreLinkage) -> Self {
        self.linkage = Some(linkage);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

/// Older documents carry counters as strings.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + FromStr,
{
    Ok(
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => None,
            Some(NumberOrText::Number(n)) => T::try_from(n).ok(),
            Some(NumberOrText::Text(s)) => s.trim().parse::<T>().ok(),
        },
    )
}

/// Event fields written by other tools may hold numbers or booleans.
/// Nulls are dropped and nested values are kept as their JSON text.
fn scalar_fields<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::String(text) => Some((key, text)),
            other => Some((key, other.to_string())),
        })
        .collect())
}
