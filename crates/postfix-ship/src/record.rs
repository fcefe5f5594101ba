// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, FixedOffset};
use std::collections::BTreeMap;
use std::fmt;

/// Postfix daemon that emitted a log line.
///
/// The set is closed over the daemons whose lines change a message document;
/// anything else under the postfix namespace is kept as `Other` so new
/// daemons still land as custom events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subsystem {
    QueueManager,
    Smtp,
    Cleanup,
    Scache,
    Pickup,
    Error,
    Bounce,
    Local,
    Postsuper,
    Other(String),
}

impl Subsystem {
    /// Resolves a syslog program tag such as `postfix/qmgr` or
    /// `postfix-out/smtp`. Tags outside the postfix namespace return `None`.
    pub fn from_program(program: &str) -> Option<Self> {
        let (namespace, name) = program.split_once('/')?;
        let in_namespace = namespace == "postfix"
            || namespace
                .strip_prefix("postfix-")
                .is_some_and(|instance| !instance.is_empty());
        if !in_namespace || name.is_empty() {
            return None;
        }
        Some(Self::from_name(name))
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "qmgr" => Subsystem::QueueManager,
            "smtp" => Subsystem::Smtp,
            "cleanup" => Subsystem::Cleanup,
            "scache" => Subsystem::Scache,
            "pickup" => Subsystem::Pickup,
            "error" => Subsystem::Error,
            "bounce" => Subsystem::Bounce,
            "local" => Subsystem::Local,
            "postsuper" => Subsystem::Postsuper,
            other => Subsystem::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Subsystem::QueueManager => "qmgr",
            Subsystem::Smtp => "smtp",
            Subsystem::Cleanup => "cleanup",
            Subsystem::Scache => "scache",
            Subsystem::Pickup => "pickup",
            Subsystem::Error => "error",
            Subsystem::Bounce => "bounce",
            Subsystem::Local => "local",
            Subsystem::Postsuper => "postsuper",
            Subsystem::Other(name) => name,
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tokenized log line that belongs to a queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRecord {
    pub subsystem: Subsystem,
    /// Postfix queue id, the correlation key
    pub message_id: String,
    pub host: String,
    pub timestamp: DateTime<FixedOffset>,
    pub fields: BTreeMap<String, String>,
}

impl StructuredRecord {
    pub fn new(
        subsystem: Subsystem,
        message_id: impl Into<String>,
        host: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
    ) -> Self {
        StructuredRecord {
            subsystem,
            message_id: message_id.into(),
            host: host.into(),
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}
