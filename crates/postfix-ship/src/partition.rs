// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Days, FixedOffset};
use chrono_tz::Tz;
use std::collections::BTreeSet;

/// Maps timestamps to store partitions (time-based index names).
///
/// A pattern without date specifiers, e.g. `postfix-orphan`, yields a single
/// partition.
#[derive(Debug, Clone)]
pub struct PartitionScheme {
    pattern: String,
    timezone: Tz,
    lookback_days: u32,
}

impl PartitionScheme {
    pub fn new(
        pattern: impl Into<String>,
        timezone: Tz,
        lookback_days: u32,
    ) -> Result<Self, ConfigError> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "index pattern cannot be empty".to_string(),
            ));
        }
        if StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Invalid(format!(
                "index pattern '{pattern}' is not a valid strftime format"
            )));
        }
        if pattern.starts_with('%') {
            return Err(ConfigError::Invalid(format!(
                "index pattern '{pattern}' must start with a literal prefix"
            )));
        }
        Ok(PartitionScheme {
            pattern,
            timezone,
            lookback_days,
        })
    }

    /// Partition a new document is created in.
    pub fn partition_for(&self, timestamp: &DateTime<FixedOffset>) -> String {
        timestamp
            .with_timezone(&self.timezone)
            .format(&self.pattern)
            .to_string()
    }

    /// Partitions to search for the documents touched by records at
    /// `timestamps`: each record's own partition plus the preceding
    /// `lookback_days`, deduplicated and sorted.
    pub fn search_partitions<'a>(
        &self,
        timestamps: impl IntoIterator<Item = &'a DateTime<FixedOffset>>,
    ) -> Vec<String> {
        let mut partitions = BTreeSet::new();
        for timestamp in timestamps {
            for days in 0..=self.lookback_days {
                if let Some(earlier) = timestamp.checked_sub_days(Days::new(u64::from(days))) {
                    partitions.insert(self.partition_for(&earlier));
                }
            }
        }
        partitions.into_iter().collect()
    }

    /// Index pattern matching every partition this scheme can produce: the
    /// literal prefix up to the first date specifier, then `*`.
    pub fn index_glob(&self) -> String {
        match self.pattern.find('%') {
            Some(start) => format!("{}*", &self.pattern[..start]),
            None => self.pattern.clone(),
        }
    }
}
