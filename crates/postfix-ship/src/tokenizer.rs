// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw syslog lines into [`StructuredRecord`]s.
//!
//! Only lines that carry a postfix queue id produce a record. Everything
//! else, including postfix lines without a queue id (`NOQUEUE`, connection
//! chatter, cache statistics), is not applicable and silently skipped.

use crate::record::{StructuredRecord, Subsystem};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub enum Tokenized {
    Record(StructuredRecord),
    NotApplicable,
    /// Looked like a postfix line but could not be parsed
    Malformed { subsystem: String, detail: String },
}

pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, line: &str) -> Tokenized;
}

#[allow(clippy::expect_used)]
fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<month>[A-Z][a-z]{2})\s+(?P<day>\d{1,2})\s+(?P<time>\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+(?P<prog>[^\s\[:]+)(?:\[\d+\])?:\s+(?P<msg>.*)$",
        )
        .expect("failed creating regex")
    })
}

#[allow(clippy::expect_used)]
fn queue_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // short ids are upper-case hex, long ids avoid vowels
        Regex::new(
            r"^(?P<qid>[0-9A-F]{6,}|[0-9B-DF-HJ-NP-TV-Zb-df-hj-np-tv-z]{10,}):\s+(?P<body>.*)$",
        )
        .expect("failed creating regex")
    })
}

#[allow(clippy::expect_used)]
fn leading_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*=").expect("failed creating regex")
    })
}

#[allow(clippy::expect_used)]
fn next_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:,\s*|\s+)[A-Za-z][A-Za-z0-9_-]*=").expect("failed creating regex")
    })
}

/// Tokenizer for `MMM dd HH:MM:SS host program[pid]: message` lines.
#[derive(Debug, Clone)]
pub struct SyslogTokenizer {
    timezone: Tz,
    /// Fixed year instead of inferring it from the clock
    year: Option<i32>,
}

impl SyslogTokenizer {
    pub fn new(timezone: Tz) -> Self {
        SyslogTokenizer {
            timezone,
            year: None,
        }
    }

    pub fn with_year(timezone: Tz, year: i32) -> Self {
        SyslogTokenizer {
            timezone,
            year: Some(year),
        }
    }

    /// Syslog stamps carry no year. Use the current one, unless that puts
    /// the line more than a day into the future (a December line read in
    /// January).
    fn timestamp(&self, month: &str, day: &str, time: &str) -> Option<DateTime<FixedOffset>> {
        let local = |year: i32| -> Option<DateTime<FixedOffset>> {
            let naive = NaiveDateTime::parse_from_str(
                &format!("{year} {month} {day} {time}"),
                "%Y %b %d %H:%M:%S",
            )
            .ok()?;
            self.timezone
                .from_local_datetime(&naive)
                .earliest()
                .map(|stamp| stamp.fixed_offset())
        };

        if let Some(year) = self.year {
            return local(year);
        }
        let now = Utc::now().with_timezone(&self.timezone);
        let stamp = local(now.year())?;
        if stamp > now.fixed_offset() + Duration::days(1) {
            return local(now.year() - 1);
        }
        Some(stamp)
    }
}

impl Tokenizer for SyslogTokenizer {
    fn tokenize(&self, line: &str) -> Tokenized {
        let Some(header) = header_pattern().captures(line) else {
            if line.contains("postfix") {
                return Tokenized::Malformed {
                    subsystem: "syslog".to_string(),
                    detail: "unrecognized syslog header".to_string(),
                };
            }
            return Tokenized::NotApplicable;
        };

        let program = &header["prog"];
        let Some(subsystem) = Subsystem::from_program(program) else {
            return Tokenized::NotApplicable;
        };
        let Some(message) = queue_id_pattern().captures(&header["msg"]) else {
            return Tokenized::NotApplicable;
        };
        let qid = &message["qid"];

        let Some(timestamp) = self.timestamp(&header["month"], &header["day"], &header["time"])
        else {
            return Tokenized::Malformed {
                subsystem: subsystem.to_string(),
                detail: format!(
                    "invalid timestamp {} {} {}",
                    &header["month"], &header["day"], &header["time"]
                ),
            };
        };

        let mut record = StructuredRecord::new(subsystem, qid, &header["host"], timestamp);
        record.fields = parse_body(&message["body"]);
        Tokenized::Record(record)
    }
}

/// Splits `key=value, key=value` bodies. A body without a leading key, such
/// as `removed`, becomes the `msg` field. `status` swallows the rest of the
/// line since its text is free-form.
fn parse_body(body: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let body = body.trim();
    if !leading_key_pattern().is_match(body) {
        fields.insert("msg".to_string(), body.to_string());
        return fields;
    }

    let mut rest = body;
    while let Some((key, after)) = rest.split_once('=') {
        if key == "status" {
            fields.insert(key.to_string(), after.trim().to_string());
            break;
        }
        let end = next_key_pattern()
            .find(after)
            .map_or(after.len(), |next| next.start());
        let (value, tail) = after.split_at(end);
        fields.insert(key.to_string(), clean_value(value));
        rest = tail.trim_start_matches([',', ' ', '\t']);
    }
    fields
}

/// Drops a trailing comment such as `(queue active)` and the angle brackets
/// around addresses and message ids.
fn clean_value(value: &str) -> String {
    let mut value = value.trim();
    if value.ends_with(')') {
        if let Some(open) = value.find(" (") {
            value = value[..open].trim_end();
        }
    }
    value
        .strip_prefix('<')
        .and_then(|inner| inner.strip_suffix('>'))
        .unwrap_or(value)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> SyslogTokenizer {
        SyslogTokenizer::with_year(chrono_tz::America::Phoenix, 2015)
    }

    fn record(line: &str) -> StructuredRecord {
        match tokenizer().tokenize(line) {
            Tokenized::Record(record) => record,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_qmgr_enqueue() {
        let record = record(
            "Jul 26 04:18:34 mx12 postfix/qmgr[28761]: 3mfHGL1r9gzyQP: from=<system>, size=813, nrcpt=1 (queue active)",
        );
        assert_eq!(record.subsystem, Subsystem::QueueManager);
        assert_eq!(record.message_id, "3mfHGL1r9gzyQP");
        assert_eq!(record.host, "mx12");
        assert_eq!(record.timestamp.to_rfc3339(), "2015-07-26T04:18:34-07:00");
        assert_eq!(record.field("from"), Some("system"));
        assert_eq!(record.field("size"), Some("813"));
        assert_eq!(record.field("nrcpt"), Some("1"));
        assert_eq!(record.fields.len(), 3);
    }

    #[test]
    fn test_smtp_delivery() {
        let record = record(
            "Jul 26 04:18:34 mx12 postfix/smtp[20662]: 3mfHGL1r9gzyQP: to=<system>, relay=127.0.0.2[127.0.0.2]:25, delay=0.53, delays=0.13/0/0.23/0.16, dsn=2.0.0, status=sent (250 Queued! (#2.0.0))",
        );
        assert_eq!(record.subsystem, Subsystem::Smtp);
        assert_eq!(record.field("to"), Some("system"));
        assert_eq!(record.field("relay"), Some("127.0.0.2[127.0.0.2]:25"));
        assert_eq!(record.field("delay"), Some("0.53"));
        assert_eq!(record.field("delays"), Some("0.13/0/0.23/0.16"));
        assert_eq!(record.field("dsn"), Some("2.0.0"));
        assert_eq!(record.field("status"), Some("sent (250 Queued! (#2.0.0))"));
    }

    #[test]
    fn test_removed_becomes_msg() {
        let record =
            record("Jul 26 04:18:34 mx12 postfix/qmgr[28761]: 3mfHGL1r9gzyQP: removed");
        assert_eq!(record.field("msg"), Some("removed"));
    }

    #[test]
    fn test_expired_status_keeps_commas() {
        let record = record(
            "Jul 30 04:18:34 mx12 postfix/qmgr[28761]: 3mfHGL1r9gzyQP: from=<a@example.com>, status=expired, returned to sender",
        );
        assert_eq!(record.field("from"), Some("a@example.com"));
        assert_eq!(record.field("status"), Some("expired, returned to sender"));
    }

    #[test]
    fn test_space_separated_pickup() {
        let record =
            record("Jul  6 09:01:02 mx12 postfix/pickup[1234]: 3mfHGL1r9gzyQP: uid=1206 from=<system>");
        assert_eq!(record.subsystem, Subsystem::Pickup);
        assert_eq!(record.field("uid"), Some("1206"));
        assert_eq!(record.field("from"), Some("system"));
        assert_eq!(record.timestamp.to_rfc3339(), "2015-07-06T09:01:02-07:00");
    }

    #[test]
    fn test_cleanup_message_id() {
        let record = record(
            "Jul 26 04:18:34 mx12 postfix/cleanup[1234]: 3mfHGL1r9gzyQP: message-id=<20150726111834.3mfHGL1r9gzyQP@mx12.example.com>",
        );
        assert_eq!(
            record.field("message-id"),
            Some("20150726111834.3mfHGL1r9gzyQP@mx12.example.com")
        );
    }

    #[test]
    fn test_null_sender() {
        let record = record(
            "Jul 26 04:18:34 mx12 postfix/qmgr[28761]: 3mfHGL1r9gzyQP: from=<>, size=2000, nrcpt=1 (queue active)",
        );
        assert_eq!(record.field("from"), Some(""));
    }

    #[test]
    fn test_not_applicable_lines() {
        for line in [
            "Jul 26 04:18:34 mx12 spamd[16960]: spamd: result: . 0 - ",
            "Jul 26 04:18:34 mx12 postfix/smtpd[1234]: connect from unknown[10.0.0.1]",
            "Jul 26 04:18:34 mx12 postfix/smtpd[1234]: NOQUEUE: reject: RCPT from unknown[10.0.0.1]: 554 5.7.1",
            "Jul 26 04:18:34 mx12 postfix/scache[1234]: statistics: max simultaneous domains=1 addresses=1 connection=1",
            "",
        ] {
            assert_eq!(tokenizer().tokenize(line), Tokenized::NotApplicable, "{line}");
        }
    }

    #[test]
    fn test_malformed_postfix_header() {
        assert!(matches!(
            tokenizer().tokenize("garbage postfix/qmgr: 3mfHGL1r9gzyQP: removed"),
            Tokenized::Malformed { .. }
        ));
        assert!(matches!(
            tokenizer().tokenize("Feb 30 04:18:34 mx12 postfix/qmgr[1]: 3mfHGL1r9gzyQP: removed"),
            Tokenized::Malformed { .. }
        ));
    }

    #[test]
    fn test_year_is_inferred() {
        let tokenizer = SyslogTokenizer::new(chrono_tz::UTC);
        let now = Utc::now();
        let line = format!(
            "{} mx12 postfix/qmgr[1]: 3mfHGL1r9gzyQP: removed",
            now.format("%b %e %H:%M:%S")
        );
        match tokenizer.tokenize(&line) {
            Tokenized::Record(record) => assert_eq!(record.timestamp.year(), now.year()),
            other => panic!("expected a record, got {other:?}"),
        }
    }
}
