// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Records accepted into the pending queue before a batch cycle is forced
pub const DEFAULT_BATCH_LIMIT: usize = 1024;
/// Consecutive failed cycles tolerated before the pipeline gives up
pub const DEFAULT_RETRY_CEILING: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READER_POLL: Duration = Duration::from_millis(1000);

pub const DEFAULT_STORE_HOST: &str = "http://127.0.0.1:9200";
pub const DEFAULT_INDEX_PATTERN: &str = "postfix-%Y-%m-%d";
pub const DEFAULT_PARTITION_LOOKBACK_DAYS: u32 = 1;
pub const DEFAULT_TIMEZONE: &str = "America/Phoenix";
pub const DEFAULT_READER_FILE: &str = "/var/log/maillog";
pub const DEFAULT_SPOOL_DIR: &str = "/var/spool/log-ship";

/// Largest batch whose fetch stays inside the store's default result window
/// (10 000 hits, three per queue id)
pub const MAX_BATCH_LIMIT: usize = 3333;

/// Looked up in `-c <dir>`, then `/etc`, then the working directory
pub const CONFIG_FILE_NAME: &str = "log-ship-elastic-postfix.yaml";
/// Index template installed at startup for the partition pattern
pub const INDEX_TEMPLATE_NAME: &str = "log-ship-postfix";

/// Sub-directory of the spool dir holding reader bookmarks
pub const BOOKMARK_DIR: &str = ".bookmark";

/// Log-line metadata that lives on the document, never inside event fields
pub const RESERVED_FIELDS: [&str; 3] = ["qid", "host", "prog"];
