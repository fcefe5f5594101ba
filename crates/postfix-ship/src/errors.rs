// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::store::StoreError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Config file {path} is unreadable: {message}")]
    File { path: PathBuf, message: String },

    #[error("Spool directory {path} is unusable: {source}")]
    Spool {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist bookmark {path}: {source}")]
    Bookmark {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt bookmark {path}: {source}")]
    CorruptBookmark {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("no batch activity within {0:?}")]
    IdleTimeout(Duration),

    #[error("giving up after {attempts} failed batch attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}
