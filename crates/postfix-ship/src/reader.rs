// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line source for the pipeline.
//!
//! Consumption is only confirmed through [`LineReader::resume`], which the
//! pipeline calls after the batch holding the emitted lines was persisted.
//! Anything read but not confirmed is read again after a restart.

use crate::errors::ReaderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Line(String),
    /// Enough lines are unconfirmed, or no more input is available for now
    Batch,
    /// No more input will ever arrive
    Closed,
}

#[async_trait]
pub trait LineReader: Send {
    async fn next_event(&mut self) -> Result<ReaderEvent, ReaderError>;

    /// Confirms every line emitted so far.
    async fn resume(&mut self) -> Result<(), ReaderError>;
}

#[derive(Debug, Clone)]
pub struct FileReaderConfig {
    pub path: PathBuf,
    pub bookmark_dir: PathBuf,
    pub batch_limit: usize,
    /// Keep waiting for new lines at end of file
    pub follow: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct Bookmark {
    file: PathBuf,
    offset: u64,
}

/// Tails one log file, remembering the confirmed byte offset in a bookmark
/// file so a restart continues where the last committed batch ended.
pub struct FileReader {
    config: FileReaderConfig,
    bookmark_path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Bytes emitted, including unconfirmed lines
    offset: u64,
    confirmed: u64,
    unconfirmed: usize,
}

impl FileReader {
    pub async fn open(config: FileReaderConfig) -> Result<Self, ReaderError> {
        let name = config
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let bookmark_path = config.bookmark_dir.join(name);
        let confirmed = read_bookmark(&bookmark_path).await?;
        if confirmed > 0 {
            info!(
                "READER | Resuming {} at byte {}",
                config.path.display(),
                confirmed
            );
        }
        Ok(FileReader {
            config,
            bookmark_path,
            reader: None,
            offset: confirmed,
            confirmed,
            unconfirmed: 0,
        })
    }

    pub fn confirmed_offset(&self) -> u64 {
        self.confirmed
    }

    fn io_error(&self, source: std::io::Error) -> ReaderError {
        ReaderError::Io {
            path: self.config.path.clone(),
            source,
        }
    }

    /// Opens the file at the current offset. Returns `false` when the file
    /// does not exist yet.
    async fn reopen(&mut self) -> Result<bool, ReaderError> {
        let mut file = match File::open(&self.config.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| self.io_error(e))?
            .len();
        if len < self.offset {
            warn!(
                "READER | {} shrank below byte {}, reading from the start",
                self.config.path.display(),
                self.offset
            );
            self.offset = 0;
            self.confirmed = 0;
        }
        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| self.io_error(e))?;
        self.reader = Some(BufReader::new(file));
        Ok(true)
    }

    /// Reads one complete line. A trailing line without its newline is left
    /// for a later read.
    async fn read_line(&mut self) -> Result<Option<String>, ReaderError> {
        if self.reader.is_none() && !self.reopen().await? {
            return Ok(None);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let mut buf = Vec::new();
        let read = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| ReaderError::Io {
                path: self.config.path.clone(),
                source: e,
            })?;
        if read == 0 || buf.last() != Some(&b'\n') {
            self.reader = None;
            return Ok(None);
        }

        self.offset += read as u64;
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

async fn read_bookmark(path: &Path) -> Result<u64, ReaderError> {
    match fs::read(path).await {
        Ok(bytes) => {
            let bookmark: Bookmark =
                serde_json::from_slice(&bytes).map_err(|source| ReaderError::CorruptBookmark {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(bookmark.offset)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(ReaderError::Bookmark {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl LineReader for FileReader {
    async fn next_event(&mut self) -> Result<ReaderEvent, ReaderError> {
        if self.unconfirmed >= self.config.batch_limit {
            return Ok(ReaderEvent::Batch);
        }
        loop {
            if let Some(line) = self.read_line().await? {
                self.unconfirmed += 1;
                return Ok(ReaderEvent::Line(line));
            }
            if self.unconfirmed > 0 {
                return Ok(ReaderEvent::Batch);
            }
            if !self.config.follow {
                return Ok(ReaderEvent::Closed);
            }
            sleep(self.config.poll_interval).await;
        }
    }

    async fn resume(&mut self) -> Result<(), ReaderError> {
        self.unconfirmed = 0;
        if self.offset == self.confirmed {
            return Ok(());
        }

        let bookmark = Bookmark {
            file: self.config.path.clone(),
            offset: self.offset,
        };
        let fail = |source: std::io::Error| ReaderError::Bookmark {
            path: self.bookmark_path.clone(),
            source,
        };
        let bytes = serde_json::to_vec(&bookmark).map_err(|e| fail(e.into()))?;
        fs::create_dir_all(&self.config.bookmark_dir)
            .await
            .map_err(fail)?;
        let staging = self.bookmark_path.with_extension("tmp");
        fs::write(&staging, bytes).await.map_err(fail)?;
        fs::rename(&staging, &self.bookmark_path)
            .await
            .map_err(fail)?;

        debug!("READER | Bookmarked byte {}", self.offset);
        self.confirmed = self.offset;
        Ok(())
    }
}
