// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::BOOKMARK_DIR;
use crate::errors::ConfigError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Creates the spool directory if needed and checks that it is writable.
///
/// Returns the bookmark directory inside it.
pub fn ensure_spool_dir(spool: &Path) -> Result<PathBuf, ConfigError> {
    let fail = |source: io::Error| ConfigError::Spool {
        path: spool.to_path_buf(),
        source,
    };

    fs::create_dir_all(spool).map_err(fail)?;
    if !fs::metadata(spool).map_err(fail)?.is_dir() {
        return Err(fail(io::Error::new(
            io::ErrorKind::Other,
            "not a directory",
        )));
    }

    let scratch = spool.join(format!(".write-check-{}", std::process::id()));
    fs::write(&scratch, b"").map_err(fail)?;
    fs::remove_file(&scratch).map_err(fail)?;

    let bookmarks = spool.join(BOOKMARK_DIR);
    fs::create_dir_all(&bookmarks).map_err(fail)?;
    debug!("Spool directory {} is ready", spool.display());
    Ok(bookmarks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_missing_spool() {
        let dir = TempDir::new().unwrap();
        let spool = dir.path().join("var/spool/log-ship");

        let bookmarks = ensure_spool_dir(&spool).unwrap();
        assert!(spool.is_dir());
        assert_eq!(bookmarks, spool.join(".bookmark"));
        assert!(bookmarks.is_dir());
        // write check file is cleaned up
        assert_eq!(fs::read_dir(&spool).unwrap().count(), 1);
    }

    #[test]
    fn test_rejects_regular_file() {
        let dir = TempDir::new().unwrap();
        let spool = dir.path().join("spool");
        fs::write(&spool, b"not a dir").unwrap();

        let err = ensure_spool_dir(&spool).unwrap_err();
        assert!(matches!(err, ConfigError::Spool { .. }));
    }
}
