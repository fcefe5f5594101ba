// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use hashbrown::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("linkage cache unavailable: {0}")]
    Unavailable(String),
}

/// Side lookup of the parent key (store routing) for a queue id.
///
/// Optional: without one, documents are written without parent linkage
/// unless the store already knows it.
#[async_trait]
pub trait LinkageCache: Send + Sync {
    /// Returns the parent keys found for `keys`; unknown keys are absent.
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, String>, CacheError>;
}
