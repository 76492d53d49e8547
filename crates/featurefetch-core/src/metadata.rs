//! Metadata source trait
//!
//! The metadata source is where GroupBy and Join definitions live (a
//! catalog, a registry service, a directory of compiled configs). The
//! fetcher only needs point lookups by name; caching and refresh happen one
//! layer up, in the plan cache.

use crate::plan::Definition;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Point lookup of definitions by name
///
/// Implementations must be thread-safe: the plan cache calls them from
/// background refresh tasks as well as from request paths.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Returns the definition for `name`, or `None` if it is not defined
    async fn fetch_definition(&self, name: &str) -> Result<Option<Definition>>;
}

/// In-process metadata source
///
/// Useful for embedding definitions directly and as the deterministic source
/// substituted in tests.
#[derive(Debug, Default)]
pub struct InMemoryMetadataSource {
    definitions: RwLock<HashMap<String, Definition>>,
}

impl InMemoryMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(definitions: impl IntoIterator<Item = Definition>) -> Self {
        let source = Self::new();
        for def in definitions {
            source.put(def);
        }
        source
    }

    /// Insert or replace a definition
    pub fn put(&self, definition: Definition) {
        let mut guard = self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(definition.name().to_string(), definition);
    }

    pub fn remove(&self, name: &str) -> Option<Definition> {
        let mut guard = self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(name)
    }

    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataSource for InMemoryMetadataSource {
    async fn fetch_definition(&self, name: &str) -> Result<Option<Definition>> {
        let guard = self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(name).cloned())
    }
}
