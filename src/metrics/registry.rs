//! Metric key to definition-id registry.
//!
//! Ids are assigned by the store inside the flush transaction that first
//! writes a key, then cached for the life of the process. Lookups are
//! lock-free reads on a sharded map.

use crate::core::Result;
use crate::metrics::types::{MetricId, MetricKind};
use crate::storage::MetricStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A definition as persisted, with its stable id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredMetric {
    pub id: MetricId,
    pub key: String,
    pub kind: MetricKind,
    pub unit: Option<String>,
}

/// Read-mostly cache of registered metrics
#[derive(Debug, Default)]
pub struct MetricRegistry {
    by_key: DashMap<String, RegisteredMetric>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a definition the store has just committed. A key already
    /// cached keeps its entry; the store resolves both to the same row.
    pub fn remember(&self, registered: RegisteredMetric) {
        self.by_key.entry(registered.key.clone()).or_insert(registered);
    }

    /// Find a key that may have been registered by another process run.
    /// Unknown keys are `None`, not an error.
    pub fn lookup(&self, store: &MetricStore, key: &str) -> Result<Option<RegisteredMetric>> {
        if let Some(found) = self.by_key.get(key) {
            return Ok(Some(found.clone()));
        }

        match store.find_definition(key)? {
            Some(registered) => {
                self.by_key.insert(key.to_string(), registered.clone());
                Ok(Some(registered))
            },
            None => Ok(None),
        }
    }

    /// Number of cached definitions
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
