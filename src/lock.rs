//! Process-wide per-resource mutual exclusion
//!
//! Locks never queue. A second `try_acquire` on a held key fails at once
//! with `ResourceBusy`, so an operator whose edit raced another one finds
//! out immediately instead of overwriting it later.

use crate::error::{KeelError, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Lock granularity unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// Full engine container ID
    Container(String),
    /// Compose project name
    Stack(String),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Container(id) => write!(f, "container:{}", id),
            ResourceKey::Stack(project) => write!(f, "stack:{}", project),
        }
    }
}

/// Lock manager, cheap to clone and shared by every reconciler
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    held: Arc<Mutex<HashSet<ResourceKey>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` or fail with `ResourceBusy`
    pub fn try_acquire(&self, key: ResourceKey) -> Result<LockGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| KeelError::Internal("lock table poisoned".to_string()))?;

        if !held.insert(key.clone()) {
            debug!(key = %key, "resource busy");
            return Err(KeelError::ResourceBusy(key.to_string()));
        }

        debug!(key = %key, "lock acquired");
        Ok(LockGuard {
            key,
            held: Arc::clone(&self.held),
        })
    }

    /// Take every key in lexical order, all or nothing
    pub fn try_acquire_all(
        &self,
        keys: impl IntoIterator<Item = ResourceKey>,
    ) -> Result<Vec<LockGuard>> {
        let mut keys: Vec<ResourceKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            // Guards taken so far are released on drop if this fails
            guards.push(self.try_acquire(key)?);
        }
        Ok(guards)
    }

    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

/// Proof of holding a key. Dropping it releases the key.
#[derive(Debug)]
pub struct LockGuard {
    key: ResourceKey,
    held: Arc<Mutex<HashSet<ResourceKey>>>,
}

impl LockGuard {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Release explicitly
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        debug!(key = %self.key, "lock released");
    }
}
