//! Derived Result Caches: bounded in-memory caches of computed per-log results.
//!
//! Entries are keyed by (path, mtime) with the mtime sampled on every lookup, so a log
//! that grew is simply a different key and the stale entry ages out. Eviction is by
//! insertion order: once an insert pushes the cache over capacity, the oldest quarter
//! is dropped in one pass.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{FilterOptions, SessionMetrics, SubagentList, ToolUsage};
use crate::utils::Mtime;

pub const DEFAULT_CAPACITY: usize = 200;

type Key = (PathBuf, Mtime);

struct Inner<T> {
    entries: HashMap<Key, T>,
    order: VecDeque<Key>,
}

pub struct ResultCache<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, path: &Path) -> Option<T> {
        self.get_at(path, Mtime::of(path))
    }

    /// Look up with an mtime the caller already sampled.
    pub fn get_at(&self, path: &Path, mtime: Mtime) -> Option<T> {
        let inner = self.inner.lock();
        let hit = inner.entries.get(&(path.to_path_buf(), mtime)).cloned();
        tracing::trace!(cache = self.name, path = %path.display(), hit = hit.is_some());
        hit
    }

    pub fn put_at(&self, path: &Path, mtime: Mtime, value: T) {
        let key = (path.to_path_buf(), mtime);
        let mut inner = self.inner.lock();

        // Replacing keeps the original insertion position.
        if inner.entries.insert(key.clone(), value).is_none() {
            inner.order.push_back(key);
        }

        if inner.entries.len() > self.capacity {
            let evict = (self.capacity / 4).max(1);
            for _ in 0..evict {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.entries.remove(&oldest);
            }
            tracing::debug!(cache = self.name, evicted = evict, "derived cache trimmed");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DerivedCacheStats {
    pub tool_usage: usize,
    pub metrics: usize,
    pub filter_options: usize,
    pub subagents: usize,
}

/// The four per-session result caches, each with its own bound.
pub struct DerivedCaches {
    pub tool_usage: ResultCache<ToolUsage>,
    pub metrics: ResultCache<SessionMetrics>,
    pub filter_options: ResultCache<FilterOptions>,
    pub subagents: ResultCache<SubagentList>,
}

impl DerivedCaches {
    pub fn new(capacity: usize) -> Self {
        Self {
            tool_usage: ResultCache::new("tool_usage", capacity),
            metrics: ResultCache::new("metrics", capacity),
            filter_options: ResultCache::new("filter_options", capacity),
            subagents: ResultCache::new("subagents", capacity),
        }
    }

    pub fn clear_all(&self) {
        self.tool_usage.clear();
        self.metrics.clear();
        self.filter_options.clear();
        self.subagents.clear();
    }

    pub fn stats(&self) -> DerivedCacheStats {
        DerivedCacheStats {
            tool_usage: self.tool_usage.len(),
            metrics: self.metrics.len(),
            filter_options: self.filter_options.len(),
            subagents: self.subagents.len(),
        }
    }
}

impl Default for DerivedCaches {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
