//! Durable Aggregate Cache: per-session aggregates persisted across restarts.
//!
//! Only completed sessions are trusted, and only while their log's mtime still
//! matches the one recorded with the aggregate. Everything else is recomputed.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{ProjectTotals, SessionAggregate, SessionStatus};
use crate::utils::Mtime;

const CACHE_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectAggregates {
    pub project_hash: String,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionAggregate>,
    /// Mtime of the most recently stored session aggregate
    #[serde(default)]
    pub last_updated: Mtime,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    projects: BTreeMap<String, ProjectAggregates>,
}

#[derive(Debug, Deserialize)]
struct CacheHeader {
    #[serde(default)]
    version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateCacheStats {
    pub projects: usize,
    pub sessions: usize,
    pub completed_sessions: usize,
    pub dirty: bool,
}

pub struct AggregateCache {
    /// `None` for the in-memory fallback, which never persists
    path: Option<PathBuf>,
    projects: BTreeMap<String, ProjectAggregates>,
    dirty: bool,
}

impl AggregateCache {
    /// Cache that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            projects: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load from `path`. A missing, unreadable, corrupt or outdated file yields an
    /// empty cache that will be written back to `path` on the next save.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let projects = match fs::read(&path) {
            Ok(bytes) => Self::parse(&path, bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no durable cache yet");
                BTreeMap::new()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "failed to read durable cache: {err}");
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            projects,
            dirty: false,
        }
    }

    fn parse(path: &Path, bytes: Vec<u8>) -> BTreeMap<String, ProjectAggregates> {
        let mut header_bytes = bytes.clone();
        match simd_json::from_slice::<CacheHeader>(&mut header_bytes) {
            Ok(header) if header.version != CACHE_VERSION => {
                tracing::info!(
                    "Durable cache version {} -> {}: starting fresh",
                    header.version,
                    CACHE_VERSION
                );
                return BTreeMap::new();
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), "durable cache is corrupt, ignoring: {err}");
                return BTreeMap::new();
            }
        }

        let mut bytes = bytes;
        match simd_json::from_slice::<CacheFile>(&mut bytes) {
            Ok(file) => file.projects,
            Err(err) => {
                tracing::warn!(path = %path.display(), "durable cache is corrupt, ignoring: {err}");
                BTreeMap::new()
            }
        }
    }

    /// Trusted aggregate for a session, if it is completed and its log is unchanged.
    pub fn get(&self, project_id: &str, session_id: &str, mtime: Mtime) -> Option<&SessionAggregate> {
        self.projects
            .get(project_id)?
            .sessions
            .get(session_id)
            .filter(|agg| agg.status == SessionStatus::Completed && agg.mtime == mtime)
    }

    pub fn put(&mut self, project_id: &str, aggregate: SessionAggregate) {
        let project = self
            .projects
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectAggregates {
                project_hash: project_id.to_string(),
                ..Default::default()
            });
        project.last_updated = aggregate.mtime;
        project
            .sessions
            .insert(aggregate.session_id.clone(), aggregate);
        self.dirty = true;
    }

    /// Totals over the completed sessions of a project, with the ids they cover.
    ///
    /// `current` maps the sessions whose logs exist right now to their mtimes. An
    /// aggregate only counts while its log is listed there at the recorded mtime.
    pub fn get_project_totals(&self, project_id: &str, current: &HashMap<&str, Mtime>) -> ProjectTotals {
        let mut result = ProjectTotals::default();
        let Some(project) = self.projects.get(project_id) else {
            return result;
        };

        for aggregate in project.sessions.values().filter(|agg| {
            agg.status == SessionStatus::Completed
                && current.get(agg.session_id.as_str()) == Some(&agg.mtime)
        }) {
            result.totals.add(aggregate);
            result.covered.insert(aggregate.session_id.clone());
        }
        result
    }

    pub fn invalidate_session(&mut self, project_id: &str, session_id: &str) -> bool {
        let removed = self
            .projects
            .get_mut(project_id)
            .is_some_and(|project| project.sessions.remove(session_id).is_some());
        self.dirty |= removed;
        removed
    }

    pub fn invalidate_project(&mut self, project_id: &str) -> bool {
        let removed = self.projects.remove(project_id).is_some();
        self.dirty |= removed;
        removed
    }

    pub fn clear(&mut self) {
        if !self.projects.is_empty() {
            self.projects.clear();
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn stats(&self) -> AggregateCacheStats {
        let sessions = self.projects.values().flat_map(|p| p.sessions.values());
        AggregateCacheStats {
            projects: self.projects.len(),
            sessions: sessions.clone().count(),
            completed_sessions: sessions
                .filter(|agg| agg.status == SessionStatus::Completed)
                .count(),
            dirty: self.dirty,
        }
    }

    /// Persist when there are unsaved changes. Returns whether a write happened.
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let Some(path) = &self.path else {
            return Ok(false);
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = CacheFile {
            version: CACHE_VERSION,
            projects: self.projects.clone(),
        };
        let json = simd_json::to_string_pretty(&file).context("Failed to serialize durable cache")?;

        // Atomic write via temp file + rename
        let temp_path = path.with_extension("tmp");
        let mut out = File::create(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        out.write_all(json.as_bytes())?;
        out.sync_all()?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        self.dirty = false;
        tracing::debug!(path = %path.display(), projects = self.projects.len(), "durable cache saved");
        Ok(true)
    }
}
