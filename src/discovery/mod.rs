//! Discovery Index: which projects and sessions exist, and where their logs live.
//!
//! A full scan builds an immutable [`Catalog`]; publishing it is a single pointer swap,
//! so readers always see either the previous or the next catalog, never a partial one.
//! A background task refreshes the catalog on an interval. Until the first scan has
//! been published, lookups fall back to scanning the filesystem directly.

mod scanner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::utils::Mtime;

use scanner::{scan_catalog, scan_project};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub slug: Option<String>,
    /// Project directory name (the path hash)
    pub project_id: String,
    pub directory: Option<String>,
    pub path: PathBuf,
    pub mtime: Mtime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEntry {
    pub project_id: String,
    pub project_path: String,
    pub sessions: BTreeMap<String, SessionEntry>,
    pub scanned_at: DateTime<Utc>,
}

impl ProjectEntry {
    /// Sessions, most recently modified first.
    pub fn sorted_sessions(&self) -> Vec<SessionEntry> {
        let mut sessions: Vec<SessionEntry> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.mtime
                .cmp(&a.mtime)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub projects: BTreeMap<String, ProjectEntry>,
    pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentLog {
    pub agent_id: String,
    /// Session that launched the agent, when the layout or the log records it
    pub session_id: Option<String>,
    pub subagent_type: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    pub project_id: String,
    pub project_path: String,
    pub session_count: usize,
}

pub struct DiscoveryIndex {
    projects_dir: PathBuf,
    snapshot: RwLock<Option<Arc<Catalog>>>,
}

impl DiscoveryIndex {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            snapshot: RwLock::new(None),
        }
    }

    /// Scan now and publish the result.
    pub fn refresh_once(&self) -> Result<Arc<Catalog>> {
        let started = std::time::Instant::now();
        let catalog = Arc::new(scan_catalog(&self.projects_dir)?);
        *self.snapshot.write() = Some(Arc::clone(&catalog));
        tracing::debug!(
            projects = catalog.projects.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "discovery scan published"
        );
        Ok(catalog)
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot.read().is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<Catalog>> {
        self.snapshot.read().clone()
    }

    /// The published catalog, or a fresh unpublished scan before the first refresh.
    fn catalog(&self) -> Arc<Catalog> {
        if let Some(catalog) = self.snapshot() {
            return catalog;
        }
        match scan_catalog(&self.projects_dir) {
            Ok(catalog) => Arc::new(catalog),
            Err(err) => {
                tracing::warn!("direct project scan failed: {err:#}");
                Arc::new(Catalog {
                    projects: BTreeMap::new(),
                    scanned_at: Utc::now(),
                })
            }
        }
    }

    pub fn list_projects(&self) -> Vec<ProjectInfo> {
        self.catalog()
            .projects
            .values()
            .map(|project| ProjectInfo {
                project_id: project.project_id.clone(),
                project_path: project.project_path.clone(),
                session_count: project.sessions.len(),
            })
            .collect()
    }

    pub fn project(&self, project_id: &str) -> Option<ProjectEntry> {
        if let Some(catalog) = self.snapshot() {
            return catalog.projects.get(project_id).cloned();
        }

        let project_dir = self.project_dir(project_id)?;
        match scan_project(&project_dir, project_id) {
            Ok(project) => Some(project),
            Err(err) => {
                tracing::warn!(project = %project_id, "direct session scan failed: {err:#}");
                None
            }
        }
    }

    /// Sessions of a project, most recently modified first. `None` for unknown projects.
    pub fn list_sessions(&self, project_id: &str) -> Option<Vec<SessionEntry>> {
        self.project(project_id)
            .map(|project| project.sorted_sessions())
    }

    pub fn find_session(&self, project_id: &str, session_id: &str) -> Option<SessionEntry> {
        self.project(project_id)?.sessions.remove(session_id)
    }

    /// Log path for a session, whether or not the index has seen it yet.
    pub fn session_path(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.snapshot()
            .and_then(|catalog| {
                catalog
                    .projects
                    .get(project_id)?
                    .sessions
                    .get(session_id)
                    .map(|session| session.path.clone())
            })
            .unwrap_or_else(|| {
                self.projects_dir
                    .join(project_id)
                    .join(format!("{session_id}.jsonl"))
            })
    }

    pub fn subagent_files_for_session(&self, project_id: &str, session_id: &str) -> Vec<PathBuf> {
        match self.project_dir(project_id) {
            Some(dir) => scanner::subagent_files(&dir, session_id),
            None => Vec::new(),
        }
    }

    pub fn subagent_path(&self, project_id: &str, session_id: &str, agent_id: &str) -> Option<PathBuf> {
        let dir = self.project_dir(project_id)?;
        scanner::subagent_file(&dir, session_id, agent_id)
    }

    /// A subagent log found by agent id alone, in any session of the project.
    pub fn find_subagent(&self, project_id: &str, agent_id: &str) -> Option<SubagentLog> {
        if agent_id.is_empty() || agent_id.contains(['/', '\\']) || agent_id == ".." {
            return None;
        }
        let dir = self.project_dir(project_id)?;
        let (session_id, path) = scanner::find_agent_file(&dir, agent_id)?;
        Some(SubagentLog {
            agent_id: agent_id.to_string(),
            session_id,
            subagent_type: scanner::first_subagent_type(&path),
            path,
        })
    }

    fn project_dir(&self, project_id: &str) -> Option<PathBuf> {
        // Project ids are single directory names.
        if project_id.is_empty() || project_id.contains(['/', '\\']) || project_id == ".." {
            return None;
        }
        let dir = self.projects_dir.join(project_id);
        dir.is_dir().then_some(dir)
    }

    /// Publish an initial scan, then keep refreshing every `interval` until stopped.
    pub async fn start_background_scanner(self: &Arc<Self>, interval: Duration) -> ScannerHandle {
        self.refresh_in_background().await;

        let cancel = CancellationToken::new();
        let index = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                index.refresh_in_background().await;
            }
            tracing::debug!("discovery scanner loop exited");
        });

        tracing::info!(interval_secs = interval.as_secs(), "background index scanner started");
        ScannerHandle { cancel, join }
    }

    /// Run one refresh on the blocking pool. Failures are logged, never propagated.
    async fn refresh_in_background(self: &Arc<Self>) {
        let index = Arc::clone(self);
        match tokio::task::spawn_blocking(move || index.refresh_once()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::warn!("background index scan failed: {err:#}"),
            Err(err) => tracing::error!("background index scan panicked: {err}"),
        }
    }
}

/// Owner handle for the background scanner task.
pub struct ScannerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ScannerHandle {
    /// Cancel the loop and wait for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            tracing::warn!("background index scanner ended abnormally: {err}");
        }
        tracing::info!("background index scanner stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

#[cfg(test)]
mod tests;
