//! The engine owns the discovery index and every cache tier, and is the only API the
//! CLI talks to.
//!
//! Every request resolves a session log through the index, then answers from the
//! cheapest tier that is still valid: durable aggregates for completed sessions,
//! derived results keyed by mtime, and finally a view from the query source cache.
//! Filesystem work runs on tokio's blocking pool; fan-out over sessions and subagents
//! uses rayon inside that pool.

pub mod reports;
mod subagents;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;

use crate::aggregate_cache::{AggregateCache, AggregateCacheStats};
use crate::config::Config;
use crate::derived_cache::{DerivedCacheStats, DerivedCaches, ResultCache};
use crate::discovery::{DiscoveryIndex, ScannerHandle};
use crate::error::{EngineError, EngineResult};
use crate::pagination::{self, Cursor, PageRequest};
use crate::query::ops::{self, TaskCall};
use crate::query::{JsonlEngine, LogQueryEngine};
use crate::source_cache::{QuerySource, QuerySourceCache};
use crate::status::status_of;
use crate::types::{
    AggregateTotals, AllProjectsMetrics, CodeChanges, CommandsReport, DailyMetricsReport,
    ErrorReport, FilterOptions, MessagePage, ProjectMetrics, ProjectSummary, SessionAggregate,
    SessionMetrics, SessionSummary, SkillsReport, SubagentDetail, SubagentInfo, SubagentList,
    ToolUsage,
};
use crate::utils::Mtime;

pub use reports::DailyRange;
pub use subagents::SubagentTotals;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub index_initialized: bool,
    pub query_sources: usize,
    pub derived: DerivedCacheStats,
    pub durable: AggregateCacheStats,
}

struct Inner {
    config: Config,
    index: Arc<DiscoveryIndex>,
    sources: Arc<QuerySourceCache>,
    derived: Arc<DerivedCaches>,
    durable: Arc<Mutex<AggregateCache>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
    scanner: Arc<tokio::sync::Mutex<Option<ScannerHandle>>>,
}

impl Engine {
    pub fn new(
        config: Config,
        index: Arc<DiscoveryIndex>,
        sources: Arc<QuerySourceCache>,
        derived: Arc<DerivedCaches>,
        durable: Arc<Mutex<AggregateCache>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                index,
                sources,
                derived,
                durable,
            }),
            scanner: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Wire up every tier from configuration, loading the durable cache from disk.
    pub fn from_config(config: Config) -> Result<Self> {
        let projects_dir = config.projects_dir()?;
        let cache_file = config.cache_file()?;
        let query_engine: Arc<dyn LogQueryEngine> =
            Arc::new(JsonlEngine::new(config.cache.max_source_bytes));

        tracing::debug!(
            projects_dir = %projects_dir.display(),
            cache_file = %cache_file.display(),
            "engine configured"
        );

        let index = Arc::new(DiscoveryIndex::new(projects_dir));
        let sources = Arc::new(QuerySourceCache::new(query_engine, config.source_ttl()));
        let derived = Arc::new(DerivedCaches::new(config.cache.derived_capacity));
        let durable = Arc::new(Mutex::new(AggregateCache::load(cache_file)));
        Ok(Self::new(config, index, sources, derived, durable))
    }

    pub fn index(&self) -> &Arc<DiscoveryIndex> {
        &self.inner.index
    }

    async fn blocking<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> EngineResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }

    // ========================================================================
    // Listings
    // ========================================================================

    /// Every project with its totals, most recently active first.
    pub async fn list_projects(&self) -> EngineResult<Vec<ProjectSummary>> {
        self.blocking(|inner| Ok(inner.list_projects())).await
    }

    /// Summaries of a project's sessions, most recently modified first.
    pub async fn list_sessions(&self, project_id: &str) -> EngineResult<Vec<SessionSummary>> {
        let project_id = project_id.to_string();
        self.blocking(move |inner| inner.list_sessions(&project_id))
            .await
    }

    pub async fn session_summary(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> EngineResult<SessionSummary> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| {
            let slug = inner
                .index
                .find_session(&project_id, &session_id)
                .and_then(|entry| entry.slug);
            inner.session_summary(&project_id, &session_id, slug)
        })
        .await
    }

    pub async fn list_messages(
        &self,
        project_id: &str,
        session_id: &str,
        request: PageRequest,
    ) -> EngineResult<MessagePage> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.list_messages(&project_id, &session_id, &request))
            .await
    }

    // ========================================================================
    // Derived per-session results
    // ========================================================================

    pub async fn get_tool_usage(&self, project_id: &str, session_id: &str) -> EngineResult<ToolUsage> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.tool_usage(&project_id, &session_id))
            .await
    }

    pub async fn get_metrics(&self, project_id: &str, session_id: &str) -> EngineResult<SessionMetrics> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.metrics(&project_id, &session_id))
            .await
    }

    pub async fn get_filter_options(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> EngineResult<FilterOptions> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.filter_options(&project_id, &session_id))
            .await
    }

    pub async fn get_subagents(&self, project_id: &str, session_id: &str) -> EngineResult<SubagentList> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.subagents(&project_id, &session_id))
            .await
    }

    pub async fn get_skills(&self, project_id: &str, session_id: &str) -> EngineResult<SkillsReport> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| {
            let path = inner.session_log(&project_id, &session_id)?;
            inner.query(&path, |source| ops::skills(source))
        })
        .await
    }

    pub async fn get_code_changes(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> EngineResult<CodeChanges> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| {
            let path = inner.session_log(&project_id, &session_id)?;
            inner.query(&path, |source| ops::code_changes(source))
        })
        .await
    }

    pub async fn get_errors(&self, project_id: &str, session_id: &str) -> EngineResult<ErrorReport> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| {
            let path = inner.session_log(&project_id, &session_id)?;
            inner.query(&path, |source| ops::errors(source))
        })
        .await
    }

    /// Typed prompts with what each one set off.
    pub async fn get_commands(&self, project_id: &str, session_id: &str) -> EngineResult<CommandsReport> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.commands(&project_id, &session_id))
            .await
    }

    // ========================================================================
    // Subagents by agent id
    // ========================================================================

    pub async fn subagent_detail(&self, project_id: &str, agent_id: &str) -> EngineResult<SubagentDetail> {
        let (project_id, agent_id) = (project_id.to_string(), agent_id.to_string());
        self.blocking(move |inner| inner.subagent_detail(&project_id, &agent_id))
            .await
    }

    pub async fn subagent_tools(&self, project_id: &str, agent_id: &str) -> EngineResult<ToolUsage> {
        let (project_id, agent_id) = (project_id.to_string(), agent_id.to_string());
        self.blocking(move |inner| inner.subagent_tools(&project_id, &agent_id))
            .await
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    pub async fn session_aggregate(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> EngineResult<SessionAggregate> {
        let (project_id, session_id) = (project_id.to_string(), session_id.to_string());
        self.blocking(move |inner| inner.session_aggregate(&project_id, &session_id))
            .await
    }

    pub async fn project_metrics(&self, project_id: &str) -> EngineResult<ProjectMetrics> {
        let project_id = project_id.to_string();
        self.blocking(move |inner| inner.project_metrics(&project_id))
            .await
    }

    /// Tool usage summed over every session of a project.
    pub async fn project_tool_usage(&self, project_id: &str) -> EngineResult<ToolUsage> {
        let project_id = project_id.to_string();
        self.blocking(move |inner| inner.project_tool_usage(&project_id))
            .await
    }

    /// Billed usage of a project's sessions per UTC day.
    pub async fn daily_metrics(
        &self,
        project_id: &str,
        range: DailyRange,
    ) -> EngineResult<DailyMetricsReport> {
        let project_id = project_id.to_string();
        self.blocking(move |inner| inner.daily_metrics(&project_id, &range))
            .await
    }

    /// Totals over every project. Projects that fail are left out.
    pub async fn all_projects_metrics(&self) -> EngineResult<AllProjectsMetrics> {
        self.blocking(|inner| Ok(inner.all_projects_metrics()))
            .await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the periodic index refresh. Returns false when it is already running.
    pub async fn start_background_scanner(&self) -> bool {
        let mut slot = self.scanner.lock().await;
        if slot.as_ref().is_some_and(|handle| handle.is_running()) {
            return false;
        }
        let interval = self.inner.config.scan_interval();
        *slot = Some(self.inner.index.start_background_scanner(interval).await);
        true
    }

    /// Stop the periodic index refresh and wait for it. Returns false when none was running.
    pub async fn stop_background_scanner(&self) -> bool {
        let handle = self.scanner.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Persist the durable cache if it changed. Returns whether a write happened.
    pub async fn save_durable_cache(&self) -> Result<bool> {
        let durable = Arc::clone(&self.inner.durable);
        tokio::task::spawn_blocking(move || durable.lock().save()).await?
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            index_initialized: self.inner.index.is_initialized(),
            query_sources: self.inner.sources.len(),
            derived: self.inner.derived.stats(),
            durable: self.inner.durable.lock().stats(),
        }
    }

    /// Drop every cached view and result, including the durable aggregates.
    pub fn clear_caches(&self) {
        self.inner.sources.clear();
        self.inner.derived.clear_all();
        self.inner.durable.lock().clear();
        tracing::info!("all caches cleared");
    }

    /// Forget what is cached for one session, or for a whole project when `session_id`
    /// is `None`. Returns whether a durable aggregate was dropped.
    pub fn invalidate(&self, project_id: &str, session_id: Option<&str>) -> bool {
        let inner = &self.inner;
        match session_id {
            Some(session_id) => {
                inner
                    .sources
                    .invalidate(&inner.index.session_path(project_id, session_id));
                inner.durable.lock().invalidate_session(project_id, session_id)
            }
            None => {
                for session in inner.index.list_sessions(project_id).unwrap_or_default() {
                    inner.sources.invalidate(&session.path);
                }
                inner.durable.lock().invalidate_project(project_id)
            }
        }
    }

    /// Drop query sources whose TTL has run out. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let swept = self.inner.sources.sweep_expired();
        if swept > 0 {
            tracing::debug!(swept, "expired query sources dropped");
        }
        swept
    }
}

// ============================================================================
// Synchronous request handling, run on the blocking pool
// ============================================================================

/// Ids name a single directory or file stem.
fn is_path_component(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && id != "." && id != ".."
}

impl Inner {
    /// Resolve the log file of a session, distinguishing unknown projects from
    /// unknown sessions.
    fn session_log(&self, project_id: &str, session_id: &str) -> EngineResult<PathBuf> {
        if !is_path_component(project_id) {
            return Err(EngineError::ProjectNotFound(project_id.to_string()));
        }
        let not_found = || EngineError::SessionNotFound {
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
        };
        if !is_path_component(session_id) {
            return Err(not_found());
        }

        let path = self.index.session_path(project_id, session_id);
        if path.is_file() {
            return Ok(path);
        }
        if self.index.project(project_id).is_none() {
            return Err(EngineError::ProjectNotFound(project_id.to_string()));
        }
        Err(not_found())
    }

    fn query<T>(&self, path: &Path, f: impl FnOnce(&QuerySource) -> T) -> EngineResult<T> {
        self.sources
            .with_source(path, f)
            .map_err(|err| EngineError::query(path, &err))
    }

    /// Serve from `cache` or compute and store. Failures are not cached.
    fn cached<T: Clone>(
        &self,
        cache: &ResultCache<T>,
        path: &Path,
        compute: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        if let Some(hit) = cache.get(path) {
            return Ok(hit);
        }
        // Key the result by the mtime seen before reading, never after.
        let mtime = Mtime::of(path);
        let value = compute()?;
        cache.put_at(path, mtime, value.clone());
        Ok(value)
    }

    fn subagent_totals(&self, project_id: &str, session_id: &str) -> EngineResult<Vec<SubagentTotals>> {
        self.index
            .subagent_files_for_session(project_id, session_id)
            .par_iter()
            .map(|file| self.query(file, |source| SubagentTotals::from_source(source)))
            .collect()
    }

    fn tool_usage(&self, project_id: &str, session_id: &str) -> EngineResult<ToolUsage> {
        let path = self.session_log(project_id, session_id)?;
        self.cached(&self.derived.tool_usage, &path, || {
            self.query(&path, |source| ops::tool_usage(source))
        })
    }

    fn metrics(&self, project_id: &str, session_id: &str) -> EngineResult<SessionMetrics> {
        let path = self.session_log(project_id, session_id)?;
        self.cached(&self.derived.metrics, &path, || {
            let mut metrics = self.query(&path, |source| ops::session_metrics(source))?;
            for subagent in self.subagent_totals(project_id, session_id)? {
                subagent.add_to_metrics(&mut metrics);
            }
            Ok(metrics)
        })
    }

    fn filter_options(&self, project_id: &str, session_id: &str) -> EngineResult<FilterOptions> {
        let path = self.session_log(project_id, session_id)?;
        self.cached(&self.derived.filter_options, &path, || {
            self.query(&path, |source| ops::filter_options(source))
        })
    }

    fn subagents(&self, project_id: &str, session_id: &str) -> EngineResult<SubagentList> {
        let path = self.session_log(project_id, session_id)?;
        self.cached(&self.derived.subagents, &path, || {
            let calls = self.query(&path, |source| ops::task_calls(source))?;
            let subagents = calls
                .into_par_iter()
                .filter_map(|call| {
                    let agent_id = call.agent_id.clone()?;
                    Some(self.subagent_info(project_id, session_id, agent_id, call))
                })
                .collect::<EngineResult<Vec<_>>>()?;

            Ok(SubagentList {
                total_count: subagents.len() as u64,
                subagents,
            })
        })
    }

    fn subagent_info(
        &self,
        project_id: &str,
        session_id: &str,
        agent_id: String,
        call: TaskCall,
    ) -> EngineResult<SubagentInfo> {
        let file = self.index.subagent_path(project_id, session_id, &agent_id);
        let mut info = SubagentInfo {
            agent_id,
            subagent_type: call.subagent_type,
            description: call.description,
            prompt_preview: call.prompt,
            start_time: call.timestamp,
            ..Default::default()
        };

        // The launch is recorded but its log is gone or not written yet.
        let Some(file) = file else {
            return Ok(info);
        };

        self.query(&file, |source| SubagentTotals::from_source(source))?
            .apply_to(&mut info);
        Ok(info)
    }

    fn list_messages(
        &self,
        project_id: &str,
        session_id: &str,
        request: &PageRequest,
    ) -> EngineResult<MessagePage> {
        let per_page = self.config.clamp_per_page(request.per_page);

        // Page numbers win over cursors when both are given.
        let cursor = match (request.page, request.cursor.as_deref()) {
            (None, Some(token)) => {
                let cursor = Cursor::decode(token)?;
                cursor.check_scope(&request.filter)?;
                Some(cursor)
            }
            _ => None,
        };

        let path = self.session_log(project_id, session_id)?;
        let rows = self.query(&path, |source| ops::messages(source, &request.filter))?;

        if let Some(page) = request.page {
            let page = pagination::paginate_offset(rows, page, per_page);
            return Ok(MessagePage {
                has_more: page.page < page.total_pages,
                items: page.items,
                next_cursor: None,
                total: page.total as u64,
                page: Some(page.page),
                per_page: page.per_page,
                total_pages: Some(page.total_pages),
            });
        }

        let page = pagination::paginate_after(rows, cursor.as_ref(), per_page, &request.filter);
        Ok(MessagePage {
            items: page.items,
            has_more: page.has_more,
            next_cursor: page.next_cursor.map(|cursor| cursor.encode()),
            total: 0,
            page: None,
            per_page,
            total_pages: None,
        })
    }

    fn session_aggregate(&self, project_id: &str, session_id: &str) -> EngineResult<SessionAggregate> {
        let path = self.session_log(project_id, session_id)?;
        let mtime = Mtime::of(&path);

        let trusted = self.durable.lock().get(project_id, session_id, mtime).cloned();
        if let Some(aggregate) = trusted {
            tracing::debug!(session = %session_id, "durable aggregate hit");
            return Ok(aggregate);
        }

        let (mut aggregate, status) = self.query(&path, |source| {
            (
                ops::aggregate(source, session_id, mtime),
                status_of(source, mtime),
            )
        })?;
        for subagent in self.subagent_totals(project_id, session_id)? {
            subagent.add_to_aggregate(&mut aggregate);
        }
        aggregate.status = status;

        self.durable.lock().put(project_id, aggregate.clone());
        if status.is_terminal() && self.sources.invalidate(&path) {
            tracing::debug!(session = %session_id, "session completed, query source released");
        }
        Ok(aggregate)
    }

    fn session_summary(
        &self,
        project_id: &str,
        session_id: &str,
        slug: Option<String>,
    ) -> EngineResult<SessionSummary> {
        let aggregate = self.session_aggregate(project_id, session_id)?;
        let subagent_count = self
            .index
            .subagent_files_for_session(project_id, session_id)
            .len();

        let duration_seconds = match (aggregate.first_activity, aggregate.last_activity) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            _ => 0,
        };

        Ok(SessionSummary {
            session_id: session_id.to_string(),
            slug,
            status: aggregate.status,
            start_time: aggregate.first_activity,
            end_time: aggregate.last_activity,
            duration_seconds,
            message_count: aggregate.message_count,
            tool_calls: aggregate.tool_calls,
            tokens: aggregate.tokens(),
            cost: aggregate.total_cost,
            errors: aggregate.error_count,
            subagent_count: subagent_count as u64,
            skills_used: aggregate.skills_used,
        })
    }

    fn list_sessions(&self, project_id: &str) -> EngineResult<Vec<SessionSummary>> {
        let sessions = self
            .index
            .list_sessions(project_id)
            .ok_or_else(|| EngineError::ProjectNotFound(project_id.to_string()))?;

        Ok(sessions
            .into_par_iter()
            .filter_map(|entry| {
                match self.session_summary(project_id, &entry.session_id, entry.slug) {
                    Ok(summary) => Some(summary),
                    Err(err) => {
                        tracing::warn!(session = %entry.session_id, "skipping session: {err}");
                        None
                    }
                }
            })
            .collect())
    }

    fn project_metrics(&self, project_id: &str) -> EngineResult<ProjectMetrics> {
        let sessions = self
            .index
            .list_sessions(project_id)
            .ok_or_else(|| EngineError::ProjectNotFound(project_id.to_string()))?;
        // Stat again: the published catalog can lag behind deletes and rewrites.
        let current: HashMap<&str, Mtime> = sessions
            .iter()
            .map(|entry| (entry.session_id.as_str(), Mtime::of(&entry.path)))
            .filter(|(_, mtime)| !mtime.is_missing())
            .collect();
        let cached = self.durable.lock().get_project_totals(project_id, &current);

        let live: Vec<SessionAggregate> = sessions
            .par_iter()
            .filter(|entry| !cached.covered.contains(&entry.session_id))
            .filter_map(|entry| match self.session_aggregate(project_id, &entry.session_id) {
                Ok(aggregate) => Some(aggregate),
                Err(err) => {
                    tracing::warn!(session = %entry.session_id, "skipping session: {err}");
                    None
                }
            })
            .collect();

        let mut totals = cached.totals;
        let mut live_totals = AggregateTotals::default();
        for aggregate in &live {
            live_totals.add(aggregate);
        }
        totals.merge(&live_totals);

        tracing::debug!(
            project = %project_id,
            cached = cached.covered.len(),
            live = live.len(),
            "project metrics assembled"
        );
        Ok(ProjectMetrics {
            project_id: project_id.to_string(),
            totals,
            cached_sessions: cached.covered.len() as u64,
            live_sessions: live.len() as u64,
        })
    }

    fn list_projects(&self) -> Vec<ProjectSummary> {
        let mut projects: Vec<ProjectSummary> = self
            .index
            .list_projects()
            .into_par_iter()
            .filter_map(|info| match self.project_metrics(&info.project_id) {
                Ok(metrics) => Some(ProjectSummary {
                    path_hash: info.project_id,
                    project_path: info.project_path,
                    session_count: info.session_count as u64,
                    tokens: metrics.totals.tokens,
                    total_cost: metrics.totals.total_cost,
                    first_activity: metrics.totals.first_activity,
                    last_activity: metrics.totals.last_activity,
                }),
                Err(err) => {
                    tracing::warn!(project = %info.project_id, "skipping project: {err}");
                    None
                }
            })
            .collect();

        projects.sort_by(|a, b| {
            let a_key = a.last_activity.or(a.first_activity);
            let b_key = b.last_activity.or(b.first_activity);
            b_key
                .cmp(&a_key)
                .then_with(|| a.path_hash.cmp(&b.path_hash))
        });
        projects
    }
}

#[cfg(test)]
mod tests;
