//! Cross-session reports: prompts, usage per day, and totals that span projects.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rayon::prelude::*;

use super::{Inner, SubagentTotals, is_path_component};
use crate::discovery::SubagentLog;
use crate::error::{EngineError, EngineResult};
use crate::query::ops;
use crate::types::{
    AggregateTotals, AllProjectsMetrics, CommandsReport, DailyMetricsReport, DailyUsage,
    SubagentDetail, SubagentInfo, ToolUsage,
};

pub const DEFAULT_DAYS: u32 = 30;
pub const MAX_DAYS: u32 = 365;

/// Window of a daily report. Unset bounds come from `days` counted back from now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyRange {
    pub days: Option<u32>,
    /// First day included, from midnight UTC
    pub start: Option<NaiveDate>,
    /// Last day included, up to its final instant UTC
    pub end: Option<NaiveDate>,
}

impl DailyRange {
    pub fn resolve(&self, now: DateTime<Utc>) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
        let days = self.days.unwrap_or(DEFAULT_DAYS);
        if !(1..=MAX_DAYS).contains(&days) {
            return Err(EngineError::InvalidRange(format!(
                "days must be between 1 and {MAX_DAYS}, got {days}"
            )));
        }

        let end = match self.end {
            Some(date) => date
                .and_hms_nano_opt(23, 59, 59, 999_999_999)
                .map(|end| end.and_utc())
                .ok_or_else(|| EngineError::InvalidRange(format!("end date {date} is out of range")))?,
            None => now,
        };
        let start = match self.start {
            Some(date) => date
                .and_hms_opt(0, 0, 0)
                .map(|start| start.and_utc())
                .ok_or_else(|| EngineError::InvalidRange(format!("start date {date} is out of range")))?,
            None => end - Duration::days(i64::from(days)),
        };

        if start > end {
            return Err(EngineError::InvalidRange(format!(
                "start {} is after end {}",
                start.date_naive(),
                end.date_naive()
            )));
        }
        Ok((start, end))
    }
}

impl Inner {
    pub(super) fn commands(&self, project_id: &str, session_id: &str) -> EngineResult<CommandsReport> {
        let path = self.session_log(project_id, session_id)?;
        self.query(&path, |source| ops::user_commands(source))
    }

    pub(super) fn daily_metrics(
        &self,
        project_id: &str,
        range: &DailyRange,
    ) -> EngineResult<DailyMetricsReport> {
        let (start, end) = range.resolve(Utc::now())?;
        let sessions = self
            .index
            .list_sessions(project_id)
            .ok_or_else(|| EngineError::ProjectNotFound(project_id.to_string()))?;

        let per_session: Vec<BTreeMap<NaiveDate, DailyUsage>> = sessions
            .par_iter()
            .filter_map(|entry| {
                match self.query(&entry.path, |source| ops::daily_usage(source, start, end)) {
                    Ok(days) => Some(days),
                    Err(err) => {
                        tracing::warn!(session = %entry.session_id, "skipping session: {err}");
                        None
                    }
                }
            })
            .collect();

        let mut days: BTreeMap<NaiveDate, DailyUsage> = BTreeMap::new();
        for day in per_session.iter().flat_map(|days| days.values()) {
            days.entry(day.date)
                .or_insert_with(|| DailyUsage::empty(day.date))
                .merge(day);
        }

        Ok(DailyMetricsReport {
            project_id: project_id.to_string(),
            start,
            end,
            metrics: days.into_values().collect(),
        })
    }

    pub(super) fn all_projects_metrics(&self) -> AllProjectsMetrics {
        let per_project: Vec<AggregateTotals> = self
            .index
            .list_projects()
            .into_par_iter()
            .filter_map(|info| match self.project_metrics(&info.project_id) {
                Ok(metrics) => Some(metrics.totals),
                Err(err) => {
                    tracing::warn!(project = %info.project_id, "skipping project: {err}");
                    None
                }
            })
            .collect();

        let mut totals = AggregateTotals::default();
        for project in &per_project {
            totals.merge(project);
        }
        AllProjectsMetrics {
            totals,
            project_count: per_project.len() as u64,
        }
    }

    pub(super) fn project_tool_usage(&self, project_id: &str) -> EngineResult<ToolUsage> {
        let sessions = self
            .index
            .list_sessions(project_id)
            .ok_or_else(|| EngineError::ProjectNotFound(project_id.to_string()))?;

        let reports: Vec<ToolUsage> = sessions
            .par_iter()
            .filter_map(|entry| match self.tool_usage(project_id, &entry.session_id) {
                Ok(usage) => Some(usage),
                Err(err) => {
                    tracing::warn!(session = %entry.session_id, "skipping session: {err}");
                    None
                }
            })
            .collect();
        Ok(ToolUsage::merge_all(&reports))
    }

    /// Resolve an agent id to its log, telling unknown projects from unknown agents.
    fn subagent_log(&self, project_id: &str, agent_id: &str) -> EngineResult<SubagentLog> {
        if !is_path_component(project_id) {
            return Err(EngineError::ProjectNotFound(project_id.to_string()));
        }
        if let Some(log) = self.index.find_subagent(project_id, agent_id) {
            return Ok(log);
        }
        if self.index.project(project_id).is_none() {
            return Err(EngineError::ProjectNotFound(project_id.to_string()));
        }
        Err(EngineError::SubagentNotFound {
            project_id: project_id.to_string(),
            agent_id: agent_id.to_string(),
        })
    }

    pub(super) fn subagent_detail(&self, project_id: &str, agent_id: &str) -> EngineResult<SubagentDetail> {
        let log = self.subagent_log(project_id, agent_id)?;
        let totals = self.query(&log.path, |source| SubagentTotals::from_source(source))?;

        let mut info = SubagentInfo {
            agent_id: log.agent_id,
            subagent_type: log.subagent_type.unwrap_or_else(|| "unknown".to_string()),
            ..Default::default()
        };
        totals.apply_to(&mut info);
        Ok(SubagentDetail {
            session_id: log.session_id,
            info,
        })
    }

    pub(super) fn subagent_tools(&self, project_id: &str, agent_id: &str) -> EngineResult<ToolUsage> {
        let log = self.subagent_log(project_id, agent_id)?;
        self.cached(&self.derived.tool_usage, &log.path, || {
            self.query(&log.path, |source| ops::tool_usage(source))
        })
    }
}
