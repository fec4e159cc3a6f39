use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::Mtime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_creation_input_tokens += rhs.cache_creation_input_tokens;
        self.cache_read_input_tokens += rhs.cache_read_input_tokens;
    }
}

/// Cost in USD split by token kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_creation_cost + self.cache_read_cost
    }
}

impl AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: Self) {
        self.input_cost += rhs.input_cost;
        self.output_cost += rhs.output_cost;
        self.cache_creation_cost += rhs.cache_creation_cost;
        self.cache_read_cost += rhs.cache_read_cost;
    }
}

/// Lifecycle state of a session or subagent log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Idle,
    Interrupted,
    Completed,
    #[default]
    Unknown,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Completed => "completed",
            SessionStatus::Unknown => "unknown",
        }
    }

    /// Completed logs never receive further appends.
    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Completed
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Per-session derived results
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolUsageStats {
    pub name: String,
    pub count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolUsage {
    /// Sorted by call count, most used first
    pub tools: Vec<ToolUsageStats>,
    pub total_calls: u64,
}

impl ToolUsage {
    /// Per-tool sums over several reports, sorted like a single report.
    pub fn merge_all<'a>(reports: impl IntoIterator<Item = &'a ToolUsage>) -> ToolUsage {
        let mut by_name: HashMap<&str, ToolUsageStats> = HashMap::new();
        for stats in reports.into_iter().flat_map(|report| &report.tools) {
            let merged = by_name.entry(stats.name.as_str()).or_insert_with(|| ToolUsageStats {
                name: stats.name.clone(),
                ..Default::default()
            });
            merged.count += stats.count;
            merged.error_count += stats.error_count;
        }

        let mut tools: Vec<ToolUsageStats> = by_name.into_values().collect();
        tools.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        let total_calls = tools.iter().map(|t| t.count).sum();
        ToolUsage { tools, total_calls }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub tokens: TokenUsage,
    pub cost: CostBreakdown,
    pub duration_seconds: i64,
    pub message_count: u64,
    pub tool_calls: u64,
    pub error_count: u64,
    pub cache_hit_rate: f64,
    pub models_used: Vec<String>,
    pub interruption_rate: f64,
}

/// Values a message listing can be filtered by, as present in one log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub message_types: Vec<String>,
    pub models: Vec<String>,
    pub tools: Vec<String>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentInfo {
    pub agent_id: String,
    pub subagent_type: String,
    pub description: Option<String>,
    pub prompt_preview: Option<String>,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub tool_calls: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentList {
    pub subagents: Vec<SubagentInfo>,
    pub total_count: u64,
}

/// A subagent looked up by agent id alone, with the session that launched it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentDetail {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub info: SubagentInfo,
}

/// A prompt the user typed, and what the assistant did until the next one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCommand {
    pub user_message: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub assistant_steps: u64,
    pub tools_used: u64,
    pub tool_names: Vec<String>,
    pub model: Option<String>,
    /// The next message after the prompt was another user record
    pub followed_by_interruption: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandsSummary {
    pub total_commands: u64,
    pub avg_steps_per_command: f64,
    pub avg_tools_per_command: f64,
    pub percentage_requiring_tools: f64,
    pub interruption_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandsReport {
    pub commands: Vec<UserCommand>,
    pub summary: CommandsSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillUsage {
    pub skill_name: String,
    pub invocation_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillsReport {
    pub skills: Vec<SkillUsage>,
    pub total_invocations: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub file_path: String,
    /// `Edit` or `Write`
    pub operation: String,
    pub lines_added: u64,
    pub lines_removed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeChanges {
    pub files_created: u64,
    pub files_modified: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub net_lines: i64,
    pub changes_by_file: Vec<FileChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub tool_name: Option<String>,
    pub error_message: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub errors: Vec<ErrorEntry>,
    pub total: u64,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub uuid: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub content: Option<String>,
    pub model: Option<String>,
    pub tokens: TokenUsage,
    pub tools: Vec<String>,
    pub has_tool_result: bool,
    pub is_error: bool,
    pub session_id: String,
}

/// One page of a session's messages.
///
/// Cursor mode reports `total = 0` and leaves `page`/`total_pages` unset; offset mode
/// reports the exact filtered total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub items: Vec<MessageView>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub total: u64,
    pub page: Option<usize>,
    pub per_page: usize,
    pub total_pages: Option<usize>,
}

// ============================================================================
// Aggregates
// ============================================================================

/// Durable per-session aggregate, persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregate {
    pub session_id: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub first_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    /// Skills invoked from the main log, most used first
    #[serde(default)]
    pub skills_used: Vec<String>,
    #[serde(default)]
    pub mtime: Mtime,
}

impl SessionAggregate {
    pub fn tokens(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens,
        }
    }

    pub fn set_tokens(&mut self, tokens: TokenUsage) {
        self.input_tokens = tokens.input_tokens;
        self.output_tokens = tokens.output_tokens;
        self.cache_creation_input_tokens = tokens.cache_creation_input_tokens;
        self.cache_read_input_tokens = tokens.cache_read_input_tokens;
    }
}

/// Sums over a set of session aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub tokens: TokenUsage,
    pub total_cost: f64,
    pub message_count: u64,
    pub tool_calls: u64,
    pub error_count: u64,
    pub session_count: u64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl AggregateTotals {
    pub fn add(&mut self, aggregate: &SessionAggregate) {
        self.tokens += aggregate.tokens();
        self.total_cost += aggregate.total_cost;
        self.message_count += aggregate.message_count;
        self.tool_calls += aggregate.tool_calls;
        self.error_count += aggregate.error_count;
        self.session_count += 1;
        self.first_activity = earliest(self.first_activity, aggregate.first_activity);
        self.last_activity = latest(self.last_activity, aggregate.last_activity);
    }

    pub fn merge(&mut self, other: &AggregateTotals) {
        self.tokens += other.tokens;
        self.total_cost += other.total_cost;
        self.message_count += other.message_count;
        self.tool_calls += other.tool_calls;
        self.error_count += other.error_count;
        self.session_count += other.session_count;
        self.first_activity = earliest(self.first_activity, other.first_activity);
        self.last_activity = latest(self.last_activity, other.last_activity);
    }
}

/// Project totals served from the durable cache, plus the sessions they cover.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectTotals {
    pub totals: AggregateTotals,
    pub covered: BTreeSet<String>,
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

// ============================================================================
// Listings
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub slug: Option<String>,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub message_count: u64,
    pub tool_calls: u64,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub errors: u64,
    pub subagent_count: u64,
    pub skills_used: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub path_hash: String,
    pub project_path: String,
    pub session_count: u64,
    pub tokens: TokenUsage,
    pub total_cost: f64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Billed usage of one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub message_count: u64,
    pub cost: f64,
}

impl DailyUsage {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation: 0,
            cache_read: 0,
            message_count: 0,
            cost: 0.0,
        }
    }

    pub fn merge(&mut self, other: &DailyUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation += other.cache_creation;
        self.cache_read += other.cache_read;
        self.message_count += other.message_count;
        self.cost += other.cost;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricsReport {
    pub project_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Days with billed usage, oldest first
    pub metrics: Vec<DailyUsage>,
}

/// Totals summed over every project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllProjectsMetrics {
    pub totals: AggregateTotals,
    pub project_count: u64,
}

/// Project-wide metrics, split into the part served by the durable cache and the part
/// computed live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetrics {
    pub project_id: String,
    pub totals: AggregateTotals,
    pub cached_sessions: u64,
    pub live_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_token_usage_add_assign() {
        let mut a = TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            cache_creation_input_tokens: 3,
            cache_read_input_tokens: 4,
        };
        let b = a;
        a += b;
        assert_eq!(a.total(), 20);
        assert!(!a.is_empty());
        assert!(TokenUsage::default().is_empty());
    }

    #[test]
    fn test_tool_usage_merge_sums_and_resorts() {
        let stats = |name: &str, count, error_count| ToolUsageStats {
            name: name.into(),
            count,
            error_count,
        };
        let a = ToolUsage {
            tools: vec![stats("Read", 3, 0), stats("Bash", 1, 1)],
            total_calls: 4,
        };
        let b = ToolUsage {
            tools: vec![stats("Bash", 4, 0), stats("Edit", 1, 0)],
            total_calls: 5,
        };

        let merged = ToolUsage::merge_all([&a, &b]);
        assert_eq!(merged.total_calls, 9);
        assert_eq!(merged.tools[0], stats("Bash", 5, 1));
        assert_eq!(merged.tools[1], stats("Read", 3, 0));
        assert_eq!(merged.tools[2], stats("Edit", 1, 0));
        assert_eq!(ToolUsage::merge_all(Vec::new()), ToolUsage::default());
    }

    #[test]
    fn test_session_status_serializes_lowercase() {
        let json = simd_json::to_string(&SessionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");

        let mut bytes = b"\"interrupted\"".to_vec();
        let status: SessionStatus = simd_json::from_slice(&mut bytes).unwrap();
        assert_eq!(status, SessionStatus::Interrupted);
        assert!(!status.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
    }

    #[test]
    fn test_aggregate_totals_tracks_activity_bounds() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        let mut totals = AggregateTotals::default();
        totals.add(&SessionAggregate {
            session_id: "a".into(),
            input_tokens: 10,
            total_cost: 1.5,
            first_activity: Some(late),
            last_activity: Some(late),
            ..Default::default()
        });
        totals.add(&SessionAggregate {
            session_id: "b".into(),
            output_tokens: 5,
            total_cost: 0.5,
            first_activity: Some(early),
            last_activity: None,
            ..Default::default()
        });

        assert_eq!(totals.session_count, 2);
        assert_eq!(totals.tokens.total(), 15);
        assert!((totals.total_cost - 2.0).abs() < 1e-9);
        assert_eq!(totals.first_activity, Some(early));
        assert_eq!(totals.last_activity, Some(late));
    }
}
