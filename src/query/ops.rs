//! Typed queries over a [`SourceData`] view.
//!
//! Every function here is pure: it reads the normalized records and returns an owned
//! result, so the caches above can store results without holding the view.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};

use super::{LogRecord, RecordKind, SourceData};
use crate::pagination::MessageFilter;
use crate::pricing::{cache_hit_rate, calculate_cost};
use crate::types::{
    CodeChanges, CommandsReport, CommandsSummary, CostBreakdown, DailyUsage, ErrorEntry,
    ErrorReport, FileChange, FilterOptions, MessageView, SessionAggregate, SessionMetrics,
    SkillUsage, SkillsReport, TokenUsage, ToolUsage, ToolUsageStats, UserCommand,
};
use crate::utils::Mtime;

/// Tool name used to launch subagents.
pub const TASK_TOOL: &str = "Task";
pub const SKILL_TOOL: &str = "Skill";

// ============================================================================
// Tokens and cost
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DedupKey {
    MessageId,
    RequestId,
    Uuid,
}

impl DedupKey {
    fn for_source(data: &SourceData) -> Self {
        if data.records.iter().any(|r| r.message_id.is_some()) {
            DedupKey::MessageId
        } else if data.schema.has_request_id {
            DedupKey::RequestId
        } else {
            DedupKey::Uuid
        }
    }

    fn of<'a>(self, record: &'a LogRecord) -> Option<&'a str> {
        match self {
            DedupKey::MessageId => record.message_id.as_deref(),
            DedupKey::RequestId => record.request_id.as_deref(),
            DedupKey::Uuid => record.uuid.as_deref(),
        }
    }
}

/// Records whose usage counts toward totals.
///
/// Streaming writes one line per content block, all repeating the same usage, so only
/// the first line of each API message is billed. Logs without message ids fall back to
/// request ids, then record uuids.
pub fn billed_records(data: &SourceData) -> Vec<&LogRecord> {
    let key = DedupKey::for_source(data);
    let mut seen = HashSet::new();

    data.records
        .iter()
        .filter(|record| record.usage.is_some())
        .filter(|record| match key.of(*record) {
            Some(id) => seen.insert(id),
            // Without message ids there is nothing to collapse on.
            None => key != DedupKey::MessageId,
        })
        .collect()
}

pub fn token_usage(data: &SourceData) -> TokenUsage {
    let mut total = TokenUsage::default();
    for record in billed_records(data) {
        if let Some(usage) = record.usage {
            total += usage;
        }
    }
    total
}

/// Billed tokens per model. Records without a model are left out.
pub fn tokens_by_model(data: &SourceData) -> BTreeMap<String, TokenUsage> {
    let mut by_model: BTreeMap<String, TokenUsage> = BTreeMap::new();
    for record in billed_records(data) {
        if let (Some(model), Some(usage)) = (&record.model, record.usage) {
            *by_model.entry(model.clone()).or_default() += usage;
        }
    }
    by_model
}

pub fn cost(data: &SourceData) -> CostBreakdown {
    let mut total = CostBreakdown::default();
    for (model, tokens) in tokens_by_model(data) {
        total += calculate_cost(&tokens, Some(&model));
    }
    total
}

pub fn models_used(data: &SourceData) -> Vec<String> {
    data.records
        .iter()
        .filter_map(|r| r.model.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ============================================================================
// Counts and activity
// ============================================================================

pub fn message_count(data: &SourceData) -> u64 {
    data.records.iter().filter(|r| r.kind.is_message()).count() as u64
}

pub fn tool_call_count(data: &SourceData) -> u64 {
    data.records
        .iter()
        .filter(|r| r.kind == RecordKind::Assistant)
        .map(|r| r.tool_calls.len() as u64)
        .sum()
}

pub fn error_count(data: &SourceData) -> u64 {
    data.records
        .iter()
        .filter(|r| r.kind == RecordKind::User)
        .flat_map(|r| &r.tool_results)
        .filter(|result| result.is_error)
        .count() as u64
}

/// Earliest and latest timestamps in the log.
pub fn time_range(data: &SourceData) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let timestamps = data.records.iter().filter_map(|r| r.timestamp);
    let (first, last) = timestamps.fold((None, None), |(min, max), ts| {
        (
            Some(min.map_or(ts, |m: DateTime<Utc>| m.min(ts))),
            Some(max.map_or(ts, |m: DateTime<Utc>| m.max(ts))),
        )
    });
    (first, last)
}

pub fn duration_seconds(data: &SourceData) -> i64 {
    match time_range(data) {
        (Some(first), Some(last)) => (last - first).num_seconds(),
        _ => 0,
    }
}

pub fn has_summary(data: &SourceData) -> bool {
    data.records.iter().any(|r| r.kind == RecordKind::Summary)
}

/// Whether the last record carrying text says the user interrupted the turn.
pub fn last_content_interrupted(data: &SourceData) -> bool {
    data.records
        .iter()
        .rev()
        .find(|r| r.text != super::MessageText::Empty)
        .is_some_and(|r| r.text.mentions("interrupted"))
}

/// Share of typed user prompts that were followed by another user record before any
/// assistant reply, as a percentage.
pub fn interruption_rate(data: &SourceData) -> f64 {
    let messages: Vec<&LogRecord> = data.records.iter().filter(|r| r.kind.is_message()).collect();

    let mut prompts = 0u64;
    let mut interrupted = 0u64;
    for (idx, record) in messages.iter().enumerate() {
        if record.kind != RecordKind::User || !record.text.is_plain_prompt() {
            continue;
        }
        prompts += 1;
        if messages
            .get(idx + 1)
            .is_some_and(|next| next.kind == RecordKind::User)
        {
            interrupted += 1;
        }
    }

    if prompts == 0 {
        0.0
    } else {
        interrupted as f64 / prompts as f64 * 100.0
    }
}

// ============================================================================
// Commands and days
// ============================================================================

/// Typed prompts in timestamp order, each with what the assistant did before the
/// next prompt.
pub fn user_commands(data: &SourceData) -> CommandsReport {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut messages: Vec<&LogRecord> = data
        .records
        .iter()
        .filter(|r| r.kind.is_message())
        .filter(|r| r.uuid.as_deref().is_none_or(|uuid| seen.insert(uuid)))
        .collect();
    messages.sort_by_key(|r| r.timestamp);

    let mut commands: Vec<UserCommand> = Vec::new();
    let mut tool_names: Vec<BTreeSet<String>> = Vec::new();
    for (idx, record) in messages.iter().enumerate() {
        let is_command = record.kind == RecordKind::User
            && record.role.as_deref() == Some("user")
            && record.text.is_plain_prompt();

        if is_command {
            commands.push(UserCommand {
                user_message: record.text.preview().unwrap_or_default(),
                timestamp: record.timestamp,
                followed_by_interruption: messages
                    .get(idx + 1)
                    .is_some_and(|next| next.kind == RecordKind::User),
                ..Default::default()
            });
            tool_names.push(BTreeSet::new());
            continue;
        }

        if record.kind != RecordKind::Assistant {
            continue;
        }
        let (Some(command), Some(names)) = (commands.last_mut(), tool_names.last_mut()) else {
            continue;
        };
        command.assistant_steps += 1;
        command.tools_used += record.tool_calls.len() as u64;
        names.extend(record.tool_calls.iter().map(|call| call.name.clone()));
        if command.model.is_none() {
            command.model = record.model.clone();
        }
    }

    for (command, names) in commands.iter_mut().zip(tool_names) {
        command.tool_names = names.into_iter().collect();
    }

    let summary = summarize_commands(&commands);
    CommandsReport { commands, summary }
}

fn summarize_commands(commands: &[UserCommand]) -> CommandsSummary {
    if commands.is_empty() {
        return CommandsSummary::default();
    }
    let total = commands.len() as f64;
    let steps: u64 = commands.iter().map(|c| c.assistant_steps).sum();
    let tools: u64 = commands.iter().map(|c| c.tools_used).sum();
    let with_tools = commands.iter().filter(|c| c.tools_used > 0).count();
    let interrupted = commands.iter().filter(|c| c.followed_by_interruption).count();

    CommandsSummary {
        total_commands: commands.len() as u64,
        avg_steps_per_command: steps as f64 / total,
        avg_tools_per_command: tools as f64 / total,
        percentage_requiring_tools: with_tools as f64 / total * 100.0,
        interruption_rate: interrupted as f64 / total * 100.0,
    }
}

/// Billed usage per UTC day, for records stamped within `[start, end]`.
pub fn daily_usage(
    data: &SourceData,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> BTreeMap<NaiveDate, DailyUsage> {
    let mut days: BTreeMap<NaiveDate, DailyUsage> = BTreeMap::new();
    for record in billed_records(data) {
        let (Some(timestamp), Some(usage)) = (record.timestamp, record.usage) else {
            continue;
        };
        if timestamp < start || timestamp > end {
            continue;
        }

        let date = timestamp.date_naive();
        let day = days.entry(date).or_insert_with(|| DailyUsage::empty(date));
        day.input_tokens += usage.input_tokens;
        day.output_tokens += usage.output_tokens;
        day.cache_creation += usage.cache_creation_input_tokens;
        day.cache_read += usage.cache_read_input_tokens;
        day.message_count += 1;
        day.cost += calculate_cost(&usage, record.model.as_deref()).total();
    }
    days
}

// ============================================================================
// Tools
// ============================================================================

/// Map from tool_use id to tool name.
fn tool_names_by_id(data: &SourceData) -> HashMap<&str, &str> {
    data.records
        .iter()
        .flat_map(|r| &r.tool_calls)
        .filter_map(|call| call.id.as_deref().map(|id| (id, call.name.as_str())))
        .collect()
}

pub fn tool_usage(data: &SourceData) -> ToolUsage {
    let mut counts: HashMap<&str, ToolUsageStats> = HashMap::new();
    for call in data
        .records
        .iter()
        .filter(|r| r.kind == RecordKind::Assistant)
        .flat_map(|r| &r.tool_calls)
    {
        let stats = counts.entry(call.name.as_str()).or_insert_with(|| ToolUsageStats {
            name: call.name.clone(),
            ..Default::default()
        });
        stats.count += 1;
    }

    let names = tool_names_by_id(data);
    for result in data.records.iter().flat_map(|r| &r.tool_results) {
        if !result.is_error {
            continue;
        }
        if let Some(name) = result.tool_use_id.as_deref().and_then(|id| names.get(id))
            && let Some(stats) = counts.get_mut(name)
        {
            stats.error_count += 1;
        }
    }

    let mut tools: Vec<ToolUsageStats> = counts.into_values().collect();
    tools.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    let total_calls = tools.iter().map(|t| t.count).sum();

    ToolUsage { tools, total_calls }
}

pub fn errors(data: &SourceData) -> ErrorReport {
    let names = tool_names_by_id(data);
    let mut errors = Vec::new();

    for record in data.records.iter().filter(|r| r.kind == RecordKind::User) {
        for result in record.tool_results.iter().filter(|result| result.is_error) {
            errors.push(ErrorEntry {
                timestamp: record.timestamp,
                tool_name: result
                    .tool_use_id
                    .as_deref()
                    .and_then(|id| names.get(id))
                    .map(|name| name.to_string()),
                error_message: result.error_text.clone().unwrap_or_default(),
                uuid: record.uuid.clone().unwrap_or_default(),
            });
        }
    }

    let total = errors.len() as u64;
    ErrorReport { errors, total }
}

pub fn skills(data: &SourceData) -> SkillsReport {
    let mut by_name: HashMap<String, SkillUsage> = HashMap::new();
    for record in &data.records {
        for call in record.tool_calls.iter().filter(|c| c.name == SKILL_TOOL) {
            let Some(skill) = &call.input.skill else {
                continue;
            };
            let usage = by_name.entry(skill.clone()).or_insert_with(|| SkillUsage {
                skill_name: skill.clone(),
                ..Default::default()
            });
            usage.invocation_count += 1;
            if record.timestamp > usage.last_used {
                usage.last_used = record.timestamp;
            }
        }
    }

    let mut skills: Vec<SkillUsage> = by_name.into_values().collect();
    skills.sort_by(|a, b| {
        b.invocation_count
            .cmp(&a.invocation_count)
            .then_with(|| a.skill_name.cmp(&b.skill_name))
    });
    let total_invocations = skills.iter().map(|s| s.invocation_count).sum();

    SkillsReport {
        skills,
        total_invocations,
    }
}

pub fn code_changes(data: &SourceData) -> CodeChanges {
    let mut changes = CodeChanges::default();

    for call in data.records.iter().flat_map(|r| &r.tool_calls) {
        let Some(file_path) = &call.input.file_path else {
            continue;
        };
        let change = match call.name.as_str() {
            "Write" => {
                changes.files_created += 1;
                FileChange {
                    file_path: file_path.clone(),
                    operation: call.name.clone(),
                    lines_added: call.input.content_lines.unwrap_or(0),
                    lines_removed: 0,
                }
            }
            "Edit" => {
                changes.files_modified += 1;
                let old = call.input.old_lines.unwrap_or(0);
                let new = call.input.new_lines.unwrap_or(0);
                FileChange {
                    file_path: file_path.clone(),
                    operation: call.name.clone(),
                    lines_added: new.saturating_sub(old),
                    lines_removed: old.saturating_sub(new),
                }
            }
            _ => continue,
        };
        changes.lines_added += change.lines_added;
        changes.lines_removed += change.lines_removed;
        changes.changes_by_file.push(change);
    }

    changes.net_lines = changes.lines_added as i64 - changes.lines_removed as i64;
    changes
}

// ============================================================================
// Subagent launches
// ============================================================================

/// A `Task` tool call and the subagent it started, when that can be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCall {
    pub tool_use_id: Option<String>,
    pub subagent_type: String,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub agent_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn task_calls(data: &SourceData) -> Vec<TaskCall> {
    // tool_use id -> agent id, from tool results and progress records
    let mut agents: HashMap<&str, &str> = HashMap::new();
    for record in &data.records {
        let Some(agent_id) = record.agent_id.as_deref() else {
            continue;
        };
        if let Some(parent) = record.parent_tool_use_id.as_deref() {
            agents.entry(parent).or_insert(agent_id);
        }
        for result in &record.tool_results {
            if let Some(id) = result.tool_use_id.as_deref() {
                agents.insert(id, agent_id);
            }
        }
    }

    data.records
        .iter()
        .flat_map(|record| record.tool_calls.iter().map(move |call| (record, call)))
        .filter(|(_, call)| call.name == TASK_TOOL)
        .map(|(record, call)| TaskCall {
            tool_use_id: call.id.clone(),
            subagent_type: call
                .input
                .subagent_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            description: call.input.description.clone(),
            prompt: call.input.prompt.clone(),
            agent_id: call
                .id
                .as_deref()
                .and_then(|id| agents.get(id))
                .map(|agent| agent.to_string()),
            timestamp: record.timestamp,
        })
        .collect()
}

// ============================================================================
// Composite results
// ============================================================================

/// Metrics for this log alone; subagent contributions are added by the engine.
pub fn session_metrics(data: &SourceData) -> SessionMetrics {
    let tokens = token_usage(data);
    SessionMetrics {
        cost: cost(data),
        cache_hit_rate: cache_hit_rate(&tokens),
        tokens,
        duration_seconds: duration_seconds(data),
        message_count: message_count(data),
        tool_calls: tool_call_count(data),
        error_count: error_count(data),
        models_used: models_used(data),
        interruption_rate: interruption_rate(data),
    }
}

/// Aggregate for this log alone, without status.
pub fn aggregate(data: &SourceData, session_id: &str, mtime: Mtime) -> SessionAggregate {
    let (first_activity, last_activity) = time_range(data);
    let mut aggregate = SessionAggregate {
        session_id: session_id.to_string(),
        total_cost: cost(data).total(),
        message_count: message_count(data),
        tool_calls: tool_call_count(data),
        error_count: error_count(data),
        first_activity,
        last_activity,
        skills_used: skills(data)
            .skills
            .into_iter()
            .map(|usage| usage.skill_name)
            .collect(),
        mtime,
        ..Default::default()
    };
    aggregate.set_tokens(token_usage(data));
    aggregate
}

pub fn filter_options(data: &SourceData) -> FilterOptions {
    let message_types: BTreeSet<&str> = data
        .records
        .iter()
        .filter(|r| r.kind.is_message())
        .map(|r| r.kind.as_str())
        .collect();
    let tools: BTreeSet<&str> = data
        .records
        .iter()
        .flat_map(|r| &r.tool_calls)
        .map(|call| call.name.as_str())
        .collect();

    FilterOptions {
        message_types: message_types.into_iter().map(String::from).collect(),
        models: models_used(data),
        tools: tools.into_iter().map(String::from).collect(),
        message_count: message_count(data),
    }
}

/// Messages matching `filter`, ordered by (timestamp, uuid).
///
/// Records without a timestamp or uuid cannot be addressed by a cursor and are left out.
/// A uuid written more than once (resumed or re-read sessions) yields one row, taken
/// from its first occurrence.
pub fn messages(data: &SourceData, filter: &MessageFilter) -> Vec<MessageView> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut views: Vec<MessageView> = data
        .records
        .iter()
        .filter(|r| r.kind.is_message())
        .filter(|r| r.uuid.as_deref().is_some_and(|uuid| seen.insert(uuid)))
        .filter(|r| filter.matches(r))
        .filter_map(|record| {
            Some(MessageView {
                uuid: record.uuid.clone()?,
                message_type: record.kind.as_str().to_string(),
                timestamp: record.timestamp?,
                content: record.text.preview(),
                model: record.model.clone(),
                tokens: record.usage.unwrap_or_default(),
                tools: record.tool_calls.iter().map(|c| c.name.clone()).collect(),
                has_tool_result: !record.tool_results.is_empty(),
                is_error: record.is_error(),
                session_id: record.session_id.clone().unwrap_or_default(),
            })
        })
        .collect();

    views.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.uuid.cmp(&b.uuid))
    });
    views
}
