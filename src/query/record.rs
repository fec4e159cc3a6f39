//! Normalized transcript records.
//!
//! Each JSONL line is decoded once into a [`LogRecord`]. Every optional field of the
//! transcript format is an `Option` here, so queries never fail because an older or
//! newer producer omitted a field.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use simd_json::OwnedValue;
use simd_json::prelude::*;

use crate::types::TokenUsage;
use crate::utils::{count_lines, deserialize_optional_timestamp, parse_timestamp, truncate_chars};

/// Longest message preview handed to callers.
pub const CONTENT_PREVIEW_CHARS: usize = 500;
/// Longest contribution of a single text block to a preview.
pub const BLOCK_PREVIEW_CHARS: usize = 200;

// CLAUDE CODE JSONL SCHEMA

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
    /// Either a plain string or a list of content blocks
    #[serde(default)]
    content: Option<OwnedValue>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type", default)]
    entry_type: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(rename = "toolUseResult", default)]
    tool_use_result: Option<OwnedValue>,
    #[serde(rename = "parentToolUseID", default)]
    parent_tool_use_id: Option<String>,
    #[serde(default)]
    data: Option<OwnedValue>,
}

// END OF SCHEMA

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RecordKind {
    User,
    Assistant,
    Summary,
    Progress,
    System,
    #[default]
    Other,
}

impl RecordKind {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("user") => RecordKind::User,
            Some("assistant") => RecordKind::Assistant,
            Some("summary") => RecordKind::Summary,
            Some("progress") => RecordKind::Progress,
            Some("system") => RecordKind::System,
            _ => RecordKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::User => "user",
            RecordKind::Assistant => "assistant",
            RecordKind::Summary => "summary",
            RecordKind::Progress => "progress",
            RecordKind::System => "system",
            RecordKind::Other => "other",
        }
    }

    /// Only user and assistant records are listed as messages.
    pub fn is_message(self) -> bool {
        matches!(self, RecordKind::User | RecordKind::Assistant)
    }
}

/// Text carried by a record's message content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MessageText {
    #[default]
    Empty,
    /// Content was a plain string (typed prompts, interruption notices)
    Plain(String),
    /// Text blocks from a content list, in order
    Blocks(Vec<String>),
}

impl MessageText {
    /// Caller-facing preview: plain strings cut at 500 chars; block lists contribute
    /// at most 200 chars per block and are cut at 500 overall.
    pub fn preview(&self) -> Option<String> {
        let text = match self {
            MessageText::Empty => return None,
            MessageText::Plain(text) => truncate_chars(text, CONTENT_PREVIEW_CHARS),
            MessageText::Blocks(blocks) => {
                let joined: String = blocks
                    .iter()
                    .map(|block| truncate_chars(block, BLOCK_PREVIEW_CHARS))
                    .collect();
                truncate_chars(&joined, CONTENT_PREVIEW_CHARS)
            }
        };
        (!text.is_empty()).then_some(text)
    }

    /// Case-insensitive substring search across all text.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        match self {
            MessageText::Empty => false,
            MessageText::Plain(text) => text.to_lowercase().contains(&needle),
            MessageText::Blocks(blocks) => blocks
                .iter()
                .any(|block| block.to_lowercase().contains(&needle)),
        }
    }

    pub fn is_plain_prompt(&self) -> bool {
        matches!(self, MessageText::Plain(text) if !text.trim().is_empty())
    }
}

/// The parts of a tool input that queries look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolInput {
    pub subagent_type: Option<String>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub skill: Option<String>,
    pub file_path: Option<String>,
    pub old_lines: Option<u64>,
    pub new_lines: Option<u64>,
    pub content_lines: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub input: ToolInput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: Option<String>,
    pub is_error: bool,
    /// Only kept for errors
    pub error_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRecord {
    /// Zero-based line number in the source file
    pub line: usize,
    pub kind: RecordKind,
    pub uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub request_id: Option<String>,
    pub message_id: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub text: MessageText,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    /// Subagent id from `toolUseResult.agentId` or a progress record's `data.agentId`
    pub agent_id: Option<String>,
    pub parent_tool_use_id: Option<String>,
}

impl LogRecord {
    /// Decode one JSONL line. Returns `None` for blank or non-JSON lines.
    pub fn parse_line(line: usize, text: &str) -> Option<LogRecord> {
        if text.trim().is_empty() {
            return None;
        }

        let mut bytes = text.as_bytes().to_vec();
        match simd_json::from_slice::<RawEntry>(&mut bytes) {
            Ok(raw) => Some(LogRecord::from_raw(line, raw)),
            Err(_) => {
                // Shape drifted somewhere deep; keep what the top level still tells us.
                let mut bytes = text.as_bytes().to_vec();
                let value = simd_json::to_owned_value(&mut bytes).ok()?;
                value.as_object()?;
                Some(LogRecord {
                    line,
                    kind: RecordKind::parse(value.get("type").and_then(|v| v.as_str())),
                    uuid: owned_str(&value, "uuid"),
                    timestamp: value
                        .get("timestamp")
                        .and_then(|v| v.as_str())
                        .and_then(parse_timestamp),
                    session_id: owned_str(&value, "sessionId"),
                    cwd: owned_str(&value, "cwd"),
                    request_id: owned_str(&value, "requestId"),
                    ..Default::default()
                })
            }
        }
    }

    fn from_raw(line: usize, raw: RawEntry) -> LogRecord {
        let mut record = LogRecord {
            line,
            kind: RecordKind::parse(raw.entry_type.as_deref()),
            uuid: raw.uuid,
            timestamp: raw.timestamp,
            session_id: raw.session_id,
            cwd: raw.cwd,
            request_id: raw.request_id,
            parent_tool_use_id: raw.parent_tool_use_id,
            ..Default::default()
        };

        if let Some(message) = raw.message {
            record.message_id = message.id;
            record.role = message.role;
            record.model = message.model;
            record.usage = message.usage.map(|usage| TokenUsage {
                input_tokens: usage.input_tokens.unwrap_or(0),
                output_tokens: usage.output_tokens.unwrap_or(0),
                cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
            });
            if let Some(content) = &message.content {
                record.read_content(content);
            }
        }

        record.agent_id = raw
            .tool_use_result
            .as_ref()
            .and_then(|result| owned_str(result, "agentId"))
            .or_else(|| raw.data.as_ref().and_then(|data| owned_str(data, "agentId")));

        record
    }

    fn read_content(&mut self, content: &OwnedValue) {
        if let Some(text) = content.as_str() {
            self.text = MessageText::Plain(text.to_string());
            return;
        }

        let Some(items) = content.as_array() else {
            return;
        };

        let mut blocks = Vec::new();
        for item in items.iter() {
            if let Some(text) = item.as_str() {
                blocks.push(text.to_string());
                continue;
            }

            match item.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                        blocks.push(text.to_string());
                    }
                }
                Some("tool_use") => {
                    let Some(name) = owned_str(item, "name") else {
                        continue;
                    };
                    self.tool_calls.push(ToolCall {
                        id: owned_str(item, "id"),
                        input: item.get("input").map(read_tool_input).unwrap_or_default(),
                        name,
                    });
                }
                Some("tool_result") => {
                    let is_error = item
                        .get("is_error")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    self.tool_results.push(ToolResult {
                        tool_use_id: owned_str(item, "tool_use_id"),
                        is_error,
                        error_text: if is_error {
                            Some(result_text(item.get("content")))
                        } else {
                            None
                        },
                    });
                }
                _ => {}
            }
        }

        if !blocks.is_empty() {
            self.text = MessageText::Blocks(blocks);
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == RecordKind::User && self.tool_results.iter().any(|result| result.is_error)
    }
}

fn owned_str(value: &OwnedValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn read_tool_input(input: &OwnedValue) -> ToolInput {
    let lines_of = |key: &str| -> Option<u64> {
        input.get(key).and_then(|v| v.as_str()).map(count_lines)
    };

    ToolInput {
        subagent_type: owned_str(input, "subagent_type"),
        description: owned_str(input, "description"),
        prompt: input
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(|prompt| truncate_chars(prompt, CONTENT_PREVIEW_CHARS)),
        skill: owned_str(input, "skill"),
        file_path: owned_str(input, "file_path"),
        old_lines: lines_of("old_string"),
        new_lines: lines_of("new_string"),
        content_lines: lines_of("content"),
    }
}

/// Flatten a tool result's content into one line of text, capped for display.
fn result_text(content: Option<&OwnedValue>) -> String {
    let Some(content) = content else {
        return String::new();
    };

    let text = if let Some(text) = content.as_str() {
        text.to_string()
    } else if let Some(items) = content.as_array() {
        items
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .or_else(|| item.get("text").and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
            })
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        String::new()
    };

    truncate_chars(&text, CONTENT_PREVIEW_CHARS)
}
