//! Structured access to one transcript file.
//!
//! A [`LogQueryEngine`] turns a JSONL log into a [`SourceData`]: a schema plus
//! the normalized records. The [`ops`] module runs the typed queries over that view.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, bail};

pub mod ops;
pub mod record;

pub use record::{LogRecord, MessageText, RecordKind, ToolCall, ToolInput, ToolResult};

/// Bytes read from the start of a log for schema detection.
pub const HEAD_BYTES: u64 = 64 * 1024;

/// Which optional transcript fields a log actually contains.
///
/// Producers added fields over time; queries consult the schema instead of assuming
/// the newest layout. Detection only sees the head of the file, so flags are merged with
/// what the materialized records show once a view is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSchema {
    pub bytes: u64,
    /// Extrapolated from the head; the decoded record count once materialized
    pub line_count: usize,
    pub has_message: bool,
    pub has_usage: bool,
    pub has_request_id: bool,
    pub has_tool_use_result: bool,
    pub has_progress_data: bool,
}

impl SourceSchema {
    /// Detect field presence from the raw bytes. Every JSON key appears literally as
    /// `"key"`, so a miss here means the field is absent from these bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        SourceSchema {
            bytes: bytes.len() as u64,
            line_count: bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count(),
            has_message: contains(bytes, b"\"message\""),
            has_usage: contains(bytes, b"\"usage\""),
            has_request_id: contains(bytes, b"\"requestId\""),
            has_tool_use_result: contains(bytes, b"\"toolUseResult\""),
            has_progress_data: contains(bytes, b"\"data\""),
        }
    }

    /// Schema of a file of `total` bytes whose first bytes are `head`.
    pub fn from_head(head: &[u8], total: u64) -> Self {
        let mut schema = Self::from_bytes(head);
        if (head.len() as u64) < total && !head.is_empty() {
            let scaled = schema.line_count as u128 * total as u128 / head.len() as u128;
            schema.line_count = scaled as usize;
        }
        schema.bytes = total;
        schema
    }

    /// Fold in what the decoded records show, so fields past the head count.
    pub fn absorb(&mut self, records: &[LogRecord]) {
        self.line_count = records.len();
        for record in records {
            self.has_message |= record.role.is_some() || record.message_id.is_some();
            self.has_usage |= record.usage.is_some();
            self.has_request_id |= record.request_id.is_some();
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Normalized, queryable view of one log file.
#[derive(Debug, Clone, Default)]
pub struct SourceData {
    pub schema: SourceSchema,
    pub records: Vec<LogRecord>,
}

impl SourceData {
    pub fn from_records(schema: SourceSchema, records: Vec<LogRecord>) -> Self {
        SourceData { schema, records }
    }
}

/// The structured query engine the source cache builds views with.
pub trait LogQueryEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect the head of the file and report which optional fields it contains.
    fn probe(&self, path: &Path) -> Result<SourceSchema>;

    /// Load every parseable record. Lines that are not JSON objects are skipped.
    fn materialize(&self, path: &Path, schema: &SourceSchema) -> Result<Vec<LogRecord>>;

    /// Uncached view used when a build fails.
    fn scan_lenient(&self, path: &Path) -> Result<SourceData> {
        scan_adhoc(path)
    }
}

/// Default engine: bounded head read, then one whole-file read decoded with simd-json
/// line by line.
pub struct JsonlEngine {
    max_source_bytes: u64,
}

impl JsonlEngine {
    pub fn new(max_source_bytes: u64) -> Self {
        Self { max_source_bytes }
    }
}

impl LogQueryEngine for JsonlEngine {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn probe(&self, path: &Path) -> Result<SourceSchema> {
        let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let total = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if total > self.max_source_bytes {
            bail!(
                "{} is {} bytes, above the {} byte limit for cached views",
                path.display(),
                total,
                self.max_source_bytes
            );
        }

        let mut head = Vec::with_capacity(total.min(HEAD_BYTES) as usize);
        file.take(HEAD_BYTES)
            .read_to_end(&mut head)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(SourceSchema::from_head(&head, total))
    }

    fn materialize(&self, path: &Path, schema: &SourceSchema) -> Result<Vec<LogRecord>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut records = Vec::with_capacity(schema.line_count);
        for (line_no, line) in content.lines().enumerate() {
            if let Some(record) = LogRecord::parse_line(line_no, line) {
                records.push(record);
            }
        }

        tracing::debug!(
            path = %path.display(),
            records = records.len(),
            "materialized query source"
        );
        Ok(records)
    }
}

/// Lenient line-by-line scan used when a cached view cannot be built. Unreadable lines
/// (including invalid UTF-8) are skipped rather than failing the scan.
pub fn scan_adhoc(path: &Path) -> Result<SourceData> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut bytes = 0u64;
    for (line_no, line) in reader.split(b'\n').enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        bytes += line.len() as u64 + 1;
        let Ok(text) = std::str::from_utf8(&line) else {
            continue;
        };
        if let Some(record) = LogRecord::parse_line(line_no, text) {
            records.push(record);
        }
    }

    let mut schema = SourceSchema {
        bytes,
        ..Default::default()
    };
    schema.absorb(&records);
    Ok(SourceData::from_records(schema, records))
}
