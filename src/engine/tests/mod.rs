//! End-to-end tests of the engine over temporary project trees.


use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::{SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use super::Engine;
use crate::aggregate_cache::AggregateCache;
use crate::config::Config;
use crate::derived_cache::DerivedCaches;
use crate::discovery::DiscoveryIndex;
use crate::query::{JsonlEngine, LogQueryEngine, LogRecord, SourceData, SourceSchema};
use crate::source_cache::QuerySourceCache;

pub const PROJECT: &str = "-work-app";
pub const S1: &str = "11111111-1111-4111-8111-111111111111";
pub const S2: &str = "22222222-2222-4222-8222-222222222222";
pub const MODEL: &str = "claude-sonnet-4-20250514";

// ============================================================================
// Fake query engine
// ============================================================================

/// Delegates to the JSONL engine, counting builds. Builds and the lenient fallback
/// can each be switched to fail.
pub struct CountingEngine {
    inner: JsonlEngine,
    pub builds: AtomicUsize,
    pub fail: AtomicBool,
    pub fail_fallback: AtomicBool,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self {
            inner: JsonlEngine::new(u64::MAX),
            builds: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            fail_fallback: AtomicBool::new(false),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl LogQueryEngine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn probe(&self, path: &Path) -> Result<SourceSchema> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("query engine offline");
        }
        self.inner.probe(path)
    }

    fn materialize(&self, path: &Path, schema: &SourceSchema) -> Result<Vec<LogRecord>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.materialize(path, schema)
    }

    fn scan_lenient(&self, path: &Path) -> Result<SourceData> {
        if self.fail_fallback.load(Ordering::SeqCst) {
            anyhow::bail!("line scan failed");
        }
        self.inner.scan_lenient(path)
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub dir: TempDir,
    pub queries: Arc<CountingEngine>,
    pub engine: Engine,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("projects")).unwrap();
        let (queries, engine) = Self::build_engine(dir.path());
        Self {
            dir,
            queries,
            engine,
        }
    }

    /// A second engine over the same directory, as after a restart.
    pub fn restart(&self) -> (Arc<CountingEngine>, Engine) {
        Self::build_engine(self.dir.path())
    }

    fn build_engine(root: &Path) -> (Arc<CountingEngine>, Engine) {
        let mut config = Config::default();
        config.paths.projects_dir = root.join("projects").to_string_lossy().into_owned();
        config.paths.cache_file = root.join("cache.json").to_string_lossy().into_owned();

        let queries = Arc::new(CountingEngine::new());
        let query_engine: Arc<dyn LogQueryEngine> = queries.clone();
        let engine = Engine::new(
            config.clone(),
            Arc::new(DiscoveryIndex::new(root.join("projects"))),
            Arc::new(QuerySourceCache::new(query_engine, Duration::from_secs(300))),
            Arc::new(DerivedCaches::default()),
            Arc::new(Mutex::new(AggregateCache::load(root.join("cache.json")))),
        );
        (queries, engine)
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.dir.path().join("projects").join(project)
    }

    pub fn write_session(&self, project: &str, session_id: &str, lines: &[String]) -> PathBuf {
        let dir = self.project_dir(project);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{session_id}.jsonl"));
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    pub fn write_subagent(&self, project: &str, session_id: &str, agent_id: &str, lines: &[String]) -> PathBuf {
        let dir = self.project_dir(project).join(session_id).join("subagents");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("agent-{agent_id}.jsonl"));
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }
}

pub fn append(path: &Path, lines: &[String]) {
    use std::io::Write;
    let mut file = std::fs::File::options().append(true).open(path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    // Make sure the mtime moves even on coarse filesystems.
    file.set_modified(SystemTime::now() + Duration::from_secs(2))
        .unwrap();
}

// ============================================================================
// Log line builders
// ============================================================================

/// Seconds after a fixed base time, as an RFC 3339 string.
pub fn ts(offset: i64) -> String {
    let base = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    (base + chrono::Duration::seconds(offset)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn user(uuid: &str, at: i64, text: &str) -> String {
    format!(
        r#"{{"type":"user","uuid":"{uuid}","timestamp":"{}","sessionId":"{S1}","message":{{"role":"user","content":"{text}"}}}}"#,
        ts(at)
    )
}

pub fn assistant(uuid: &str, at: i64, msg_id: &str, input: u64, output: u64) -> String {
    format!(
        r#"{{"type":"assistant","uuid":"{uuid}","timestamp":"{}","sessionId":"{S1}","message":{{"id":"{msg_id}","role":"assistant","model":"{MODEL}","content":[{{"type":"text","text":"reply"}}],"usage":{{"input_tokens":{input},"output_tokens":{output},"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}}}}}"#,
        ts(at)
    )
}

pub fn tool_use(uuid: &str, at: i64, tool_id: &str, name: &str, input: &str) -> String {
    format!(
        r#"{{"type":"assistant","uuid":"{uuid}","timestamp":"{}","sessionId":"{S1}","message":{{"id":"msg-{uuid}","role":"assistant","model":"{MODEL}","content":[{{"type":"tool_use","id":"{tool_id}","name":"{name}","input":{input}}}],"usage":{{"input_tokens":10,"output_tokens":5}}}}}}"#,
        ts(at)
    )
}

pub fn task_result(uuid: &str, at: i64, tool_id: &str, agent_id: &str) -> String {
    format!(
        r#"{{"type":"user","uuid":"{uuid}","timestamp":"{}","sessionId":"{S1}","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"{tool_id}","content":"done"}}]}},"toolUseResult":{{"agentId":"{agent_id}","status":"completed"}}}}"#,
        ts(at)
    )
}

pub fn summary() -> String {
    r#"{"type":"summary","summary":"Work finished","leafUuid":"leaf"}"#.to_string()
}

/// `pairs` user/assistant exchanges, one second apart.
pub fn conversation(pairs: usize) -> Vec<String> {
    (0..pairs)
        .flat_map(|i| {
            let at = (i * 2) as i64;
            [
                user(&format!("u{i:03}"), at, "question"),
                assistant(&format!("a{i:03}"), at + 1, &format!("msg-{i:03}"), 100, 10),
            ]
        })
        .collect()
}
