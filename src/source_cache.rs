//! Query Source Cache: one reusable, normalized view per log file.
//!
//! Building a view means reading and decoding the whole log, so views are kept and
//! reused until either the TTL runs out or the file's mtime moves. Stale views are
//! rebuilt transparently. At most one live view exists per path.
//!
//! The registry lock only guards lookups and inserts. Builds run under a per-path
//! lock, so a slow build blocks callers of that path and nobody else.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;

use crate::query::{LogQueryEngine, SourceData};
use crate::utils::{Mtime, fast_hash};

/// A normalized view over one log, bound to the mtime it was built at.
#[derive(Debug)]
pub struct QuerySource {
    /// Unique per (path, build), for log correlation
    pub name: String,
    pub path: PathBuf,
    pub created_at: Instant,
    pub mtime: Mtime,
    data: SourceData,
}

impl QuerySource {
    fn build(engine: &dyn LogQueryEngine, path: &Path, mtime: Mtime) -> Result<QuerySource> {
        let mut schema = engine.probe(path)?;
        let records = engine.materialize(path, &schema)?;
        schema.absorb(&records);
        Ok(QuerySource {
            name: format!(
                "{}_{}_{}",
                engine.name(),
                fast_hash(&path.to_string_lossy()),
                mtime.0
            ),
            path: path.to_path_buf(),
            created_at: Instant::now(),
            mtime,
            data: SourceData::from_records(schema, records),
        })
    }

    /// Uncached view built by the engine's lenient scan.
    fn adhoc(engine: &dyn LogQueryEngine, path: &Path) -> Result<QuerySource> {
        Ok(QuerySource {
            name: format!("adhoc_{}", fast_hash(&path.to_string_lossy())),
            path: path.to_path_buf(),
            created_at: Instant::now(),
            mtime: Mtime::of(path),
            data: engine.scan_lenient(path)?,
        })
    }

    fn is_fresh(&self, ttl: Duration, current: Mtime) -> bool {
        self.created_at.elapsed() < ttl && self.mtime == current
    }
}

impl Deref for QuerySource {
    type Target = SourceData;

    fn deref(&self) -> &SourceData {
        &self.data
    }
}

pub struct QuerySourceCache {
    engine: Arc<dyn LogQueryEngine>,
    ttl: Duration,
    handles: Mutex<HashMap<PathBuf, Arc<QuerySource>>>,
    /// One build lock per path with a build in flight
    building: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl QuerySourceCache {
    pub fn new(engine: Arc<dyn LogQueryEngine>, ttl: Duration) -> Self {
        Self {
            engine,
            ttl,
            handles: Mutex::new(HashMap::new()),
            building: Mutex::new(HashMap::new()),
        }
    }

    fn fresh(&self, path: &Path, current: Mtime) -> Option<Arc<QuerySource>> {
        let handles = self.handles.lock();
        let existing = handles.get(path)?;
        existing
            .is_fresh(self.ttl, current)
            .then(|| Arc::clone(existing))
    }

    /// Return the live view for `path`, building or rebuilding it when missing or stale.
    ///
    /// Concurrent callers for the same path wait for one build instead of racing to
    /// create duplicates.
    pub fn get_or_create(&self, path: &Path) -> Result<Arc<QuerySource>> {
        let current = Mtime::of(path);
        if let Some(existing) = self.fresh(path, current) {
            tracing::debug!(source = %existing.name, "query source hit");
            return Ok(existing);
        }

        let slot = Arc::clone(
            self.building
                .lock()
                .entry(path.to_path_buf())
                .or_default(),
        );
        let result = {
            let _build = slot.lock();
            self.build_locked(path, current)
        };

        // Nobody else can pick up the slot while the registry is locked.
        let mut building = self.building.lock();
        if Arc::strong_count(&slot) == 2 {
            building.remove(path);
        }
        result
    }

    /// Build under the per-path lock, unless a caller that held it first already did.
    fn build_locked(&self, path: &Path, current: Mtime) -> Result<Arc<QuerySource>> {
        if let Some(existing) = self.fresh(path, current) {
            tracing::debug!(source = %existing.name, "query source built by another caller");
            return Ok(existing);
        }
        if let Some(stale) = self.handles.lock().remove(path) {
            tracing::debug!(source = %stale.name, "query source stale, rebuilding");
        }

        let source = Arc::new(QuerySource::build(self.engine.as_ref(), path, current)?);
        tracing::debug!(
            source = %source.name,
            records = source.records.len(),
            "query source built"
        );
        self.handles
            .lock()
            .insert(path.to_path_buf(), Arc::clone(&source));
        Ok(source)
    }

    /// Run `f` over the view for `path`.
    ///
    /// When the cached view cannot be built the query still runs, over an uncached
    /// lenient scan. Only a failing fallback scan is reported as an error.
    pub fn with_source<T>(&self, path: &Path, f: impl FnOnce(&QuerySource) -> T) -> Result<T> {
        match self.get_or_create(path) {
            Ok(source) => Ok(f(&source)),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    "query source unavailable ({err:#}), falling back to ad hoc scan"
                );
                let source = QuerySource::adhoc(self.engine.as_ref(), path)?;
                Ok(f(&source))
            }
        }
    }

    /// Drop the view for `path`. Returns whether one existed.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.handles.lock().remove(path).is_some()
    }

    /// Drop views whose TTL has run out. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut handles = self.handles.lock();
        let before = handles.len();
        handles.retain(|_, source| source.created_at.elapsed() < self.ttl);
        before - handles.len()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn clear(&self) {
        self.handles.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{HEAD_BYTES, JsonlEngine, LogRecord, SourceSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use tempfile::TempDir;

    /// Counts builds and can be switched to fail.
    struct CountingEngine {
        inner: JsonlEngine,
        builds: AtomicUsize,
        fail: bool,
    }

    impl CountingEngine {
        fn new(fail: bool) -> Self {
            Self {
                inner: JsonlEngine::new(u64::MAX),
                builds: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl LogQueryEngine for CountingEngine {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn probe(&self, path: &Path) -> Result<SourceSchema> {
            if self.fail {
                anyhow::bail!("engine offline");
            }
            self.inner.probe(path)
        }

        fn materialize(&self, path: &Path, schema: &SourceSchema) -> Result<Vec<LogRecord>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.inner.materialize(path, schema)
        }
    }

    const LINE: &str = r#"{"type":"user","uuid":"u1","timestamp":"2025-01-01T00:00:00Z","message":{"role":"user","content":"hi"}}"#;

    fn write_log(dir: &TempDir, name: &str, lines: usize) -> PathBuf {
        let path = dir.path().join(name);
        let content: Vec<&str> = std::iter::repeat_n(LINE, lines).collect();
        std::fs::write(&path, content.join("\n")).unwrap();
        path
    }

    fn bump_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_reuses_view_until_mtime_changes() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.jsonl", 2);
        let engine = Arc::new(CountingEngine::new(false));
        let cache = QuerySourceCache::new(engine.clone(), Duration::from_secs(300));

        let first = cache.get_or_create(&path).unwrap();
        let second = cache.get_or_create(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        assert_eq!(first.records.len(), 2);

        std::fs::write(&path, [LINE, LINE, LINE].join("\n")).unwrap();
        bump_mtime(&path, 10);
        let third = cache.get_or_create(&path).unwrap();
        assert_eq!(engine.builds.load(Ordering::SeqCst), 2);
        assert_eq!(third.records.len(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ttl_expiry_rebuilds_and_sweeps() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.jsonl", 1);
        let engine = Arc::new(CountingEngine::new(false));
        let cache = QuerySourceCache::new(engine.clone(), Duration::ZERO);

        cache.get_or_create(&path).unwrap();
        cache.get_or_create(&path).unwrap();
        assert_eq!(engine.builds.load(Ordering::SeqCst), 2);

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_failed_build_falls_back_to_adhoc_scan() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.jsonl", 3);
        let cache = QuerySourceCache::new(Arc::new(CountingEngine::new(true)), Duration::from_secs(60));

        let count = cache.with_source(&path, |source| source.records.len()).unwrap();
        assert_eq!(count, 3);
        // nothing cached for a failed build
        assert_eq!(cache.len(), 0);

        let missing = dir.path().join("missing.jsonl");
        assert!(cache.with_source(&missing, |_| ()).is_err());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let a = write_log(&dir, "a.jsonl", 1);
        let b = write_log(&dir, "b.jsonl", 1);
        let cache = QuerySourceCache::new(Arc::new(JsonlEngine::new(u64::MAX)), Duration::from_secs(60));

        cache.get_or_create(&a).unwrap();
        cache.get_or_create(&b).unwrap();
        assert_eq!(cache.len(), 2);

        assert!(cache.invalidate(&a));
        assert!(!cache.invalidate(&a));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_concurrent_callers_share_one_view() {
        let dir = TempDir::new().unwrap();
        let path = write_log(&dir, "a.jsonl", 50);
        let engine = Arc::new(CountingEngine::new(false));
        let cache = Arc::new(QuerySourceCache::new(engine.clone(), Duration::from_secs(300)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let path = path.clone();
                std::thread::spawn(move || cache.get_or_create(&path).unwrap())
            })
            .collect();
        let views: Vec<Arc<QuerySource>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        assert!(views.iter().all(|v| Arc::ptr_eq(v, &views[0])));
    }

    /// Blocks inside `materialize` for files named `slow.jsonl` until released.
    struct GatedEngine {
        inner: JsonlEngine,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl LogQueryEngine for GatedEngine {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn probe(&self, path: &Path) -> Result<SourceSchema> {
            self.inner.probe(path)
        }

        fn materialize(&self, path: &Path, schema: &SourceSchema) -> Result<Vec<LogRecord>> {
            if path.ends_with("slow.jsonl") {
                self.entered.lock().send(()).ok();
                self.release.lock().recv().ok();
            }
            self.inner.materialize(path, schema)
        }
    }

    #[test]
    fn test_slow_build_does_not_block_other_paths() {
        let dir = TempDir::new().unwrap();
        let slow = write_log(&dir, "slow.jsonl", 1);
        let fast = write_log(&dir, "fast.jsonl", 2);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = GatedEngine {
            inner: JsonlEngine::new(u64::MAX),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let cache = Arc::new(QuerySourceCache::new(Arc::new(engine), Duration::from_secs(300)));

        let slow_caller = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.get_or_create(&slow).unwrap().records.len())
        };
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("slow build never started");

        let (done_tx, done_rx) = mpsc::channel();
        let fast_caller = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let len = cache.get_or_create(&fast).unwrap().records.len();
                done_tx.send(len).unwrap();
            })
        };
        let fast_len = done_rx.recv_timeout(Duration::from_secs(5));

        release_tx.send(()).unwrap();
        assert_eq!(slow_caller.join().unwrap(), 1);
        fast_caller.join().unwrap();
        assert_eq!(fast_len, Ok(2), "other path waited on the slow build");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_fields_past_the_head_reach_the_built_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("long.jsonl");
        let filler_lines = (HEAD_BYTES as usize / LINE.len()) + 10;
        let mut content: Vec<String> = std::iter::repeat_n(LINE.to_string(), filler_lines).collect();
        content.push(
            r#"{"type":"assistant","uuid":"a1","requestId":"req-1","timestamp":"2025-01-01T00:00:01Z","message":{"id":"m1","role":"assistant","usage":{"input_tokens":5,"output_tokens":1}}}"#
                .to_string(),
        );
        std::fs::write(&path, content.join("\n")).unwrap();

        let engine = Arc::new(JsonlEngine::new(u64::MAX));
        let head = engine.probe(&path).unwrap();
        assert!(!head.has_request_id);
        assert!(!head.has_usage);
        assert_eq!(head.bytes, std::fs::metadata(&path).unwrap().len());

        let cache = QuerySourceCache::new(engine, Duration::from_secs(300));
        let view = cache.get_or_create(&path).unwrap();
        assert!(view.schema.has_request_id);
        assert!(view.schema.has_usage);
        assert_eq!(view.schema.line_count, filler_lines + 1);
    }
}
