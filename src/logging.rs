//! Logging setup.
//!
//! The filter comes from `SESSION_TRACER_LOG`, then `RUST_LOG`, then the configured
//! level. Set `SESSION_TRACER_LOG_FILE=/path/to/file` to append log lines to a file
//! instead of stderr (useful when diagnosing lock contention in `watch` mode).

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "SESSION_TRACER_LOG";
pub const LOG_FILE_ENV: &str = "SESSION_TRACER_LOG_FILE";

/// Install the global subscriber. Call once at startup.
pub fn init(default_level: &str) -> Result<()> {
    let directive = resolve_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        default_level,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match std::env::var(LOG_FILE_ENV) {
        Ok(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            builder
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        Err(_) => builder.with_writer(std::io::stderr).try_init(),
    };

    installed.map_err(|e| anyhow!("Failed to install log subscriber: {e}"))
}

/// Pick the first non-blank filter directive.
fn resolve_directive(explicit: Option<String>, rust_log: Option<String>, default: &str) -> String {
    explicit
        .into_iter()
        .chain(rust_log)
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_directive_wins() {
        let directive = resolve_directive(
            Some("session_tracer=debug".into()),
            Some("info".into()),
            "warn",
        );
        assert_eq!(directive, "session_tracer=debug");
    }

    #[test]
    fn test_rust_log_used_when_explicit_blank() {
        let directive = resolve_directive(Some("  ".into()), Some("info".into()), "warn");
        assert_eq!(directive, "info");
    }

    #[test]
    fn test_default_level_when_nothing_set() {
        assert_eq!(resolve_directive(None, None, "error"), "error");
    }
}
