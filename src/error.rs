//! Error taxonomy at the engine boundary.
//!
//! Internal plumbing uses `anyhow`; callers of [`crate::engine::Engine`] get an
//! [`EngineError`] so a route layer can map bad input and per-resource failures to the
//! right response without string matching.

use std::path::PathBuf;

use thiserror::Error;

/// Why a pagination cursor was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor is not valid base64")]
    Encoding,
    #[error("cursor payload is not valid UTF-8")]
    Utf8,
    #[error("cursor ends after {0} part(s)")]
    PartCount(usize),
    #[error("cursor timestamp `{0}` is not a valid RFC 3339 timestamp")]
    Timestamp(String),
    #[error("cursor scope `{0}` is malformed")]
    Scope(String),
    #[error("cursor was issued for a different filter set")]
    ScopeMismatch,
    #[error("cursor has an empty message id")]
    EmptyId,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed caller input; the only error a well-formed request can never produce.
    #[error("bad request: {0}")]
    BadRequest(#[from] CursorError),

    #[error("bad request: {0}")]
    InvalidRange(String),

    #[error("project `{0}` not found")]
    ProjectNotFound(String),

    #[error("session `{session_id}` not found in project `{project_id}`")]
    SessionNotFound {
        project_id: String,
        session_id: String,
    },

    #[error("subagent `{agent_id}` not found in project `{project_id}`")]
    SubagentNotFound {
        project_id: String,
        agent_id: String,
    },

    /// A derived computation failed for one resource; nothing was cached.
    #[error("query failed for {}: {message}", path.display())]
    Query { path: PathBuf, message: String },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn query(path: impl Into<PathBuf>, err: &anyhow::Error) -> Self {
        EngineError::Query {
            path: path.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, EngineError::BadRequest(_) | EngineError::InvalidRange(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ProjectNotFound(_)
                | EngineError::SessionNotFound { .. }
                | EngineError::SubagentNotFound { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
