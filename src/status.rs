use std::time::Duration;

use crate::query::{SourceData, ops};
use crate::types::SessionStatus;
use crate::utils::Mtime;

/// A log written to within this window is still being worked on.
pub const RUNNING_WINDOW: Duration = Duration::from_secs(60);
/// After this long without writes an unfinished session is no longer considered idle.
pub const IDLE_WINDOW: Duration = Duration::from_secs(300);

/// Infer a session's lifecycle state from its content and last write time.
pub fn determine_status(has_summary: bool, last_interrupted: bool, mtime: Mtime) -> SessionStatus {
    if has_summary {
        return SessionStatus::Completed;
    }
    if last_interrupted {
        return SessionStatus::Interrupted;
    }

    match mtime.age() {
        _ if mtime.is_missing() => SessionStatus::Unknown,
        // Clock skew can put the mtime slightly in the future.
        None => SessionStatus::Running,
        Some(age) if age < RUNNING_WINDOW => SessionStatus::Running,
        Some(age) if age < IDLE_WINDOW => SessionStatus::Idle,
        Some(_) => SessionStatus::Unknown,
    }
}

pub fn status_of(data: &SourceData, mtime: Mtime) -> SessionStatus {
    determine_status(
        ops::has_summary(data),
        ops::last_content_interrupted(data),
        mtime,
    )
}
