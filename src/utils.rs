use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use xxhash_rust::xxh3::xxh3_64;

static WARNED_MESSAGES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

pub fn warn_once(message: impl Into<String>) {
    let message = message.into();
    let cache = WARNED_MESSAGES.get_or_init(|| Mutex::new(HashSet::new()));

    if let Ok(mut warned) = cache.lock()
        && warned.insert(message.clone())
    {
        tracing::warn!("{message}");
    }
}

/// Fast non-cryptographic hash rendered as 16 hex chars.
pub fn fast_hash(text: &str) -> String {
    format!("{:016x}", xxh3_64(text.as_bytes()))
}

/// File modification time in nanoseconds since the Unix epoch.
///
/// Used as the cheap change signal for every cache tier. A file that cannot be
/// stat'ed reports [`Mtime::MISSING`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Mtime(pub i64);

impl Mtime {
    pub const MISSING: Mtime = Mtime(0);

    /// Sample the current modification time of `path`.
    pub fn of(path: &Path) -> Mtime {
        std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(Mtime::from_system_time)
            .unwrap_or(Mtime::MISSING)
    }

    pub fn from_system_time(time: SystemTime) -> Mtime {
        match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Mtime(i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)),
            Err(before_epoch) => Mtime(
                -i64::try_from(before_epoch.duration().as_nanos()).unwrap_or(i64::MAX),
            ),
        }
    }

    pub fn is_missing(self) -> bool {
        self == Mtime::MISSING
    }

    /// Time elapsed since this mtime, `None` when the mtime lies in the future.
    pub fn age(self) -> Option<Duration> {
        let now = Mtime::from_system_time(SystemTime::now());
        u64::try_from(now.0 - self.0).ok().map(Duration::from_nanos)
    }
}

/// Parse a transcript timestamp into UTC.
///
/// Accepts RFC 3339 (including the `Z` suffix) and naive ISO timestamps, which are
/// taken to be UTC already.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Custom serde deserializer for optional timestamp strings; unparseable values become `None`.
pub fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().and_then(parse_timestamp))
}

pub fn is_valid_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Line count the way an editor would report it: empty text has no lines.
pub fn count_lines(text: &str) -> u64 {
    if text.is_empty() {
        0
    } else {
        text.matches('\n').count() as u64 + 1
    }
}

#[cfg(test)]
mod tests;
