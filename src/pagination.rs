//! Cursor and offset pagination over ordered message lists.
//!
//! [`encode`] and [`decode`] are the positional codec: base64url (no padding) over
//! `"<rfc3339 timestamp>|<id>"`. A [`Cursor`] prefixes the id with a fingerprint of the
//! filter set it was issued under, so a cursor from one filtered listing cannot silently
//! skip rows of another. Tokens are opaque to callers either way.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Utc};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::CursorError;
use crate::query::LogRecord;
use crate::types::MessageView;

/// Filters accepted by message listings. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MessageFilter {
    /// `user` or `assistant`
    pub message_type: Option<String>,
    pub model: Option<String>,
    pub tool: Option<String>,
}

impl MessageFilter {
    pub fn is_empty(&self) -> bool {
        self.message_type.is_none() && self.model.is_none() && self.tool.is_none()
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(message_type) = &self.message_type
            && record.kind.as_str() != message_type
        {
            return false;
        }
        if let Some(model) = &self.model
            && record.model.as_deref() != Some(model.as_str())
        {
            return false;
        }
        if let Some(tool) = &self.tool
            && !record.tool_calls.iter().any(|call| &call.name == tool)
        {
            return false;
        }
        true
    }

    /// Stable fingerprint of the filter set.
    pub fn scope(&self) -> u64 {
        let canonical = format!(
            "type={}\u{1f}model={}\u{1f}tool={}",
            self.message_type.as_deref().unwrap_or(""),
            self.model.as_deref().unwrap_or(""),
            self.tool.as_deref().unwrap_or("")
        );
        xxh3_64(canonical.as_bytes())
    }
}

/// A position in an ordered listing: everything strictly after `(timestamp, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
    pub scope: u64,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, id: impl Into<String>, filter: &MessageFilter) -> Self {
        Cursor {
            timestamp,
            id: id.into(),
            scope: filter.scope(),
        }
    }

    pub fn encode(&self) -> String {
        encode(self.timestamp, &format!("{:016x}|{}", self.scope, self.id))
    }

    pub fn decode(token: &str) -> Result<Cursor, CursorError> {
        let (timestamp, rest) = decode(token)?;

        // The id goes last so ids containing `|` survive.
        let Some((scope, id)) = rest.split_once('|') else {
            return Err(CursorError::PartCount(2));
        };
        if scope.len() != 16 {
            return Err(CursorError::Scope(scope.to_string()));
        }
        let scope =
            u64::from_str_radix(scope, 16).map_err(|_| CursorError::Scope(scope.to_string()))?;
        if id.is_empty() {
            return Err(CursorError::EmptyId);
        }

        Ok(Cursor {
            timestamp,
            id: id.to_string(),
            scope,
        })
    }

    /// Reject cursors issued under a different filter set.
    pub fn check_scope(&self, filter: &MessageFilter) -> Result<(), CursorError> {
        if self.scope == filter.scope() {
            Ok(())
        } else {
            Err(CursorError::ScopeMismatch)
        }
    }

    fn key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }
}

/// Positional token for `(timestamp, id)`: base64url over `"<rfc3339>|<id>"`.
pub fn encode(timestamp: DateTime<Utc>, id: &str) -> String {
    let raw = format!(
        "{}|{id}",
        timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    );
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Inverse of [`encode`]. Everything after the first `|` is the id.
pub fn decode(token: &str) -> Result<(DateTime<Utc>, String), CursorError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| CursorError::Encoding)?;
    let raw = String::from_utf8(bytes).map_err(|_| CursorError::Utf8)?;

    let Some((timestamp, id)) = raw.split_once('|') else {
        return Err(CursorError::PartCount(1));
    };
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| CursorError::Timestamp(timestamp.to_string()))?
        .with_timezone(&Utc);
    if id.is_empty() {
        return Err(CursorError::EmptyId);
    }
    Ok((timestamp, id.to_string()))
}

/// Rows that can be addressed by a cursor.
pub trait PageKey {
    fn page_key(&self) -> (DateTime<Utc>, &str);
}

impl PageKey for MessageView {
    fn page_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.uuid.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetPage<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

/// How a caller asked to page through a listing.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub cursor: Option<String>,
    /// Offset mode when set; pages start at 1
    pub page: Option<usize>,
    pub per_page: Option<usize>,
    pub filter: MessageFilter,
}

/// Keyset pagination over rows already sorted by `(timestamp, id)`.
///
/// Fetches `limit + 1` rows after the cursor to learn whether another page exists
/// without counting the rest.
pub fn paginate_after<T: PageKey>(
    rows: Vec<T>,
    after: Option<&Cursor>,
    limit: usize,
    filter: &MessageFilter,
) -> CursorPage<T> {
    let limit = limit.max(1);
    let start = match after {
        Some(cursor) => rows.partition_point(|row| row.page_key() <= cursor.key()),
        None => 0,
    };

    let mut items: Vec<T> = rows.into_iter().skip(start).take(limit + 1).collect();
    let has_more = items.len() > limit;
    items.truncate(limit);

    let next_cursor = if has_more {
        items.last().map(|row| {
            let (timestamp, id) = row.page_key();
            Cursor::new(timestamp, id, filter)
        })
    } else {
        None
    };

    CursorPage {
        items,
        has_more,
        next_cursor,
    }
}

/// Classic page-number pagination. Page numbers below 1 are treated as 1.
pub fn paginate_offset<T>(rows: Vec<T>, page: usize, per_page: usize) -> OffsetPage<T> {
    let page = page.max(1);
    let per_page = per_page.max(1);
    let total = rows.len();

    let items = rows
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .collect();

    OffsetPage {
        items,
        total,
        page,
        per_page,
        total_pages: total.div_ceil(per_page),
    }
}
