//! Change-feed cursor tracking for incremental sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque position in a mailbox's change feed (Gmail historyId)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryCursor(pub String);

impl HistoryCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this cursor is strictly behind `other`.
    ///
    /// Gmail history ids are decimal integers; when both sides parse they are
    /// compared numerically. Unparseable cursors are never considered behind,
    /// so an opaque value always replaces the stored one.
    pub fn is_behind(&self, other: &HistoryCursor) -> bool {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a < b,
            _ => false,
        }
    }
}

impl std::fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last processed cursor for one project
///
/// Persisted in the project's grant metadata; read once at the start of a
/// cycle and written once at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub cursor: HistoryCursor,
    /// When the cursor was last written
    pub last_sync_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(cursor: HistoryCursor) -> Self {
        Self {
            cursor,
            last_sync_at: Utc::now(),
        }
    }

    /// Advance to `next`, never moving backwards.
    ///
    /// Returns the state to persist. The timestamp is refreshed even when the
    /// cursor itself is kept.
    pub fn advanced(mut self, next: &HistoryCursor) -> Self {
        if !next.is_behind(&self.cursor) {
            self.cursor = next.clone();
        }
        self.last_sync_at = Utc::now();
        self
    }
}
