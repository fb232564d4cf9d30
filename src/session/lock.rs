//! Session Lock Tokens
//!
//! Immutable ownership credentials for a session record.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a lock identifier accepted by the backing store
pub const MAX_LOCK_ID_LEN: usize = 32;

/// Lock ownership plus acquisition time.
///
/// A token is locked iff its id is non-empty. The timestamp of a token that is
/// not locked always reads as [`DateTime::<Utc>::MIN_UTC`], so check
/// [`LockToken::is_locked`] before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    id: String,
    timestamp: DateTime<Utc>,
}

impl LockToken {
    /// The "no lock" sentinel
    pub const EMPTY: LockToken = LockToken {
        id: String::new(),
        timestamp: DateTime::<Utc>::MIN_UTC,
    };

    /// Create a token, normalizing the timestamp to UTC.
    ///
    /// Whitespace-only ids collapse to the empty id.
    pub fn new<Tz: TimeZone>(id: impl Into<String>, timestamp: DateTime<Tz>) -> Self {
        let mut id = id.into();
        if id.trim().is_empty() {
            id.clear();
        }

        Self {
            id,
            timestamp: timestamp.with_timezone(&Utc),
        }
    }

    /// Generate a token with a fresh random identifier.
    ///
    /// The id is the lowercase hex form of a random 128-bit value, so it always
    /// fits in [`MAX_LOCK_ID_LEN`].
    pub fn generate<Tz: TimeZone>(timestamp: DateTime<Tz>) -> Self {
        Self::new(Uuid::new_v4().simple().to_string(), timestamp)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_locked(&self) -> bool {
        !self.id.is_empty()
    }

    /// Acquisition time, or the minimum UTC instant when not locked
    pub fn timestamp(&self) -> DateTime<Utc> {
        if self.is_locked() {
            self.timestamp
        } else {
            DateTime::<Utc>::MIN_UTC
        }
    }

    /// How long the lock has been held as of `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        if self.is_locked() {
            now - self.timestamp
        } else {
            chrono::Duration::zero()
        }
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}
