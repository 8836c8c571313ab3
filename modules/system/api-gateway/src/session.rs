//! Process-wide session store: subject id -> last verified bearer token.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use secrecy::SecretString;

/// Last token seen for a subject.
#[derive(Debug, Clone)]
pub struct Session {
    pub subject_id: String,
    pub bearer_token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Concurrent map of sessions, keyed by subject id.
///
/// Entries are whole records, overwritten atomically (last write wins). There is
/// no background sweep: expiry is checked on read by [`SessionStore::get_active`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    #[must_use]
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
        }
    }

    /// Record `token` as the subject's current session, expiring one TTL after `now`.
    pub fn upsert(&self, subject_id: &str, token: SecretString, now: DateTime<Utc>) -> Session {
        let session = Session {
            subject_id: subject_id.to_owned(),
            bearer_token: token,
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.sessions
            .insert(subject_id.to_owned(), session.clone());
        tracing::trace!(subject_id = %subject_id, expires_at = %session.expires_at, "Session stored");
        session
    }

    /// Stored session regardless of expiry.
    #[must_use]
    pub fn get(&self, subject_id: &str) -> Option<Session> {
        self.sessions.get(subject_id).map(|e| e.value().clone())
    }

    /// Stored session, only if it has not expired at `now`.
    #[must_use]
    pub fn get_active(&self, subject_id: &str, now: DateTime<Utc>) -> Option<Session> {
        self.get(subject_id).filter(|s| s.is_active_at(now))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
