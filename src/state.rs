//! Live session bookkeeping.

use crate::error::RegistryError;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Produces unique session identifiers.
pub trait SessionIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// `YYYYMMDDHHMMSSmmm` in UTC, bumped by one millisecond whenever the clock
/// has not moved since the previous id.
#[derive(Debug, Default)]
pub struct TimestampIdGenerator {
    last_millis: Mutex<i64>,
}

impl TimestampIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn format(millis: i64) -> String {
        match Utc.timestamp_millis_opt(millis).single() {
            Some(at) => at.format("%Y%m%d%H%M%S%3f").to_string(),
            None => format!("{:017}", millis),
        }
    }
}

impl SessionIdGenerator for TimestampIdGenerator {
    fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = match self.last_millis.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let millis = now.max(*last + 1);
        *last = millis;
        Self::format(millis)
    }
}

/// Deterministic ids for tests and embedding: `prefix` plus a zero-padded counter.
#[derive(Debug)]
pub struct CounterIdGenerator {
    prefix: String,
    next: Mutex<u64>,
}

impl CounterIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: Mutex::new(0),
        }
    }
}

impl SessionIdGenerator for CounterIdGenerator {
    fn next_id(&self) -> String {
        let mut next = match self.next.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = format!("{}{:06}", self.prefix, *next);
        *next += 1;
        id
    }
}

/// A session as the registry sees it.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub sandbox: String,
    pub profile: Option<String>,
    /// Concurrent-session limit of the profile; 0 means unlimited.
    pub max_sessions: usize,
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub created_at: Instant,
}

/// Read-only view served by the admin endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub sandbox: String,
    pub profile: Option<String>,
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub age_secs: u64,
}

/// Table of live sessions. Every operation takes the same lock, so it is the
/// single answer to "is this sandbox in use right now".
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    ids: Box<dyn SessionIdGenerator>,
}

impl SessionRegistry {
    pub fn new(ids: Box<dyn SessionIdGenerator>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ids,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    /// Register a session, enforcing its profile's concurrency limit.
    /// Returns how many sessions of that profile are now live.
    pub fn admit(&self, record: SessionRecord) -> Result<usize, RegistryError> {
        let mut table = self.table();
        let running = table
            .values()
            .filter(|s| s.profile.is_some() && s.profile == record.profile)
            .count();

        if let Some(profile) = &record.profile {
            if record.max_sessions > 0 && running >= record.max_sessions {
                return Err(RegistryError::Capacity {
                    profile: profile.clone(),
                    limit: record.max_sessions,
                });
            }
        }

        table.insert(record.id.clone(), record);
        Ok(running + 1)
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        self.table().remove(id)
    }

    pub fn is_sandbox_active(&self, sandbox: &str) -> bool {
        self.table().values().any(|s| s.sandbox == sandbox)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions ordered by id.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .table()
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                sandbox: s.sandbox.clone(),
                profile: s.profile.clone(),
                user: s.user.clone(),
                uid: s.uid,
                gid: s.gid,
                age_secs: s.created_at.elapsed().as_secs(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(Box::new(TimestampIdGenerator::new()))
    }
}
