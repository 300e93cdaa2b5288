//! In-memory session table.
//!
//! Every operation takes the table lock once and never holds it across I/O.
//! Expiry is checked on every access, so a session stops working at the
//! instant it expires; the periodic sweep only reclaims memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tollgate_common::{Session, Ttl};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{BrokerError, Result};

/// Prefix of every session id.
pub const SESSION_ID_PREFIX: &str = "tg_sess_";

/// Random bytes per session id.
const SESSION_ID_BYTES: usize = 32;

/// Attempts at drawing an id that does not collide with a live one.
const MAX_ID_ATTEMPTS: usize = 4;

/// Creates, looks up, and revokes sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|e| BrokerError::Internal(format!("Session lock poisoned: {e}")))
    }

    /// Creates a session for `capability` that expires `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS random source fails or the expiry time
    /// overflows.
    pub fn create(
        &self,
        capability: &str,
        service: &str,
        ttl: Ttl,
        reason: Option<String>,
    ) -> Result<Session> {
        let created_at = self.clock.now();
        let expires_at = expiry(created_at, ttl)?;

        let mut sessions = self.table()?;
        let session = insert_new(&mut sessions, capability, service, created_at, expires_at, reason)?;
        drop(sessions);

        log_created(&session);
        Ok(session)
    }

    /// Returns an active session for the same capability and reason, or
    /// creates one that expires `ttl` from now.
    ///
    /// Lookup and insertion happen under one lock, so concurrent callers
    /// with the same capability and reason share a single session.
    ///
    /// # Errors
    ///
    /// As [`SessionManager::create`].
    pub fn find_or_create(
        &self,
        capability: &str,
        service: &str,
        ttl: Ttl,
        reason: Option<String>,
    ) -> Result<Session> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;

        let mut sessions = self.table()?;
        if let Some(existing) = reusable(&sessions, now, capability, reason.as_deref()) {
            return Ok(existing);
        }
        let session = insert_new(&mut sessions, capability, service, now, expires_at, reason)?;
        drop(sessions);

        log_created(&session);
        Ok(session)
    }

    /// Returns the session if it exists, is unrevoked, and has not expired.
    ///
    /// A stale record found here is removed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionNotFound`] for a missing, expired, or
    /// revoked session.
    pub fn get(&self, id: &str) -> Result<Session> {
        let now = self.clock.now();
        let mut sessions = self.table()?;
        match sessions.get(id) {
            Some(session) if session.is_active_at(now) => Ok(session.clone()),
            Some(_) => {
                sessions.remove(id);
                Err(BrokerError::SessionNotFound)
            }
            None => Err(BrokerError::SessionNotFound),
        }
    }

    /// Revokes and removes a session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionNotFound`] if no active session has this
    /// id, including one already revoked.
    pub fn revoke(&self, id: &str) -> Result<Session> {
        let now = self.clock.now();
        let mut session = self
            .table()?
            .remove(id)
            .filter(|session| session.is_active_at(now))
            .ok_or(BrokerError::SessionNotFound)?;
        session.revoked = true;
        debug!(session = %session.display_id(), "Session revoked");
        Ok(session)
    }

    /// Returns every active session, sweeping stale ones.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session table is poisoned.
    pub fn list(&self) -> Result<Vec<Session>> {
        let now = self.clock.now();
        let mut sessions = self.table()?;
        sessions.retain(|_, session| session.is_active_at(now));
        Ok(sessions.values().cloned().collect())
    }

    /// Finds an active session for the same capability and reason.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session table is poisoned.
    pub fn find_reusable(&self, capability: &str, reason: Option<&str>) -> Result<Option<Session>> {
        let now = self.clock.now();
        Ok(reusable(&*self.table()?, now, capability, reason))
    }

    /// Revokes every session of `capability`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session table is poisoned.
    pub fn revoke_capability(&self, capability: &str) -> Result<usize> {
        let mut sessions = self.table()?;
        let before = sessions.len();
        sessions.retain(|_, session| session.capability != capability);
        Ok(before - sessions.len())
    }

    /// Removes expired and revoked sessions, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session table is poisoned.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut sessions = self.table()?;
        let before = sessions.len();
        sessions.retain(|_, session| session.is_active_at(now));
        Ok(before - sessions.len())
    }

    /// Number of sessions that are currently usable.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session table is poisoned.
    pub fn active_count(&self) -> Result<usize> {
        let now = self.clock.now();
        Ok(self
            .table()?
            .values()
            .filter(|session| session.is_active_at(now))
            .count())
    }
}

fn expiry(created_at: DateTime<Utc>, ttl: Ttl) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl.as_duration())
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .ok_or_else(|| BrokerError::Config(format!("TTL {ttl} is out of range")))
}

/// Longest-lived active session for `capability` with exactly `reason`.
fn reusable(
    sessions: &HashMap<String, Session>,
    now: DateTime<Utc>,
    capability: &str,
    reason: Option<&str>,
) -> Option<Session> {
    sessions
        .values()
        .filter(|s| s.is_active_at(now))
        .filter(|s| s.capability == capability && s.reason.as_deref() == reason)
        .max_by_key(|s| s.expires_at)
        .cloned()
}

fn insert_new(
    sessions: &mut HashMap<String, Session>,
    capability: &str,
    service: &str,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    reason: Option<String>,
) -> Result<Session> {
    let mut id = generate_id()?;
    let mut attempts = 1;
    while sessions.contains_key(&id) {
        if attempts >= MAX_ID_ATTEMPTS {
            return Err(BrokerError::Internal("Failed to draw a unique session id".to_string()));
        }
        id = generate_id()?;
        attempts += 1;
    }

    let session = Session {
        id: id.clone(),
        capability: capability.to_string(),
        service: service.to_string(),
        created_at,
        expires_at,
        reason,
        revoked: false,
    };
    sessions.insert(id, session.clone());
    Ok(session)
}

fn log_created(session: &Session) {
    debug!(
        session = %session.display_id(),
        capability = %session.capability,
        expires_at = %session.expires_at,
        "Session created"
    );
}

fn generate_id() -> Result<String> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| BrokerError::Internal(format!("OS random source failed: {e}")))?;
    Ok(format!("{SESSION_ID_PREFIX}{}", hex::encode(bytes)))
}
