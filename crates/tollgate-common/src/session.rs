//! Session records.
//!
//! A session is a time-bounded, revocable grant of one capability. Only the
//! `revoked` flag ever changes after creation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Characters of a session id shown in logs and debug output.
const VISIBLE_ID_PREFIX: usize = 16;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unguessable bearer token identifying the session.
    pub id: String,
    pub capability: String,
    pub service: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Reason the agent gave when the session was requested.
    pub reason: Option<String>,
    pub revoked: bool,
}

impl Session {
    /// True if the session is unrevoked and `now` is strictly before expiry.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }

    /// Shortened id that is safe to log.
    #[must_use]
    pub fn display_id(&self) -> String {
        let visible: String = self.id.chars().take(VISIBLE_ID_PREFIX).collect();
        format!("{visible}…")
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.display_id())
            .field("capability", &self.capability)
            .field("service", &self.service)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("reason", &self.reason)
            .field("revoked", &self.revoked)
            .finish()
    }
}
