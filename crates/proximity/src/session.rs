// Verification session - the single unit of work owned by the state machine

use crate::Transport;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::Identity;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub session_id: Uuid,
    pub local_identity: Identity,
    /// Populated once the peer side resolves (wireless hello or QR decode)
    pub remote_identity: Option<Identity>,
    pub transport: Transport,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationSession {
    /// Start a fresh session with a random id
    pub fn new(local_identity: Identity, transport: Transport, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            local_identity,
            remote_identity: None,
            transport,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before `expires_at`, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }

    pub fn resolve_remote(&mut self, remote: Identity, transport: Transport) {
        self.remote_identity = Some(remote);
        self.transport = transport;
    }
}
