use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest string any identity field may carry (QR strings are `u8` length-prefixed)
pub const MAX_FIELD_LEN: usize = 255;

// Identity models
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Check that every field fits the wire format
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::Validation("user_id cannot be empty".to_string()));
        }
        if self.display_name.is_empty() {
            return Err(Error::Validation("display_name cannot be empty".to_string()));
        }

        let fields = [
            ("user_id", Some(&self.user_id)),
            ("display_name", Some(&self.display_name)),
            ("avatar_ref", self.avatar_ref.as_ref()),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                if value.len() > MAX_FIELD_LEN {
                    return Err(Error::Validation(format!(
                        "{} exceeds {} bytes ({} bytes)",
                        name,
                        MAX_FIELD_LEN,
                        value.len()
                    )));
                }
            }
        }

        Ok(())
    }
}

/// How co-presence was attested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMethod {
    WirelessRanging,
    WirelessNoRanging,
    Qr,
}

impl std::fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMethod::WirelessRanging => write!(f, "wireless-ranging"),
            VerificationMethod::WirelessNoRanging => write!(f, "wireless-no-ranging"),
            VerificationMethod::Qr => write!(f, "qr"),
        }
    }
}

// Connection models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub session_id: Uuid,
    pub local_user_id: String,
    pub peer: Identity,
    pub method: VerificationMethod,
    pub distance_meters: Option<f64>,
    pub verified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
