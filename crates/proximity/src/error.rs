use crate::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProximityError {
    #[error("Local identity not configured")]
    NotConfigured,

    #[error("Operation '{operation}' not valid in state '{state}'")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("No active verification session")]
    Unavailable,

    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Peer lost: {0}")]
    PeerLost(PeerId),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Ranging unavailable: {0}")]
    RangingUnavailable(String),

    #[error("Ranging timed out")]
    RangingTimeout,

    #[error("QR code expired")]
    QrExpired,

    #[error("QR decode error: {0}")]
    QrDecode(String),

    #[error("QR protocol version mismatch: expected {expected}, found {found}")]
    QrVersionMismatch { expected: u8, found: u8 },

    #[error("QR code error: {0}")]
    QrCode(String),

    #[error("Session superseded: {0}")]
    SessionSuperseded(Uuid),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("BLE error: {0}")]
    BleError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Verification service shut down")]
    ShutDown,
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::SerializationError(err.to_string())
    }
}

impl From<shared::Error> for ProximityError {
    fn from(err: shared::Error) -> Self {
        ProximityError::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProximityError>;

/// Why the state machine entered `Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorReason {
    DiscoveryTimeout,
    SessionExpired,
    PeerLost(PeerId),
    ConnectionFailed(String),
    RangingTimeout,
    RangingFailed(String),
}

impl ErrorReason {
    /// Every error state can be left through `retry()`
    pub fn is_retryable(&self) -> bool {
        true
    }

    /// Whether the QR path is a sensible suggestion for this failure
    pub fn suggests_qr(&self) -> bool {
        matches!(
            self,
            ErrorReason::DiscoveryTimeout | ErrorReason::RangingTimeout | ErrorReason::RangingFailed(_)
        )
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorReason::DiscoveryTimeout => write!(f, "discovery timed out"),
            ErrorReason::SessionExpired => write!(f, "session expired"),
            ErrorReason::PeerLost(peer) => write!(f, "peer {} lost", peer),
            ErrorReason::ConnectionFailed(reason) => write!(f, "connection failed: {}", reason),
            ErrorReason::RangingTimeout => write!(f, "ranging timed out"),
            ErrorReason::RangingFailed(reason) => write!(f, "ranging failed: {}", reason),
        }
    }
}

/// Context for error logging
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub user_id: Option<String>,
    pub peer_id: Option<PeerId>,
    pub session_id: Option<Uuid>,
    pub additional_info: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: String) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_info(mut self, info: String) -> Self {
        self.additional_info = Some(info);
        self
    }
}

impl ProximityError {
    /// Log error with structured context
    pub fn log_with_context(&self, context: &ErrorContext) {
        error!(
            error = %self,
            error_type = ?self,
            category = %self.category(),
            user_id = ?context.user_id,
            peer_id = ?context.peer_id,
            session_id = ?context.session_id,
            additional_info = ?context.additional_info,
            timestamp = %chrono::Utc::now(),
            "Proximity verification error occurred"
        );
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ProximityError::NotConfigured => {
                "Your profile is not loaded yet. Please sign in and try again.".to_string()
            }
            ProximityError::InvalidState { operation, state } => {
                format!("Cannot {} right now (currently {}).", operation.replace('_', " "), state)
            }
            ProximityError::Unavailable => {
                "No verification is in progress. Start scanning to create a code.".to_string()
            }
            ProximityError::DiscoveryUnavailable(_) => {
                "Nearby discovery isn't available on this device. Use the QR code instead.".to_string()
            }
            ProximityError::PeerNotFound(peer) => {
                format!("'{}' is no longer nearby. They may have moved out of range.", peer)
            }
            ProximityError::PeerLost(peer) => {
                format!("Lost contact with '{}'. Move closer together and try again.", peer)
            }
            ProximityError::ConnectionFailed(details) => {
                format!("Could not connect: {}. Please try again.", details)
            }
            ProximityError::RangingUnavailable(_) => {
                "Distance measurement isn't supported between these devices.".to_string()
            }
            ProximityError::RangingTimeout => {
                "Couldn't confirm you're close together. Hold the phones next to each other, retry, or use the QR code.".to_string()
            }
            ProximityError::QrExpired => {
                "This QR code has expired. Ask your friend to show a fresh one.".to_string()
            }
            ProximityError::QrDecode(_) => {
                "This doesn't look like a valid verification code. Please scan again.".to_string()
            }
            ProximityError::QrVersionMismatch { .. } => {
                "This code was made by a different app version. Both of you should update the app.".to_string()
            }
            ProximityError::QrCode(details) => {
                format!("QR code error: {}. Please try scanning again.", details)
            }
            ProximityError::SessionSuperseded(_) => {
                "This verification was replaced by a newer one.".to_string()
            }
            ProximityError::PersistenceError(_) => {
                "Verified, but saving the connection failed. Tap to try saving again.".to_string()
            }
            ProximityError::InvalidInput(details) => {
                format!("Invalid input: {}. Please check and try again.", details)
            }
            ProximityError::NetworkError(details) => {
                format!("Network error: {}. Please check your connection and try again.", details)
            }
            ProximityError::BleError(details) => {
                format!("Bluetooth error: {}. Please check your Bluetooth settings.", details)
            }
            ProximityError::SerializationError(details) => {
                format!("Data processing error: {}. Please try again.", details)
            }
            ProximityError::ShutDown => {
                "Verification has been closed. Please reopen the screen.".to_string()
            }
        }
    }

    /// Get error category for metrics and monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProximityError::NotConfigured => ErrorCategory::Configuration,
            ProximityError::InvalidState { .. } => ErrorCategory::State,
            ProximityError::Unavailable => ErrorCategory::State,
            ProximityError::DiscoveryUnavailable(_) => ErrorCategory::Capability,
            ProximityError::PeerNotFound(_) => ErrorCategory::Peer,
            ProximityError::PeerLost(_) => ErrorCategory::Peer,
            ProximityError::ConnectionFailed(_) => ErrorCategory::Network,
            ProximityError::RangingUnavailable(_) => ErrorCategory::Capability,
            ProximityError::RangingTimeout => ErrorCategory::Timeout,
            ProximityError::QrExpired => ErrorCategory::Qr,
            ProximityError::QrDecode(_) => ErrorCategory::Qr,
            ProximityError::QrVersionMismatch { .. } => ErrorCategory::Qr,
            ProximityError::QrCode(_) => ErrorCategory::Qr,
            ProximityError::SessionSuperseded(_) => ErrorCategory::State,
            ProximityError::PersistenceError(_) => ErrorCategory::Persistence,
            ProximityError::InvalidInput(_) => ErrorCategory::Validation,
            ProximityError::NetworkError(_) => ErrorCategory::Network,
            ProximityError::BleError(_) => ErrorCategory::Network,
            ProximityError::SerializationError(_) => ErrorCategory::Internal,
            ProximityError::ShutDown => ErrorCategory::Internal,
        }
    }

    /// Whether calling the same operation again can succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ProximityError::NotConfigured | ProximityError::ShutDown
        )
    }
}

/// Error categories for monitoring and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    State,
    Capability,
    Peer,
    Network,
    Timeout,
    Qr,
    Persistence,
    Validation,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::State => write!(f, "state"),
            ErrorCategory::Capability => write!(f, "capability"),
            ErrorCategory::Peer => write!(f, "peer"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Qr => write!(f, "qr"),
            ErrorCategory::Persistence => write!(f, "persistence"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}
