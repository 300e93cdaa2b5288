//! Error types for the tollgate daemon.

use thiserror::Error;
use tollgate_client::{ClientError, SigningError};
use tollgate_common::BrokerResponse;
use tollgate_secrets::ProviderError;

/// Errors that can occur in the daemon.
///
/// `Display` is for operator logs. Anything returned to an agent goes through
/// [`BrokerError::sanitized_message`] instead.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// I/O error (file operations, socket communication).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error, detected at load or reload.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was refused by policy.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No capability with this name is configured.
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    /// No active session with this id exists.
    #[error("Session not found")]
    SessionNotFound,

    /// The request shape is malformed or unsafe.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The capability requires a reason and none was given.
    #[error("Capability '{0}' requires a reason")]
    ReasonRequired(String),

    /// A secret provider failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A referenced secret does not exist.
    #[error("Secret '{0}' not found")]
    SecretNotFound(String),

    /// The request could not be signed.
    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    /// The upstream API could not be reached.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The upstream API did not answer in time.
    #[error("Upstream request timed out")]
    Timeout,

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using `BrokerError`.
pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<ClientError> for BrokerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::TimeoutError => Self::Timeout,
            ClientError::Signing(e) => Self::Signing(e),
            ClientError::ConfigurationError(message) => Self::Config(message),
            ClientError::InvalidRequest(message) => Self::InvalidRequest(message),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl BrokerError {
    /// Stable machine-readable category, used in structured responses.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "forbidden",
            Self::CapabilityNotFound(_) | Self::SessionNotFound | Self::SecretNotFound(_) => {
                "not_found"
            }
            Self::InvalidRequest(_) | Self::Json(_) => "invalid_request",
            Self::ReasonRequired(_) => "reason_required",
            Self::Config(_) | Self::Toml(_) => "config",
            Self::Provider(_) => "provider",
            Self::Signing(_) => "signing",
            Self::Upstream(_) => "upstream",
            Self::Timeout => "timeout",
            Self::Io(_) | Self::Internal(_) => "internal",
        }
    }

    /// Message safe to return to an agent.
    ///
    /// Provider and transport details stay in the operator log; the agent
    /// learns only the category and the identifiers it already supplied.
    #[must_use]
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Forbidden(reason) => format!("Request denied: {reason}"),
            Self::CapabilityNotFound(name) => format!("Unknown capability '{name}'"),
            Self::SessionNotFound => "Session not found or expired".to_string(),
            Self::InvalidRequest(reason) => format!("Invalid request: {reason}"),
            Self::Json(_) => "Invalid request: malformed JSON arguments".to_string(),
            Self::ReasonRequired(name) => {
                format!("Capability '{name}' requires a reason for each request")
            }
            Self::SecretNotFound(_) => "A credential for this service is not configured".to_string(),
            Self::Provider(e) if e.is_transient() => {
                "The secret backend is temporarily unavailable".to_string()
            }
            Self::Provider(_) => "The secret backend failed to provide a credential".to_string(),
            Self::Signing(_) => "The request could not be signed for this service".to_string(),
            Self::Config(_) | Self::Toml(_) => "Broker configuration error".to_string(),
            Self::Upstream(_) => "The upstream service could not be reached".to_string(),
            Self::Timeout => "The upstream service did not respond in time".to_string(),
            Self::Io(_) | Self::Internal(_) => "Internal broker error".to_string(),
        }
    }
}

impl From<BrokerError> for BrokerResponse {
    fn from(err: BrokerError) -> Self {
        Self::Error {
            id: None,
            kind: err.kind().to_string(),
            message: err.sanitized_message(),
        }
    }
}
