//! Error types for secret resolution.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by secret providers and the secret store.
///
/// An absent secret is not an error: lookups return `Ok(None)`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// A secret operation was attempted before `initialize` succeeded.
    #[error("Provider '{0}' is not initialized")]
    NotInitialized(String),

    /// The reference string could not be parsed.
    #[error("Invalid secret reference '{reference}': {reason}")]
    InvalidReference {
        /// The reference as written.
        reference: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The path contained traversal sequences or forbidden characters.
    #[error("Invalid secret path: {0}")]
    InvalidPath(String),

    /// The reference names a provider that is not configured.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider rejected our credentials, or its key material is unusable.
    ///
    /// Not retryable.
    #[error("Authentication with provider '{provider}' failed: {message}")]
    AuthFailed { provider: String, message: String },

    /// The provider could not be reached or reported itself unhealthy.
    #[error("Provider '{provider}' unavailable: {message}")]
    Unavailable { provider: String, message: String },

    /// The provider asked us to slow down.
    #[error("Provider '{provider}' rate limited: {retry_after:?}")]
    RateLimited {
        provider: String,
        /// Suggested wait before retrying, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// The provider does not implement the requested operation.
    #[error("Provider '{provider}' does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    /// Anything else: malformed responses, corrupt files, local I/O failures.
    #[error("Provider '{provider}' internal error: {message}")]
    Internal { provider: String, message: String },
}

impl ProviderError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable { .. })
    }

    /// Returns the retry delay suggested by the provider, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns true for errors caused by configuration rather than runtime state.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidReference { .. } | Self::InvalidPath(_) | Self::UnknownProvider(_)
        )
    }

    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(provider: &str, message: impl Into<String>) -> Self {
        Self::Internal {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(provider: &str, message: impl Into<String>) -> Self {
        Self::AuthFailed {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(provider: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias using `ProviderError`.
pub type Result<T> = std::result::Result<T, ProviderError>;
