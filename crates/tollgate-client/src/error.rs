//! Error types for signing and sending upstream requests.

use thiserror::Error;

/// Errors produced while signing a request.
///
/// These indicate a malformed auth descriptor or credential and are treated
/// as configuration errors. Messages never contain credential values.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SigningError {
    /// A required credential resolved to an empty string.
    #[error("Credential '{0}' is empty")]
    EmptyCredential(&'static str),

    /// The HMAC key could not be used.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// A header name or value is not valid HTTP. Only the name is reported.
    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    /// The service base URL could not be parsed.
    #[error("Invalid base URL '{0}'")]
    InvalidBaseUrl(String),
}

/// Errors that can occur when sending a request to a third-party API.
///
/// Non-2xx responses are not errors; they are returned to the caller as-is.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Network or HTTP transport failure.
    ///
    /// DNS resolution, connection refused, TLS failures, broken connections.
    #[error("Network error: {0}")]
    NetworkError(#[source] reqwest::Error),

    /// The request did not complete within the configured timeout.
    #[error("Timeout error")]
    TimeoutError,

    /// Client configuration issue, such as a client that failed to build.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The response body exceeded the configured size cap.
    #[error("Response body exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    /// The request could not be built (bad URL, method, or header).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signing failed before anything was sent.
    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        // The URL may carry a signed query string; keep it out of messages
        let err = err.without_url();
        if err.is_timeout() {
            Self::TimeoutError
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::NetworkError(err)
        }
    }
}

impl ClientError {
    /// Check if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError)
    }

    /// Check if the failure happened in transport, after the request was built.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::TimeoutError)
    }
}
