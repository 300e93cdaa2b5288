//! Outbound HTTP client for signed requests.
//!
//! Requests are sent once. Upstream calls may not be idempotent, so nothing
//! here retries; a timeout or transport failure is returned to the caller.

use std::time::Duration;

use log::debug;
use reqwest::{Client, Method, Request};
use secrecy::{ExposeSecret, SecretString};

use crate::error::ClientError;
use crate::signer::OutboundRequest;

/// Default connection timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default total request timeout (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on a response body (10 MB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Replacement text for secret values found in responses.
pub const REDACTED: &str = "[REDACTED]";

/// Response headers never returned to the agent.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "set-cookie",
];

/// HTTP client for third-party APIs.
///
/// Cheaply cloneable; clones share the connection pool.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Client,
    connect_timeout: Duration,
    timeout: Duration,
    max_response_bytes: usize,
}

impl UpstreamClient {
    /// Creates a client with the default connect timeout and `timeout` as the
    /// total request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigurationError`] if the underlying client
    /// fails to build.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, timeout)
    }

    /// Creates a client with explicit connect and total timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigurationError`] if the underlying client
    /// fails to build.
    pub fn with_timeouts(connect_timeout: Duration, timeout: Duration) -> Result<Self, ClientError> {
        let inner = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ClientError::ConfigurationError(e.to_string()))?;

        Ok(Self {
            inner,
            connect_timeout,
            timeout,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        })
    }

    /// Sets the largest response body accepted before the call fails.
    #[must_use]
    pub const fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn max_response_bytes(&self) -> usize {
        self.max_response_bytes
    }

    /// Sends a signed request and reads the whole response.
    ///
    /// Every HTTP status, including 4xx and 5xx, is returned as a response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TimeoutError`] if the request times out,
    /// [`ClientError::NetworkError`] for other transport failures,
    /// [`ClientError::ResponseTooLarge`] if the body exceeds the cap, and
    /// [`ClientError::InvalidRequest`] if the request cannot be built.
    pub async fn execute(&self, request: &OutboundRequest) -> Result<UpstreamResponse, ClientError> {
        let built = self.build_request(request)?;
        debug!("Sending {} {}", built.method(), built.url().path());

        let mut response = self.inner.execute(built).await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let limit = self.max_response_bytes;
        let too_large = || ClientError::ResponseTooLarge { limit };
        if response
            .content_length()
            .is_some_and(|length| u64::try_from(limit).is_ok_and(|limit| length > limit))
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Upstream responded with status {status}, {} byte(s)", body.len());
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Builds the `reqwest` request.
    ///
    /// Sets `Content-Type: application/json` only when a body is present and
    /// the caller did not supply a content type.
    fn build_request(&self, request: &OutboundRequest) -> Result<Request, ClientError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ClientError::InvalidRequest(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.inner.request(method, request.url());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            if request.header("content-type").is_none() {
                builder = builder.header("Content-Type", "application/json");
            }
            builder = builder.body(body.clone());
        }

        Ok(builder.build()?)
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("max_response_bytes", &self.max_response_bytes)
            .finish_non_exhaustive()
    }
}

/// A complete upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Body bytes exactly as received.
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    /// Removes secret values and connection-scoped headers.
    ///
    /// Every occurrence of a non-empty secret in the body or in a header
    /// value becomes `[REDACTED]`. Hop-by-hop and `set-cookie` headers are
    /// dropped.
    #[must_use]
    pub fn redact(mut self, secrets: &[&SecretString]) -> Self {
        self.headers.retain(|(name, _)| {
            !STRIPPED_RESPONSE_HEADERS
                .iter()
                .any(|stripped| name.eq_ignore_ascii_case(stripped))
        });

        // Longest first so a secret containing another is replaced whole
        let mut values: Vec<&str> = secrets
            .iter()
            .map(|s| s.expose_secret())
            .filter(|s| !s.is_empty())
            .collect();
        values.sort_by_key(|s| std::cmp::Reverse(s.len()));

        for value in values {
            if let Some(replaced) = replace_bytes(&self.body, value.as_bytes(), REDACTED.as_bytes()) {
                self.body = replaced;
            }
            for (_, header) in &mut self.headers {
                if header.contains(value) {
                    *header = header.replace(value, REDACTED);
                }
            }
        }
        self
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// The body as text, if it is valid UTF-8.
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Replaces every occurrence of `needle` in `haystack`; `None` if there is none.
fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut found = false;
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
            found = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    found.then_some(out)
}
