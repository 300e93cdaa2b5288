//! The secret store: resolves references through the registry.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use secrecy::SecretString;

use crate::error::Result;
use crate::reference::ProviderReference;
use crate::registry::ProviderRegistry;

/// Bounded exponential backoff for transient provider errors.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tollgate_secrets::RetryConfig;
///
/// let retry = RetryConfig {
///     max_retries: 4,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(1),
///     backoff_multiplier: 2.0,
///     jitter: false,
/// };
/// assert_eq!(retry.delay_for(0, None), Duration::from_millis(100));
/// assert_eq!(retry.delay_for(3, None), Duration::from_millis(800));
/// assert_eq!(retry.delay_for(5, None), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay, including provider hints.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// A provider's `retry_after` hint replaces the computed backoff; both
    /// are capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
        });
        let delay = delay.min(self.max_delay);

        if self.jitter {
            let mut byte = [0u8; 1];
            if getrandom::getrandom(&mut byte).is_ok() {
                return delay.mul_f64(0.5 + f64::from(byte[0]) / 510.0);
            }
        }
        delay
    }
}

/// Resolves secret references. Each reference is served by exactly one
/// provider; there is no fallback to another.
pub struct SecretStore {
    registry: Arc<ProviderRegistry>,
    retry: RetryConfig,
}

impl SecretStore {
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolves `reference` to its plaintext value, or `None` if it is absent.
    ///
    /// Transient provider errors are retried up to `max_retries` times.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProviderError::UnknownProvider`] for an unconfigured
    /// provider, or the provider's error once retries are exhausted or the
    /// error is not transient.
    pub async fn resolve(&self, reference: &ProviderReference) -> Result<Option<SecretString>> {
        let provider = self.registry.get(reference.provider())?;

        let mut attempt = 0;
        loop {
            match provider.get_secret(reference.path(), reference.field()).await {
                Ok(value) => {
                    debug!(
                        "Resolved {reference} ({})",
                        if value.is_some() { "found" } else { "absent" }
                    );
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, e.retry_after());
                    warn!(
                        "Transient error resolving {reference} (attempt {}/{}), retrying in {delay:?}: {e}",
                        attempt + 1,
                        self.retry.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses `raw` against the registry's default provider, then resolves it.
    ///
    /// # Errors
    ///
    /// Returns the parse error or any error from [`SecretStore::resolve`].
    pub async fn resolve_str(&self, raw: &str) -> Result<Option<SecretString>> {
        let reference = self.registry.parse_reference(raw)?;
        self.resolve(&reference).await
    }
}
