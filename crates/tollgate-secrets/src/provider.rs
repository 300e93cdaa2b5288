//! The provider interface every secret backend implements.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{ProviderError, Result};
use crate::reference::{ProviderReference, SecretPath};

/// A backend that resolves secret paths to plaintext values.
///
/// Providers are constructed from configuration, then `initialize`d once
/// before any secret operation. Reads of an absent secret return `Ok(None)`;
/// a provider that cannot be reached or authenticated returns an error, never
/// `None`.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Configured name of this provider instance.
    fn name(&self) -> &str;

    /// Provider type, as written in configuration (`local`, `env`, `vault`).
    fn kind(&self) -> &'static str;

    /// Connects, authenticates, or loads key material. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Reads the secret at `path`, optionally selecting one `field` of it.
    async fn get_secret(&self, path: &SecretPath, field: Option<&str>)
    -> Result<Option<SecretString>>;

    /// Reports whether the provider is currently able to serve reads.
    async fn health_check(&self) -> Result<()>;

    /// Releases credentials and connections.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    async fn set_secret(
        &self,
        _path: &SecretPath,
        _field: Option<&str>,
        _value: &SecretString,
    ) -> Result<()> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation: "writing secrets",
        })
    }

    /// Deletes the secret at `path`, returning whether it existed.
    async fn delete_secret(&self, _path: &SecretPath) -> Result<bool> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation: "deleting secrets",
        })
    }

    async fn list_secrets(&self) -> Result<Vec<SecretPath>> {
        Err(ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation: "listing secrets",
        })
    }

    /// Checks that `reference` is meaningful for this provider.
    ///
    /// The default rejects `#field` selectors.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidReference`] if the reference cannot be
    /// served by this provider.
    fn validate_reference(&self, reference: &ProviderReference) -> Result<()> {
        if reference.field().is_some() {
            return Err(ProviderError::invalid_reference(
                &reference.to_string(),
                format!("provider '{}' does not support field selectors", self.name()),
            ));
        }
        Ok(())
    }
}
