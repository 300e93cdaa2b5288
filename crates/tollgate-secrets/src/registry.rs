//! Provider registry: name → provider instance, built from configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::env::SharedEnv;
use crate::error::{ProviderError, Result};
use crate::provider::SecretProvider;
use crate::providers::{EnvProvider, LocalProvider, VaultProvider};
use crate::reference::{ProviderReference, is_provider_name};

/// Everything a constructor may use to build a provider.
pub struct ProviderContext<'a> {
    /// Configured instance name (`[providers.<name>]`).
    pub name: &'a str,
    pub config: &'a ProviderConfig,
    pub env: &'a SharedEnv,
    /// Base data directory; providers that keep files default to a child of it.
    pub data_dir: &'a Path,
}

/// Builds a provider from its configuration.
pub type Constructor = fn(&ProviderContext<'_>) -> Result<Arc<dyn SecretProvider>>;

/// Constructors for the built-in provider types, keyed by `type`.
#[must_use]
pub fn builtin_constructors() -> BTreeMap<&'static str, Constructor> {
    let mut table: BTreeMap<&'static str, Constructor> = BTreeMap::new();
    table.insert("local", LocalProvider::construct);
    table.insert("env", EnvProvider::construct);
    table.insert("vault", VaultProvider::construct);
    table
}

/// Owns every configured provider and routes references to them.
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn SecretProvider>>,
    default_provider: String,
}

impl ProviderRegistry {
    /// Creates an empty registry. Bare references resolve to `default_provider`.
    #[must_use]
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Builds a registry from configuration using the built-in constructors.
    ///
    /// # Errors
    ///
    /// Fails on an unknown provider type, invalid options, an invalid provider
    /// name, or a default provider that is not configured.
    pub fn from_config(
        configs: &BTreeMap<String, ProviderConfig>,
        default_provider: &str,
        env: &SharedEnv,
        data_dir: &Path,
    ) -> Result<Self> {
        Self::from_config_with(&builtin_constructors(), configs, default_provider, env, data_dir)
    }

    /// Builds a registry from configuration with a caller-supplied constructor table.
    ///
    /// # Errors
    ///
    /// See [`ProviderRegistry::from_config`].
    pub fn from_config_with(
        constructors: &BTreeMap<&'static str, Constructor>,
        configs: &BTreeMap<String, ProviderConfig>,
        default_provider: &str,
        env: &SharedEnv,
        data_dir: &Path,
    ) -> Result<Self> {
        let mut registry = Self::new(default_provider);

        for (name, config) in configs {
            if !is_provider_name(name) {
                return Err(ProviderError::invalid_reference(
                    name,
                    "provider names must match [a-z0-9_-]+",
                ));
            }
            let constructor = constructors.get(config.kind.as_str()).ok_or_else(|| {
                ProviderError::UnknownProvider(format!(
                    "'{name}' has unknown type '{}' (known: {})",
                    config.kind,
                    constructors.keys().copied().collect::<Vec<_>>().join(", ")
                ))
            })?;

            let provider = constructor(&ProviderContext {
                name,
                config,
                env,
                data_dir,
            })?;
            debug!("Constructed {} provider '{name}'", provider.kind());
            registry.providers.insert(name.clone(), provider);
        }

        if !registry.providers.contains_key(default_provider) {
            return Err(ProviderError::UnknownProvider(format!(
                "default provider '{default_provider}' is not configured"
            )));
        }
        Ok(registry)
    }

    /// Adds a provider under its own name, replacing any existing one.
    pub fn insert(&mut self, provider: Arc<dyn SecretProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    #[must_use]
    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Looks up a provider by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] if no provider has that name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn SecretProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Parses `raw` and checks that a configured provider can serve it.
    ///
    /// # Errors
    ///
    /// Returns the parse error, [`ProviderError::UnknownProvider`], or the
    /// provider's own validation error.
    pub fn parse_reference(&self, raw: &str) -> Result<ProviderReference> {
        let reference = ProviderReference::parse(raw, &self.default_provider)?;
        self.get(reference.provider())?.validate_reference(&reference)?;
        Ok(reference)
    }

    /// Initializes every provider, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first provider's initialization error.
    pub async fn initialize_all(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            provider.initialize().await?;
            info!("Provider '{name}' ({}) ready", provider.kind());
        }
        Ok(())
    }

    /// Runs every provider's health check.
    pub async fn health(&self) -> BTreeMap<String, Result<()>> {
        let mut report = BTreeMap::new();
        for (name, provider) in &self.providers {
            report.insert(name.clone(), provider.health_check().await);
        }
        report
    }

    /// Disposes every provider. Failures are logged, not returned.
    pub async fn dispose_all(&self) {
        for (name, provider) in &self.providers {
            if let Err(e) = provider.dispose().await {
                warn!("Failed to dispose provider '{name}': {e}");
            }
        }
    }
}
