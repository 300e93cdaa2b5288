//! Broker configuration loading and validation.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/tollgate/config.toml`.
//!
//! ## Example Configuration
//!
//! ```toml
//! [settings]
//! default_provider = "local"
//! proxy_listen = "127.0.0.1:9119"
//! request_timeout_secs = 30
//!
//! [providers.local]
//! type = "local"
//!
//! [providers.env]
//! type = "env"
//!
//! [services.stripe]
//! base_url = "https://api.stripe.com"
//! auth = { type = "bearer", token = "local://stripe/api-key" }
//!
//! [capabilities.stripe_readonly]
//! service = "stripe"
//! ttl = "1h"
//! rules = ["allow GET /v1/*", "deny * *"]
//! ```
//!
//! When no `[providers]` table is present, a `local` and an `env` provider
//! are configured implicitly.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use tollgate_common::{AuthConfig, CapabilityConfig, ServiceConfig};
use tollgate_secrets::{ProviderConfig, ProviderRegistry, SharedEnv};

use crate::error::{BrokerError, Result};

/// Broker configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub settings: Settings,

    /// Secret providers by instance name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Third-party APIs by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Capabilities the agent may request, by name.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityConfig>,
}

/// Daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Provider used for references without a `provider://` prefix (default: local)
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Listen address of the session-bound HTTP proxy (default: 127.0.0.1:9119)
    #[serde(default = "default_proxy_listen")]
    pub proxy_listen: String,

    /// Total timeout of one upstream request in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between sweeps of expired sessions in seconds (default: 30)
    #[serde(default = "default_sweep_interval")]
    pub session_sweep_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            proxy_listen: default_proxy_listen(),
            request_timeout_secs: default_request_timeout(),
            session_sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}

fn default_proxy_listen() -> String {
    "127.0.0.1:9119".to_string()
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_sweep_interval() -> u64 {
    30
}

impl Settings {
    /// Parsed proxy listen address.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if `proxy_listen` is not `host:port`.
    pub fn proxy_addr(&self) -> Result<SocketAddr> {
        self.proxy_listen.parse().map_err(|e| {
            BrokerError::Config(format!("invalid proxy_listen '{}': {e}", self.proxy_listen))
        })
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs)
    }
}

impl BrokerConfig {
    /// Loads and statically validates the configuration at `path`.
    ///
    /// Secret references are checked later, against the provider registry,
    /// by [`BrokerConfig::validate_references`].
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist or cannot be read
    /// - Deserialization fails (unknown auth type, invalid rule, zero TTL)
    /// - Static validation fails
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BrokerError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml_str(&contents)
    }

    /// Parses and statically validates a configuration document.
    ///
    /// # Errors
    ///
    /// See [`BrokerConfig::load`].
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(contents)?;
        if config.providers.is_empty() {
            config
                .providers
                .insert("local".to_string(), ProviderConfig::new("local"));
            config
                .providers
                .insert("env".to_string(), ProviderConfig::new("env"));
        }
        config.validate()?;
        Ok(config)
    }

    /// Returns the configuration file path: `explicit`, or the XDG default.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is given and the config directory cannot
    /// be determined.
    pub fn config_path(explicit: Option<&Path>, env: &SharedEnv) -> Result<PathBuf> {
        explicit.map(Path::to_path_buf).map_or_else(
            || {
                crate::paths::default_config_path(env.as_ref()).ok_or_else(|| {
                    BrokerError::Config("Failed to determine config directory".to_string())
                })
            },
            Ok,
        )
    }

    /// Validates everything that does not need a provider.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.settings.proxy_addr()?;
        if self.settings.request_timeout_secs == 0 {
            return Err(BrokerError::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.settings.session_sweep_interval_secs == 0 {
            return Err(BrokerError::Config(
                "session_sweep_interval_secs must be positive".to_string(),
            ));
        }
        if !self.providers.contains_key(&self.settings.default_provider) {
            return Err(BrokerError::Config(format!(
                "Default provider '{}' is not configured",
                self.settings.default_provider
            )));
        }

        for (name, service) in &self.services {
            validate_service(name, service)?;
        }

        for (name, capability) in &self.capabilities {
            if !is_capability_name(name) {
                return Err(BrokerError::Config(format!(
                    "Capability name '{name}' must match [A-Za-z0-9_-]+"
                )));
            }
            if !self.services.contains_key(&capability.service) {
                return Err(BrokerError::Config(format!(
                    "Capability '{name}' references unknown service '{}'",
                    capability.service
                )));
            }
        }

        Ok(())
    }

    /// Builds the provider registry described by `[providers]`.
    ///
    /// Providers that keep files default to children of `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] for an unknown provider type or
    /// invalid provider options.
    pub fn build_registry(&self, env: &SharedEnv, data_dir: &Path) -> Result<ProviderRegistry> {
        ProviderRegistry::from_config(
            &self.providers,
            &self.settings.default_provider,
            env,
            data_dir,
        )
        .map_err(|e| BrokerError::Config(e.to_string()))
    }

    /// Checks every secret reference against `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] naming the service and field of the
    /// first malformed or unroutable reference.
    pub fn validate_references(&self, registry: &ProviderRegistry) -> Result<()> {
        for (name, service) in &self.services {
            for (field, reference) in service.auth.secret_references() {
                registry.parse_reference(reference).map_err(|e| {
                    BrokerError::Config(format!("Service '{name}' field '{field}': {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// Looks up a capability and the service it grants.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CapabilityNotFound`] if the capability is not
    /// configured.
    pub fn capability(&self, name: &str) -> Result<(&CapabilityConfig, &ServiceConfig)> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| BrokerError::CapabilityNotFound(name.to_string()))?;
        let service = self.services.get(&capability.service).ok_or_else(|| {
            BrokerError::Internal(format!(
                "capability '{name}' references missing service '{}'",
                capability.service
            ))
        })?;
        Ok((capability, service))
    }

    /// Names of capabilities whose grant differs between `self` and `next`.
    ///
    /// A capability differs if it was removed, or if its own settings or its
    /// service's settings changed.
    #[must_use]
    pub fn changed_capabilities(&self, next: &Self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter(|(name, old)| {
                next.capabilities.get(*name).is_none_or(|new| {
                    new != *old || self.services.get(&old.service) != next.services.get(&new.service)
                })
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn validate_service(name: &str, service: &ServiceConfig) -> Result<()> {
    let url = url::Url::parse(&service.base_url).map_err(|e| {
        BrokerError::Config(format!("Service '{name}' has invalid base_url '{}': {e}", service.base_url))
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(BrokerError::Config(format!(
            "Service '{name}' base_url must be an http(s) URL with a host"
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(BrokerError::Config(format!(
            "Service '{name}' base_url must not carry a query or fragment"
        )));
    }

    if let AuthConfig::Headers { headers } = &service.auth {
        if headers.is_empty() {
            return Err(BrokerError::Config(format!(
                "Service '{name}' uses header auth with no headers"
            )));
        }
        for header in headers.keys() {
            if HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(BrokerError::Config(format!(
                    "Service '{name}' has invalid header name '{header}'"
                )));
            }
        }
    }
    Ok(())
}

/// Capability names appear in proxy URLs, so they are restricted to one
/// unreserved path segment.
fn is_capability_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
