//! # tollgate-secrets
//!
//! Resolves secret references to plaintext values through pluggable providers.
//!
//! A reference names a provider and a path, `provider://path#field`, or just a
//! path that resolves against the default provider. The [`ProviderRegistry`]
//! maps provider names to [`SecretProvider`] implementations built from
//! configuration, and the [`SecretStore`] routes each lookup to exactly one of
//! them, retrying transient failures with bounded backoff.
//!
//! Built-in providers:
//! - [`providers::local`]: AES-256-GCM encrypted files under a private directory
//! - [`providers::env`]: process environment variables
//! - [`providers::vault`]: HashiCorp Vault / OpenBao KV v2
//!
//! ## Example
//!
//! ```
//! use tollgate_secrets::ProviderReference;
//!
//! let reference = ProviderReference::parse("vault://exchanges/bybit#secret", "local").unwrap();
//! assert_eq!(reference.provider(), "vault");
//! assert_eq!(reference.path().as_str(), "exchanges/bybit");
//! assert_eq!(reference.field(), Some("secret"));
//!
//! let bare = ProviderReference::parse("stripe/api-key", "local").unwrap();
//! assert_eq!(bare.to_string(), "local://stripe/api-key");
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod provider;
pub mod providers;
pub mod reference;
pub mod registry;
pub mod store;

pub use config::ProviderConfig;
pub use env::{MapEnv, ReadEnv, SharedEnv, SystemEnv};
pub use error::{ProviderError, Result};
pub use provider::SecretProvider;
pub use reference::{ProviderReference, SecretPath};
pub use registry::ProviderRegistry;
pub use store::{RetryConfig, SecretStore};
