//! # tollgate-daemon
//!
//! Local credential broker that lets an AI agent call third-party HTTP APIs
//! without ever holding their credentials.
//!
//! The agent asks for a *capability* by name. The broker checks the request
//! against the capability's rules, opens or reuses a time-bounded *session*,
//! resolves the service's secrets through the configured providers, signs the
//! request, sends it upstream, scrubs the response of any secret value, and
//! writes one audit record.
//!
//! ## Surfaces
//!
//! - [`server`]: line-delimited JSON tool protocol on a Unix socket
//! - [`proxy`]: session-bound HTTP proxy for ordinary HTTP clients
//!
//! Both delegate to the [`dispatcher::Dispatcher`].
//!
//! ## Layout
//!
//! ```text
//! tools / proxy
//!      │
//!      ▼
//! Dispatcher ──► SessionManager
//!      │    ──► SecretStore ──► providers (local, env, vault)
//!      │    ──► signer + UpstreamClient
//!      ▼
//! AuditSink (daily JSON-lines files)
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod paths;
pub mod proxy;
pub mod server;
pub mod session;
pub mod tools;

pub use error::{BrokerError, Result};
