//! # tollgate-common
//!
//! Shared data model for the tollgate credential broker.
//!
//! This crate holds the types every other tollgate crate agrees on:
//! - Service, authentication, and capability configuration
//! - Access rules and the pure rule evaluator
//! - Session and audit records
//! - Payloads exchanged with the agent over the tool protocol
//!
//! ## Example
//!
//! ```
//! use tollgate_common::policy::{evaluate, Rule};
//!
//! let rules: Vec<Rule> = ["allow GET *", "deny POST *"]
//!     .iter()
//!     .map(|r| r.parse().unwrap())
//!     .collect();
//!
//! assert!(evaluate(&rules, false, "GET", "/x").allowed);
//! assert!(!evaluate(&rules, false, "POST", "/x").allowed);
//! ```

/// Audit record written for every mediated request.
pub mod audit;
/// Service, authentication, and capability configuration.
pub mod config;
/// Access rules and rule evaluation.
pub mod policy;
/// Agent-facing request and response payloads.
pub mod protocol;
pub mod session;

pub use audit::{AuditRecord, Outcome};
pub use config::{AuthConfig, CapabilityConfig, ServiceConfig, Ttl, TtlError};
pub use policy::{Decision, Effect, MethodPattern, PathPattern, Rule, RuleError};
pub use protocol::{
    BodyEncoding, BrokerRequest, BrokerResponse, CapabilitySummary, ExecuteRequest, ExecuteResponse,
    HttpAccess, ToolDefinition,
};
pub use session::Session;
