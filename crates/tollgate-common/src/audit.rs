use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Result of a mediated request, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The request passed policy and was executed.
    Allowed,
    /// The request was refused before any secret was touched.
    Denied,
    /// The request passed policy but failed in a provider, signer, or transport.
    Error,
}

/// One line of the audit log.
///
/// Holds identifiers, timing, and verdicts only. Secret values and signed
/// request material never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct AuditRecord {
    #[builder(default = Uuid::new_v4())]
    pub request_id: Uuid,
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    #[builder(setter(into))]
    pub capability: String,
    /// Empty when the capability could not be resolved.
    #[builder(default, setter(into))]
    pub service: String,
    #[builder(setter(into))]
    pub method: String,
    /// Path as the caller supplied it, never the signed URL.
    #[builder(setter(into))]
    pub path: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub status: Option<u16>,
    #[builder(default)]
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub denial_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(into))]
    pub agent_reason: Option<String>,
}
