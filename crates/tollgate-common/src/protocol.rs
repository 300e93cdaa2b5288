//! Payloads exchanged with the agent.
//!
//! Tool arguments and results are JSON. The broker socket wraps them in
//! line-delimited [`BrokerRequest`] / [`BrokerResponse`] envelopes.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Arguments of the `execute` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub capability: String,
    pub method: String,
    /// Path relative to the service base URL, optionally with a query string.
    pub path: String,
    /// Request body. A JSON value that is not a string is sent serialized.
    #[serde(default, deserialize_with = "body_as_string")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn body_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(body)) => Some(body),
        Some(other) => Some(other.to_string()),
    })
}

/// Result of a successful `execute`, with the upstream status passed through.
///
/// The body keeps the exact upstream bytes. In JSON it is a string: the body
/// itself when it is UTF-8, otherwise base64 with `"bodyEncoding": "base64"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ExecuteResult", try_from = "ExecuteResult")]
pub struct ExecuteResponse {
    pub status: u16,
    /// Response headers; not part of the JSON form.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ExecuteResponse {
    /// The body as text, if it is valid UTF-8.
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// How a body that is not UTF-8 is carried in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Base64,
}

/// JSON form of [`ExecuteResponse`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResult {
    status: u16,
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_encoding: Option<BodyEncoding>,
}

impl From<ExecuteResponse> for ExecuteResult {
    fn from(response: ExecuteResponse) -> Self {
        match String::from_utf8(response.body) {
            Ok(body) => Self {
                status: response.status,
                body,
                body_encoding: None,
            },
            Err(e) => Self {
                status: response.status,
                body: STANDARD.encode(e.into_bytes()),
                body_encoding: Some(BodyEncoding::Base64),
            },
        }
    }
}

impl TryFrom<ExecuteResult> for ExecuteResponse {
    type Error = base64::DecodeError;

    fn try_from(result: ExecuteResult) -> Result<Self, Self::Error> {
        let body = match result.body_encoding {
            Some(BodyEncoding::Base64) => STANDARD.decode(result.body)?,
            None => result.body.into_bytes(),
        };
        Ok(Self {
            status: result.status,
            headers: Vec::new(),
            body,
        })
    }
}

/// One entry of the `list_services` tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySummary {
    pub name: String,
    pub service: String,
    pub ttl: String,
    pub auto_approve: bool,
    pub requires_reason: bool,
}

/// Session-bound proxy credential returned by `get_http_access`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAccess {
    /// Proxy URL for the capability; append the upstream path to it.
    pub url: String,
    /// Headers to send with each proxied request.
    pub headers: BTreeMap<String, String>,
    pub expires: DateTime<Utc>,
}

/// Name, description, and JSON schema of one agent tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Request envelope read from the broker socket, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerRequest {
    ListTools,
    CallTool {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    Health,
}

/// Response envelope written to the broker socket, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerResponse {
    Tools {
        tools: Vec<ToolDefinition>,
    },
    ToolResult {
        id: String,
        result: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        kind: String,
        message: String,
    },
    Health {
        status: String,
        providers: BTreeMap<String, String>,
        active_sessions: usize,
    },
}
