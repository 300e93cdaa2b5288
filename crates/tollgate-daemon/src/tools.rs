//! Agent-facing tools.
//!
//! Each tool is a [`ToolImplementation`] with a JSON schema and an async
//! `execute`. The [`ToolRegistry`] holds them by name and is shared by the
//! socket server; every tool delegates to the [`Dispatcher`].
//!
//! | Tool | Arguments | Result |
//! |------|-----------|--------|
//! | `list_services` | none | `[{name, service, ttl, autoApprove, requiresReason}]` |
//! | `execute` | `{capability, method, path, body?, headers?, reason?}` | `{status, body, bodyEncoding?}` |
//! | `get_http_access` | `{capability, reason?}` | `{url, headers, expires}` |
//! | `revoke_http_access` | `{session_id}` | `{revoked}` |

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tollgate_common::{ExecuteRequest, ToolDefinition};

use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, Result};

#[async_trait]
pub trait ToolImplementation: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: &Value) -> Result<Value>;
}

/// Parses tool arguments, treating `null` as an empty object.
fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|e| BrokerError::InvalidRequest(format!("invalid arguments: {e}")))
}

pub struct ListServicesTool {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl ToolImplementation for ListServicesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_services".to_string(),
            description: "List the capabilities you may use, with the service each grants access to, \
                          its session lifetime, and whether a reason is required."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
            }),
        }
    }

    async fn execute(&self, _args: &Value) -> Result<Value> {
        Ok(serde_json::to_value(self.dispatcher.list_services()?)?)
    }
}

pub struct ExecuteTool {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl ToolImplementation for ExecuteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "execute".to_string(),
            description: "Call a third-party API through a capability. Credentials are added by \
                          the broker; the upstream status and body are returned as-is."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "capability": {
                        "type": "string",
                        "description": "Capability name from list_services"
                    },
                    "method": {
                        "type": "string",
                        "description": "HTTP method, e.g. GET or POST"
                    },
                    "path": {
                        "type": "string",
                        "description": "Path below the service base URL, with optional query string"
                    },
                    "body": {
                        "description": "Request body; objects are sent as JSON"
                    },
                    "headers": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Extra request headers"
                    },
                    "reason": {
                        "type": "string",
                        "description": "Why this request is needed; recorded in the audit log"
                    }
                },
                "required": ["capability", "method", "path"],
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let request: ExecuteRequest = parse_args(args)?;
        let response = self.dispatcher.execute(request).await?;
        Ok(serde_json::to_value(response)?)
    }
}

#[derive(Debug, Deserialize)]
struct HttpAccessArgs {
    capability: String,
    #[serde(default)]
    reason: Option<String>,
}

pub struct GetHttpAccessTool {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl ToolImplementation for GetHttpAccessTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_http_access".to_string(),
            description: "Get a proxy URL and session header for a capability, for use with \
                          ordinary HTTP clients. The header is a session token, not the service \
                          credential, and expires with the capability's TTL."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "capability": {
                        "type": "string",
                        "description": "Capability name from list_services"
                    },
                    "reason": {
                        "type": "string",
                        "description": "Why access is needed; recorded in the audit log"
                    }
                },
                "required": ["capability"],
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let args: HttpAccessArgs = parse_args(args)?;
        let access = self.dispatcher.get_http_access(&args.capability, args.reason)?;
        Ok(serde_json::to_value(access)?)
    }
}

#[derive(Debug, Deserialize)]
struct RevokeArgs {
    session_id: String,
}

pub struct RevokeHttpAccessTool {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl ToolImplementation for RevokeHttpAccessTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "revoke_http_access".to_string(),
            description: "Revoke a session issued by get_http_access before it expires.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {
                        "type": "string",
                        "description": "Session token from the Authorization header, without 'Bearer '"
                    }
                },
                "required": ["session_id"],
            }),
        }
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let args: RevokeArgs = parse_args(args)?;
        let session_id = args.session_id.strip_prefix("Bearer ").unwrap_or(&args.session_id);
        self.dispatcher.revoke_session(session_id)?;
        Ok(json!({ "revoked": true }))
    }
}

/// Tools by name.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn ToolImplementation>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Registry holding every broker tool, bound to `dispatcher`.
    #[must_use]
    pub fn with_broker_tools(dispatcher: &Arc<Dispatcher>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ListServicesTool {
            dispatcher: Arc::clone(dispatcher),
        }));
        registry.register(Arc::new(ExecuteTool {
            dispatcher: Arc::clone(dispatcher),
        }));
        registry.register(Arc::new(GetHttpAccessTool {
            dispatcher: Arc::clone(dispatcher),
        }));
        registry.register(Arc::new(RevokeHttpAccessTool {
            dispatcher: Arc::clone(dispatcher),
        }));
        registry
    }

    pub fn register(&self, tool: Arc<dyn ToolImplementation>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolImplementation>> {
        self.tools.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Every tool definition, ordered by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self.tools.iter().map(|t| t.definition()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Runs the tool `name` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidRequest`] for an unknown tool or
    /// malformed arguments, otherwise whatever the tool returns.
    pub async fn call(&self, name: &str, args: &Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| BrokerError::InvalidRequest(format!("Unknown tool '{name}'")))?;
        tool.execute(args).await
    }
}
