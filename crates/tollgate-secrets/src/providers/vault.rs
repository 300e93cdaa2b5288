//! HashiCorp Vault (and OpenBao) KV v2 provider.
//!
//! Reference path → Vault path mapping:
//! ```text
//! vault://exchanges/bybit#secret  →  GET {address}/v1/{mount}/data/exchanges/bybit, field "secret"
//! vault://stripe/api-key          →  GET {address}/v1/{mount}/data/stripe/api-key, field "value"
//! ```
//!
//! AppRole tokens are renewed by logging in again once less than a third of
//! the lease (and never less than five seconds) remains. If renewal fails the
//! old token is discarded and reads fail with `AuthFailed` until a later login
//! succeeds.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::{ProviderError, Result};
use crate::provider::SecretProvider;
use crate::reference::{ProviderReference, SecretPath};
use crate::registry::ProviderContext;

/// Field read when a reference has no `#field` selector.
pub const DEFAULT_FIELD: &str = "value";

const MIN_RENEW_MARGIN: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT_SECS: u64 = 10;

fn default_mount() -> String {
    "secret".to_string()
}

fn default_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

fn default_approle_mount() -> String {
    "approle".to_string()
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VaultOptions {
    address: String,
    #[serde(default = "default_mount")]
    mount: String,
    #[serde(default)]
    namespace: Option<String>,
    auth: AuthOptions,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
enum AuthOptions {
    Token {
        #[serde(default = "default_token_env")]
        token_env: String,
    },
    Approle {
        role_id_env: String,
        secret_id_env: String,
        #[serde(default = "default_approle_mount")]
        mount: String,
    },
}

/// How the provider authenticates with Vault.
pub enum VaultAuth {
    /// Static token. Never renewed; a 403 is final.
    Token(SecretString),
    /// AppRole login at `/v1/auth/{mount}/login`.
    AppRole {
        mount: String,
        role_id: SecretString,
        secret_id: SecretString,
    },
}

#[derive(Default)]
struct TokenState {
    initialized: bool,
    token: Option<SecretString>,
    lease: Option<Duration>,
    obtained_at: Option<Instant>,
}

impl TokenState {
    fn needs_renewal(&self) -> bool {
        match (self.lease, self.obtained_at) {
            (Some(lease), Some(obtained_at)) => {
                let remaining = lease.saturating_sub(obtained_at.elapsed());
                remaining < (lease / 3).max(MIN_RENEW_MARGIN)
            }
            _ => false,
        }
    }

    fn store(&mut self, token: SecretString, lease: Option<Duration>) {
        self.token = Some(token);
        self.lease = lease;
        self.obtained_at = Some(Instant::now());
    }

    fn clear(&mut self) {
        self.token = None;
        self.lease = None;
        self.obtained_at = None;
    }
}

/// Failure of a single Vault HTTP exchange, before classification.
enum RequestError {
    Status {
        status: StatusCode,
        errors: Vec<String>,
        retry_after: Option<Duration>,
    },
    Transport(reqwest::Error),
    Malformed(String),
}

/// Provider backed by a Vault KV v2 mount.
pub struct VaultProvider {
    name: String,
    client: Client,
    address: String,
    mount: String,
    namespace: Option<String>,
    auth: VaultAuth,
    state: Mutex<TokenState>,
}

impl VaultProvider {
    /// Creates a provider. No network call is made until `initialize`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Internal`] if the HTTP client cannot be built.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        mount: impl Into<String>,
        auth: VaultAuth,
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProviderError::internal(&name, format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            name,
            client,
            address: address.into().trim_end_matches('/').to_string(),
            mount: mount.into().trim_matches('/').to_string(),
            namespace: None,
            auth,
            state: Mutex::new(TokenState::default()),
        })
    }

    /// Sends `X-Vault-Namespace` with every request.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub(crate) fn construct(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SecretProvider>> {
        let options: VaultOptions = ctx.config.parse_options(ctx.name)?;

        let read = |var: &str| {
            ctx.env.var(var).map(SecretString::from).map_err(|_| {
                ProviderError::auth_failed(ctx.name, format!("environment variable {var} is not set"))
            })
        };
        let auth = match options.auth {
            AuthOptions::Token { token_env } => VaultAuth::Token(read(&token_env)?),
            AuthOptions::Approle {
                role_id_env,
                secret_id_env,
                mount,
            } => VaultAuth::AppRole {
                mount,
                role_id: read(&role_id_env)?,
                secret_id: read(&secret_id_env)?,
            },
        };

        let mut provider = Self::new(
            ctx.name,
            options.address,
            options.mount,
            auth,
            Duration::from_secs(options.timeout_secs),
        )?;
        provider.namespace = options.namespace;
        Ok(Arc::new(provider))
    }

    fn data_url(&self, path: &SecretPath) -> String {
        format!("{}/v1/{}/data/{path}", self.address, self.mount)
    }

    fn metadata_url(&self, path: &str) -> String {
        format!("{}/v1/{}/metadata/{path}", self.address, self.mount)
    }

    // ── Authentication ────────────────────────────────────────────────────────

    async fn login(&self) -> Result<(SecretString, Option<Duration>)> {
        let (mount, role_id, secret_id) = match &self.auth {
            VaultAuth::Token(token) => return Ok((token.clone(), None)),
            VaultAuth::AppRole {
                mount,
                role_id,
                secret_id,
            } => (mount, role_id, secret_id),
        };

        let url = format!("{}/v1/auth/{mount}/login", self.address);
        let body = json!({
            "role_id": role_id.expose_secret(),
            "secret_id": secret_id.expose_secret(),
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.classify(RequestError::Transport(e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = self.classify(status_error(response).await);
            return Err(match error {
                ProviderError::Unavailable { .. } | ProviderError::RateLimited { .. } => error,
                _ => ProviderError::auth_failed(
                    &self.name,
                    format!("approle login rejected ({status})"),
                ),
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| self.classify(RequestError::Transport(e)))?;
        let token = json
            .pointer("/auth/client_token")
            .and_then(Value::as_str)
            .map(|t| SecretString::from(t.to_string()))
            .ok_or_else(|| {
                ProviderError::auth_failed(&self.name, "missing client_token in approle login response")
            })?;
        let lease = json
            .pointer("/auth/lease_duration")
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        debug!("Vault provider '{}' logged in, lease {lease:?}", self.name);
        Ok((token, lease))
    }

    /// Current token, renewing it first when the lease is nearly spent.
    async fn token(&self) -> Result<SecretString> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            return Err(ProviderError::NotInitialized(self.name.clone()));
        }
        if let Some(token) = &state.token
            && !state.needs_renewal()
        {
            return Ok(token.clone());
        }

        state.clear();
        match self.login().await {
            Ok((token, lease)) => {
                state.store(token.clone(), lease);
                Ok(token)
            }
            Err(e) => {
                warn!("Vault provider '{}' failed to renew its token: {e}", self.name);
                Err(ProviderError::auth_failed(
                    &self.name,
                    format!("token renewal failed: {e}"),
                ))
            }
        }
    }

    async fn reauthenticate(&self) -> Result<SecretString> {
        let mut state = self.state.lock().await;
        state.clear();
        let (token, lease) = self.login().await?;
        state.store(token.clone(), lease);
        Ok(token)
    }

    /// Runs `f` with the current token. On a 403 with AppRole auth, logs in
    /// again once and retries.
    async fn with_reauth<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn(SecretString) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, RequestError>> + Send,
        T: Send,
    {
        let first = f(self.token().await?).await;

        let should_retry = matches!(
            &first,
            Err(RequestError::Status { status, .. }) if *status == StatusCode::FORBIDDEN
        ) && matches!(self.auth, VaultAuth::AppRole { .. });

        let result = if should_retry {
            debug!("Vault provider '{}' got 403, logging in again", self.name);
            f(self.reauthenticate().await?).await
        } else {
            first
        };
        result.map_err(|e| self.classify(e))
    }

    // ── HTTP ──────────────────────────────────────────────────────────────────

    /// Sends an authenticated request. 2xx and 404 responses are returned.
    async fn send(
        &self,
        method: Method,
        url: &str,
        token: SecretString,
        body: Option<&Value>,
    ) -> std::result::Result<reqwest::Response, RequestError> {
        let mut request = self
            .client
            .request(method, url)
            .header("X-Vault-Token", token.expose_secret());
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(RequestError::Transport)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(response)
        } else {
            Err(status_error(response).await)
        }
    }

    fn classify(&self, error: RequestError) -> ProviderError {
        match error {
            RequestError::Status {
                status,
                errors,
                retry_after,
            } => {
                let detail = if errors.is_empty() {
                    status.to_string()
                } else {
                    format!("{status}: {}", errors.join(", "))
                };
                match status.as_u16() {
                    401 | 403 => ProviderError::auth_failed(&self.name, detail),
                    429 => ProviderError::RateLimited {
                        provider: self.name.clone(),
                        retry_after,
                    },
                    500..=599 => ProviderError::unavailable(&self.name, detail),
                    _ => ProviderError::internal(&self.name, format!("unexpected response {detail}")),
                }
            }
            RequestError::Transport(e) if e.is_decode() => {
                ProviderError::internal(&self.name, format!("malformed response: {e}"))
            }
            RequestError::Transport(e) => ProviderError::unavailable(&self.name, e.to_string()),
            RequestError::Malformed(message) => ProviderError::internal(&self.name, message),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let url = self.metadata_url(prefix);
        let url = &url;
        let list = Method::from_bytes(b"LIST")
            .map_err(|e| ProviderError::internal(&self.name, e.to_string()))?;
        let list = &list;

        self.with_reauth(|token| async move {
            let response = self.send(list.clone(), url, token, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let json: Value = response.json().await.map_err(RequestError::Transport)?;
            let keys = json
                .pointer("/data/keys")
                .and_then(Value::as_array)
                .ok_or_else(|| RequestError::Malformed("missing .data.keys in list response".to_string()))?;
            Ok::<_, RequestError>(
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect(),
            )
        })
        .await
    }
}

async fn status_error(response: reqwest::Response) -> RequestError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let errors = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|v| {
            v.get("errors")?.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str().map(String::from))
                    .collect()
            })
        })
        .unwrap_or_default();

    RequestError::Status {
        status,
        errors,
        retry_after,
    }
}

#[async_trait]
impl SecretProvider for VaultProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "vault"
    }

    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized && state.token.is_some() {
            return Ok(());
        }
        let (token, lease) = self.login().await?;
        state.store(token, lease);
        state.initialized = true;
        debug!("Initialized vault provider '{}' at {}", self.name, self.address);
        Ok(())
    }

    async fn get_secret(
        &self,
        path: &SecretPath,
        field: Option<&str>,
    ) -> Result<Option<SecretString>> {
        let url = self.data_url(path);
        let url = &url;

        let document: Option<Value> = self
            .with_reauth(|token| async move {
                let response = self.send(Method::GET, url, token, None).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                response.json().await.map(Some).map_err(RequestError::Transport)
            })
            .await?;

        let Some(document) = document else {
            debug!("Secret '{path}' not found in vault provider '{}'", self.name);
            return Ok(None);
        };
        let data = document
            .pointer("/data/data")
            .and_then(Value::as_object)
            .ok_or_else(|| ProviderError::internal(&self.name, "missing .data.data in Vault response"))?;

        let field = field.unwrap_or(DEFAULT_FIELD);
        match data.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(SecretString::from(value.clone()))),
            Some(_) => Err(ProviderError::internal(
                &self.name,
                format!("field '{field}' of '{path}' is not a string"),
            )),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/v1/sys/health", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.classify(RequestError::Transport(e)))?;

        // 429 and 472/473 are healthy standbys
        match response.status().as_u16() {
            200 | 429 | 472 | 473 => Ok(()),
            501 => Err(ProviderError::unavailable(&self.name, "vault is not initialized")),
            503 => Err(ProviderError::unavailable(&self.name, "vault is sealed")),
            other => Err(ProviderError::unavailable(
                &self.name,
                format!("unexpected health status {other}"),
            )),
        }
    }

    async fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(self.auth, VaultAuth::AppRole { .. })
            && let Some(token) = state.token.take()
        {
            let url = format!("{}/v1/auth/token/revoke-self", self.address);
            if let Err(e) = self
                .client
                .post(&url)
                .header("X-Vault-Token", token.expose_secret())
                .send()
                .await
            {
                warn!("Vault provider '{}' could not revoke its token: {e}", self.name);
            }
        }
        state.clear();
        state.initialized = false;
        Ok(())
    }

    /// Writes a new version holding only `field` (default `value`).
    async fn set_secret(
        &self,
        path: &SecretPath,
        field: Option<&str>,
        value: &SecretString,
    ) -> Result<()> {
        let url = self.data_url(path);
        let url = &url;
        let body = json!({ "data": { field.unwrap_or(DEFAULT_FIELD): value.expose_secret() } });
        let body = &body;

        self.with_reauth(|token| async move {
            self.send(Method::POST, url, token, Some(body)).await.map(|_| ())
        })
        .await
    }

    async fn delete_secret(&self, path: &SecretPath) -> Result<bool> {
        let url = self.metadata_url(path.as_str());
        let url = &url;

        self.with_reauth(|token| async move {
            let existing = self.send(Method::GET, url, token.clone(), None).await?;
            if existing.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            self.send(Method::DELETE, url, token, None).await.map(|_| true)
        })
        .await
    }

    async fn list_secrets(&self) -> Result<Vec<SecretPath>> {
        let mut found = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(prefix) = pending.pop() {
            for key in self.list_prefix(&prefix).await? {
                let full = format!("{prefix}{key}");
                if key.ends_with('/') {
                    pending.push(full);
                } else if let Ok(path) = SecretPath::parse(&full) {
                    found.push(path);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    fn validate_reference(&self, _reference: &ProviderReference) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn token_provider(server: &MockServer) -> VaultProvider {
        VaultProvider::new(
            "vault",
            server.uri(),
            "secret",
            VaultAuth::Token(secret("root-token")),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn approle_provider(server: &MockServer) -> VaultProvider {
        VaultProvider::new(
            "vault",
            server.uri(),
            "secret",
            VaultAuth::AppRole {
                mount: "approle".to_string(),
                role_id: secret("role"),
                secret_id: secret("secret-id"),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn login_response(token: &str, lease: u64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "auth": { "client_token": token, "lease_duration": lease }
        }))
    }

    fn kv_response(data: &Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "data": { "data": data, "metadata": { "version": 1 } }
        }))
    }

    fn secret_path(raw: &str) -> SecretPath {
        SecretPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_token_read_default_and_named_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/exchanges/bybit"))
            .and(header("X-Vault-Token", "root-token"))
            .respond_with(kv_response(&json!({"value": "key-1", "secret": "s3cr3t"})))
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.initialize().await.unwrap();

        let p = secret_path("exchanges/bybit");
        let value = provider.get_secret(&p, None).await.unwrap().unwrap();
        assert_eq!(value.expose_secret(), "key-1");
        let field = provider.get_secret(&p, Some("secret")).await.unwrap().unwrap();
        assert_eq!(field.expose_secret(), "s3cr3t");
        assert!(provider.get_secret(&p, Some("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_404_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/absent"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errors": []})))
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.initialize().await.unwrap();
        assert!(provider.get_secret(&secret_path("absent"), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_static_token_403_is_auth_failed_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/a"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({"errors": ["permission denied"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.initialize().await.unwrap();
        let err = provider.get_secret(&secret_path("a"), None).await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthFailed { .. }));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/garbled"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.initialize().await.unwrap();

        let busy = provider.get_secret(&secret_path("busy"), None).await.unwrap_err();
        assert_eq!(busy.retry_after(), Some(Duration::from_secs(2)));
        assert!(busy.is_transient());

        let down = provider.get_secret(&secret_path("down"), None).await.unwrap_err();
        assert!(matches!(down, ProviderError::Unavailable { .. }));

        let garbled = provider.get_secret(&secret_path("garbled"), None).await.unwrap_err();
        assert!(matches!(garbled, ProviderError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_uninitialized_read_fails() {
        let server = MockServer::start().await;
        let provider = token_provider(&server);
        let err = provider.get_secret(&secret_path("a"), None).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_approle_login_and_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .and(body_json(json!({"role_id": "role", "secret_id": "secret-id"})))
            .respond_with(login_response("t1", 3600))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/a"))
            .and(header("X-Vault-Token", "t1"))
            .respond_with(kv_response(&json!({"value": "v"})))
            .expect(2)
            .mount(&server)
            .await;

        let provider = approle_provider(&server);
        provider.initialize().await.unwrap();
        provider.initialize().await.unwrap();
        for _ in 0..2 {
            let value = provider.get_secret(&secret_path("a"), None).await.unwrap().unwrap();
            assert_eq!(value.expose_secret(), "v");
        }
    }

    #[tokio::test]
    async fn test_approle_rejected_login_is_auth_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"errors": ["invalid secret id"]})),
            )
            .mount(&server)
            .await;

        let provider = approle_provider(&server);
        let err = provider.initialize().await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_vault_is_unavailable() {
        let provider = VaultProvider::new(
            "vault",
            "http://127.0.0.1:1",
            "secret",
            VaultAuth::AppRole {
                mount: "approle".to_string(),
                role_id: secret("role"),
                secret_id: secret("secret-id"),
            },
            Duration::from_secs(2),
        )
        .unwrap();
        let err = provider.initialize().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_approle_403_relogs_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(login_response("fresh", 3600))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/a"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/a"))
            .respond_with(kv_response(&json!({"value": "v"})))
            .mount(&server)
            .await;

        let provider = approle_provider(&server);
        provider.initialize().await.unwrap();
        let value = provider.get_secret(&secret_path("a"), None).await.unwrap().unwrap();
        assert_eq!(value.expose_secret(), "v");
    }

    #[tokio::test]
    async fn test_short_lease_renews_before_read() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(login_response("short", 1))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/a"))
            .respond_with(kv_response(&json!({"value": "v"})))
            .expect(2)
            .mount(&server)
            .await;

        let provider = approle_provider(&server);
        provider.initialize().await.unwrap();
        provider.get_secret(&secret_path("a"), None).await.unwrap();
        provider.get_secret(&secret_path("a"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_renewal_never_uses_stale_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(login_response("expiring", 1))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/a"))
            .respond_with(kv_response(&json!({"value": "v"})))
            .expect(0)
            .mount(&server)
            .await;

        let provider = approle_provider(&server);
        provider.initialize().await.unwrap();

        for _ in 0..2 {
            let err = provider.get_secret(&secret_path("a"), None).await.unwrap_err();
            assert!(matches!(err, ProviderError::AuthFailed { .. }));
        }
    }

    #[tokio::test]
    async fn test_set_and_delete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/svc/key"))
            .and(body_json(json!({"data": {"value": "new"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"version": 2}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/svc/key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/secret/metadata/svc/key"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/svc/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.initialize().await.unwrap();
        provider
            .set_secret(&secret_path("svc/key"), None, &secret("new"))
            .await
            .unwrap();
        assert!(provider.delete_secret(&secret_path("svc/key")).await.unwrap());
        assert!(!provider.delete_secret(&secret_path("svc/gone")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_recurses_into_folders() {
        let server = MockServer::start().await;
        Mock::given(method("LIST"))
            .and(path("/v1/secret/metadata/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"keys": ["b", "dir/"]}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("LIST"))
            .and(path("/v1/secret/metadata/dir/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"keys": ["a"]}})))
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.initialize().await.unwrap();
        let listed: Vec<String> = provider
            .list_secrets()
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(listed, vec!["b", "dir/a"]);
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sealed": false})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = token_provider(&server);
        provider.health_check().await.unwrap();
        let err = provider.health_check().await.unwrap_err();
        assert!(err.to_string().contains("sealed"));
    }

    #[tokio::test]
    async fn test_fields_are_valid_references() {
        let server = MockServer::start().await;
        let provider = token_provider(&server);
        let reference = ProviderReference::parse("vault://kv/okx#passphrase", "local").unwrap();
        provider.validate_reference(&reference).unwrap();
    }
}
