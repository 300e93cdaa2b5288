//! Request mediation pipeline.
//!
//! Every agent request passes through the same stages:
//!
//! ```text
//! capability → request validation → reason → policy → session
//!            → secrets → signing → upstream → redaction → audit
//! ```
//!
//! A failure before the session stage is a denial; a failure after it is an
//! error. Both are audited exactly once, as is every completed request.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::http::{HeaderName, HeaderValue};
use secrecy::SecretString;
use tollgate_client::{Credentials, OutboundRequest, UpstreamClient, sign};
use tollgate_common::{
    AuditRecord, AuthConfig, CapabilitySummary, ExecuteRequest, ExecuteResponse, HttpAccess,
    Outcome, Session,
};
use tollgate_secrets::SecretStore;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::clock::Clock;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::session::SessionManager;

/// Configuration snapshot with the components built from it.
///
/// Replaced as a whole on reload; in-flight requests keep the snapshot they
/// started with.
pub struct Runtime {
    pub config: BrokerConfig,
    pub store: Arc<SecretStore>,
    upstream: UpstreamClient,
}

/// A request arriving through the HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedRequest {
    pub method: String,
    /// Path below the service base URL, optionally with a query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Provider and session status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// `ok` when every provider is healthy, `degraded` otherwise.
    pub status: &'static str,
    pub providers: BTreeMap<String, String>,
    pub active_sessions: usize,
}

/// One request on its way through the pipeline.
struct Mediation {
    capability: String,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    reason: Option<String>,
    /// Session the request arrived with; `None` reuses or creates one.
    session: Option<Session>,
}

/// Identity of a request for audit purposes.
struct CallRecord {
    request_id: Uuid,
    started: Instant,
    service: String,
}

/// Orchestrates policy, sessions, secrets, signing, and upstream calls.
pub struct Dispatcher {
    runtime: RwLock<Arc<Runtime>>,
    sessions: SessionManager,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    proxy_base_url: String,
}

impl Dispatcher {
    /// Creates a dispatcher serving `config` with secrets from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if a secret reference in `config`
    /// cannot be served by `store`, or the upstream client cannot be built.
    pub fn new(
        config: BrokerConfig,
        store: Arc<SecretStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate_references(store.registry())?;
        let upstream = UpstreamClient::new(config.settings.request_timeout())?;
        let proxy_base_url = format!("http://{}", config.settings.proxy_listen);

        Ok(Self {
            runtime: RwLock::new(Arc::new(Runtime {
                config,
                store,
                upstream,
            })),
            sessions: SessionManager::new(Arc::clone(&clock)),
            audit,
            clock,
            proxy_base_url,
        })
    }

    /// Current configuration snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error only if the runtime lock is poisoned.
    pub fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .map(|runtime| Arc::clone(&*runtime))
            .map_err(|e| BrokerError::Internal(format!("Runtime lock poisoned: {e}")))
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Summaries of every configured capability, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error only if the runtime lock is poisoned.
    pub fn list_services(&self) -> Result<Vec<CapabilitySummary>> {
        let runtime = self.runtime()?;
        Ok(runtime
            .config
            .capabilities
            .iter()
            .map(|(name, capability)| CapabilitySummary {
                name: name.clone(),
                service: capability.service.clone(),
                ttl: capability.ttl.to_string(),
                auto_approve: capability.auto_approve,
                requires_reason: capability.requires_reason,
            })
            .collect())
    }

    /// Executes one request on behalf of the agent.
    ///
    /// Reuses an active session for the same capability and reason, or
    /// creates one. Non-2xx upstream statuses are returned, not raised.
    ///
    /// # Errors
    ///
    /// Returns a denial ([`BrokerError::CapabilityNotFound`],
    /// [`BrokerError::InvalidRequest`], [`BrokerError::ReasonRequired`],
    /// [`BrokerError::Forbidden`]) or an execution error (provider, secret,
    /// signing, upstream, timeout). Either way the request is audited.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        let headers = request.headers.unwrap_or_default().into_iter().collect();
        self.mediate(Mediation {
            capability: request.capability,
            method: request.method,
            path: request.path,
            headers,
            body: request.body.map(String::into_bytes),
            reason: normalize_reason(request.reason),
            session: None,
        })
        .await
    }

    /// Executes a request that arrived through the proxy with a session id.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionNotFound`] if the session is missing,
    /// expired, revoked, or belongs to another capability; otherwise as
    /// [`Dispatcher::execute`].
    pub async fn execute_in_session(
        &self,
        session_id: &str,
        capability: &str,
        request: ProxiedRequest,
    ) -> Result<ExecuteResponse> {
        let session = self
            .sessions
            .get(session_id)
            .ok()
            .filter(|session| session.capability == capability);

        let Some(session) = session else {
            let call = self.call_record(String::new());
            self.record(
                &call,
                capability,
                &request.method,
                &request.path,
                None,
                Err(&BrokerError::SessionNotFound),
            )
            .await;
            return Err(BrokerError::SessionNotFound);
        };

        self.mediate(Mediation {
            capability: capability.to_string(),
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
            reason: session.reason.clone(),
            session: Some(session),
        })
        .await
    }

    /// Issues a new session-bound proxy credential for `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CapabilityNotFound`] or
    /// [`BrokerError::ReasonRequired`].
    pub fn get_http_access(&self, capability: &str, reason: Option<String>) -> Result<HttpAccess> {
        let runtime = self.runtime()?;
        let (config, _) = runtime.config.capability(capability)?;
        let reason = normalize_reason(reason);
        if config.requires_reason && reason.is_none() {
            return Err(BrokerError::ReasonRequired(capability.to_string()));
        }

        let session = self
            .sessions
            .create(capability, &config.service, config.ttl, reason)?;
        info!(
            capability,
            session = %session.display_id(),
            expires_at = %session.expires_at,
            "Issued HTTP access"
        );

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", session.id));
        Ok(HttpAccess {
            url: format!("{}/{capability}", self.proxy_base_url.trim_end_matches('/')),
            headers,
            expires: session.expires_at,
        })
    }

    /// Revokes a session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SessionNotFound`] if no active session has this id.
    pub fn revoke_session(&self, session_id: &str) -> Result<Session> {
        let session = self.sessions.revoke(session_id)?;
        info!(
            capability = %session.capability,
            session = %session.display_id(),
            "Session revoked"
        );
        Ok(session)
    }

    /// Removes expired and revoked sessions.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session table is poisoned.
    pub fn sweep_sessions(&self) -> Result<usize> {
        let removed = self.sessions.sweep()?;
        if removed > 0 {
            debug!(removed, "Swept sessions");
        }
        Ok(removed)
    }

    /// Replaces the configuration and secret store atomically.
    ///
    /// Sessions of capabilities that were removed, or whose grant or service
    /// changed, are revoked. On error the previous configuration stays.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if `config` references secrets that
    /// `store` cannot serve.
    pub fn reload(&self, config: BrokerConfig, store: Arc<SecretStore>) -> Result<usize> {
        config.validate_references(store.registry())?;
        let current = self.runtime()?;

        let upstream = if config.settings.request_timeout() == current.upstream.timeout() {
            current.upstream.clone()
        } else {
            UpstreamClient::new(config.settings.request_timeout())?
        };
        if config.settings.proxy_listen != current.config.settings.proxy_listen {
            warn!("proxy_listen changes take effect after a restart");
        }

        let changed = current.config.changed_capabilities(&config);
        {
            let mut runtime = self
                .runtime
                .write()
                .map_err(|e| BrokerError::Internal(format!("Runtime lock poisoned: {e}")))?;
            *runtime = Arc::new(Runtime {
                config,
                store,
                upstream,
            });
        }

        let mut revoked = 0;
        for capability in &changed {
            revoked += self.sessions.revoke_capability(capability)?;
        }
        info!(
            changed = changed.len(),
            revoked, "Configuration reloaded"
        );
        Ok(revoked)
    }

    /// Provider health and session count.
    ///
    /// # Errors
    ///
    /// Returns an error only if a lock is poisoned.
    pub async fn health(&self) -> Result<HealthReport> {
        let runtime = self.runtime()?;
        let providers: BTreeMap<String, String> = runtime
            .store
            .registry()
            .health()
            .await
            .into_iter()
            .map(|(name, result)| {
                let status = match result {
                    Ok(()) => "ok".to_string(),
                    Err(e) => e.to_string(),
                };
                (name, status)
            })
            .collect();
        let status = if providers.values().all(|status| status == "ok") {
            "ok"
        } else {
            "degraded"
        };

        Ok(HealthReport {
            status,
            providers,
            active_sessions: self.sessions.active_count()?,
        })
    }

    fn call_record(&self, service: String) -> CallRecord {
        CallRecord {
            request_id: Uuid::new_v4(),
            started: Instant::now(),
            service,
        }
    }

    async fn mediate(&self, mediation: Mediation) -> Result<ExecuteResponse> {
        let mut call = self.call_record(String::new());
        let span = info_span!(
            "mediate",
            request_id = %call.request_id,
            capability = %mediation.capability,
            method = %mediation.method,
        );

        async {
            let result = self.run_pipeline(&mut call, &mediation).await;
            self.record(
                &call,
                &mediation.capability,
                &mediation.method,
                &mediation.path,
                mediation.reason.clone(),
                result.as_ref().map(|response| response.status),
            )
            .await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(
        &self,
        call: &mut CallRecord,
        mediation: &Mediation,
    ) -> Result<ExecuteResponse> {
        let runtime = self.runtime()?;

        let (capability, service) = runtime.config.capability(&mediation.capability)?;
        call.service.clone_from(&capability.service);

        let method = validate_method(&mediation.method)?;
        let target = canonical_target(&mediation.path)?;
        validate_headers(&mediation.headers)?;

        if capability.requires_reason && mediation.reason.is_none() {
            return Err(BrokerError::ReasonRequired(mediation.capability.clone()));
        }

        let decision = capability.evaluate(&method, &target);
        if !decision.allowed {
            return Err(BrokerError::Forbidden(decision.reason));
        }
        debug!(reason = %decision.reason, "Policy allowed request");

        if mediation.session.is_none() {
            self.sessions.find_or_create(
                &mediation.capability,
                &capability.service,
                capability.ttl,
                mediation.reason.clone(),
            )?;
        }

        let credentials = resolve_credentials(&runtime.store, &service.auth).await?;

        let mut outbound = OutboundRequest::from_target(
            &method,
            service.base_url.clone(),
            &target,
            mediation.headers.clone(),
            mediation.body.clone(),
        );
        sign(&mut outbound, &credentials, self.clock.now())?;

        let response = runtime.upstream.execute(&outbound).await?;
        let response = response.redact(&credentials.secrets());

        Ok(ExecuteResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    async fn record(
        &self,
        call: &CallRecord,
        capability: &str,
        method: &str,
        path: &str,
        agent_reason: Option<String>,
        result: std::result::Result<u16, &BrokerError>,
    ) {
        let latency_ms = u64::try_from(call.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let outcome = match result {
            Ok(_) => Outcome::Allowed,
            Err(e) if is_denial(e) => Outcome::Denied,
            Err(_) => Outcome::Error,
        };

        let mut record = AuditRecord::builder()
            .request_id(call.request_id)
            .timestamp(self.clock.now())
            .capability(capability)
            .service(call.service.clone())
            .method(method.to_ascii_uppercase())
            .path(path)
            .outcome(outcome)
            .latency_ms(latency_ms)
            .agent_reason(agent_reason)
            .build();

        match result {
            Ok(status) => {
                record.status = Some(status);
                info!(status, latency_ms, "Request completed");
            }
            Err(BrokerError::Forbidden(reason)) => {
                record.denial_reason = Some(reason.clone());
                info!(reason = %reason, "Request denied by policy");
            }
            Err(e) if is_denial(e) => {
                record.denial_reason = Some(e.sanitized_message());
                info!(kind = e.kind(), "Request denied");
            }
            Err(e) => {
                record.error = Some(format!("{}: {}", e.kind(), e.sanitized_message()));
                warn!(kind = e.kind(), error = %e, "Request failed");
            }
        }

        self.audit.record(&record).await;
    }
}

/// Denials are refusals before any secret is touched.
const fn is_denial(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::CapabilityNotFound(_)
            | BrokerError::InvalidRequest(_)
            | BrokerError::ReasonRequired(_)
            | BrokerError::Forbidden(_)
            | BrokerError::SessionNotFound
    )
}

fn normalize_reason(reason: Option<String>) -> Option<String> {
    reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
}

/// Checks RFC 9110 token syntax and returns the method uppercased.
fn validate_method(method: &str) -> Result<String> {
    let is_tchar = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c);
    if method.is_empty() || method.len() > 32 || !method.chars().all(is_tchar) {
        return Err(BrokerError::InvalidRequest(format!("invalid HTTP method '{method}'")));
    }
    Ok(method.to_ascii_uppercase())
}

/// Validates a request target and returns its canonical form.
///
/// Policy is evaluated on, and the upstream receives, the same canonical
/// string. Escapes of unreserved characters are decoded, other escapes are
/// uppercased, and anything that could alias another path is rejected:
/// encoded dots and slashes, empty inner segments, and `.`/`..` segments.
fn canonical_target(target: &str) -> Result<String> {
    let invalid = |reason: &str| BrokerError::InvalidRequest(format!("path {reason}"));

    if !target.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if target
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || c == '#' || c == '\\')
    {
        return Err(invalid("contains forbidden characters"));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    if !path.is_ascii() {
        return Err(invalid("must be ASCII; percent-encode other characters"));
    }

    let mut canonical = String::with_capacity(path.len());
    let mut bytes = path.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            canonical.push(char::from(byte));
            continue;
        }
        let (Some(high), Some(low)) = (bytes.next(), bytes.next()) else {
            return Err(invalid("contains a truncated percent escape"));
        };
        let decoded = match (hex_value(high), hex_value(low)) {
            (Some(high), Some(low)) => (high << 4) | low,
            _ => return Err(invalid("contains an invalid percent escape")),
        };
        match decoded {
            b'.' | b'/' | b'\\' => {
                return Err(invalid("must not contain encoded dots or slashes"));
            }
            b if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'~' => {
                canonical.push(char::from(b));
            }
            b => canonical.push_str(&format!("%{b:02X}")),
        }
    }

    let segments: Vec<&str> = canonical[1..].split('/').collect();
    let last = segments.len() - 1;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() && index != last {
            return Err(invalid("must not contain empty segments"));
        }
        if *segment == "." || *segment == ".." {
            return Err(invalid("must not contain '.' or '..' segments"));
        }
    }

    if let Some(query) = query {
        canonical.push('?');
        canonical.push_str(query);
    }
    Ok(canonical)
}

const fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

fn validate_headers(headers: &[(String, String)]) -> Result<()> {
    for (name, value) in headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
            return Err(BrokerError::InvalidRequest(format!("invalid header '{name}'")));
        }
    }
    Ok(())
}

async fn resolve_secret(store: &SecretStore, reference: &str) -> Result<SecretString> {
    let parsed = store.registry().parse_reference(reference)?;
    store
        .resolve(&parsed)
        .await?
        .ok_or_else(|| BrokerError::SecretNotFound(parsed.to_string()))
}

/// Resolves every secret an auth descriptor names.
async fn resolve_credentials(store: &SecretStore, auth: &AuthConfig) -> Result<Credentials> {
    Ok(match auth {
        AuthConfig::Bearer { token } => Credentials::Bearer {
            token: resolve_secret(store, token).await?,
        },
        AuthConfig::Headers { headers } => {
            let mut resolved = Vec::with_capacity(headers.len());
            for (name, reference) in headers {
                resolved.push((name.clone(), resolve_secret(store, reference).await?));
            }
            Credentials::Headers { headers: resolved }
        }
        AuthConfig::HmacQuery {
            api_key,
            api_secret,
        } => Credentials::HmacQuery {
            api_key: resolve_secret(store, api_key).await?,
            api_secret: resolve_secret(store, api_secret).await?,
        },
        AuthConfig::HmacRecvWindow {
            api_key,
            api_secret,
            recv_window,
        } => Credentials::HmacRecvWindow {
            api_key: resolve_secret(store, api_key).await?,
            api_secret: resolve_secret(store, api_secret).await?,
            recv_window: *recv_window,
        },
        AuthConfig::HmacPassphrase {
            api_key,
            api_secret,
            passphrase,
        } => Credentials::HmacPassphrase {
            api_key: resolve_secret(store, api_key).await?,
            api_secret: resolve_secret(store, api_secret).await?,
            passphrase: resolve_secret(store, passphrase).await?,
        },
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use tollgate_secrets::{MapEnv, RetryConfig, SharedEnv};
    use wiremock::matchers::{body_bytes, body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::clock::MockClock;

    struct Harness {
        dispatcher: Dispatcher,
        audit: Arc<MemoryAuditLog>,
        clock: MockClock,
        server: MockServer,
        env: SharedEnv,
        _dir: TempDir,
    }

    fn config_toml(upstream: &str, timeout_secs: u64) -> String {
        format!(
            r#"
[settings]
default_provider = "env"
request_timeout_secs = {timeout_secs}

[providers.env]
type = "env"

[services.stripe]
base_url = "{upstream}"
auth = {{ type = "bearer", token = "env://STRIPE_KEY" }}

[services.bybit]
base_url = "{upstream}"
auth = {{ type = "hmac-bybit", api_key = "env://BYBIT_KEY", api_secret = "env://BYBIT_SECRET" }}

[services.unset]
base_url = "{upstream}"
auth = {{ type = "bearer", token = "env://NOT_SET" }}

[capabilities.stripe_readonly]
service = "stripe"
ttl = "1h"
rules = ["allow GET /v1/*", "deny * *"]

[capabilities.stripe_guarded]
service = "stripe"
ttl = "10m"
rules = ["deny * /v1/admin/*", "allow GET /v1/*"]

[capabilities.bybit_trade]
service = "bybit"
ttl = "5m"
rules = ["allow POST /v5/order/*"]
requires_reason = true

[capabilities.unset_secret]
service = "unset"
ttl = "1m"
auto_approve = true
"#
        )
    }

    fn store_for(config: &BrokerConfig, env: &SharedEnv, dir: &TempDir) -> Arc<SecretStore> {
        let registry = config.build_registry(env, dir.path()).unwrap();
        Arc::new(SecretStore::new(Arc::new(registry)).with_retry(RetryConfig::none()))
    }

    async fn harness_with_timeout(timeout_secs: u64) -> Harness {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let env: SharedEnv = Arc::new(
            MapEnv::new()
                .with("STRIPE_KEY", "sk_test_secret")
                .with("BYBIT_KEY", "test-key")
                .with("BYBIT_SECRET", "test-secret"),
        );

        let config = BrokerConfig::from_toml_str(&config_toml(&server.uri(), timeout_secs)).unwrap();
        let store = store_for(&config, &env, &dir);
        store.registry().initialize_all().await.unwrap();

        let audit = Arc::new(MemoryAuditLog::new());
        let clock = MockClock::new(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());
        let dispatcher = Dispatcher::new(
            config,
            store,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            Arc::new(clock.clone()),
        )
        .unwrap();

        Harness {
            dispatcher,
            audit,
            clock,
            server,
            env,
            _dir: dir,
        }
    }

    async fn harness() -> Harness {
        harness_with_timeout(30).await
    }

    fn request(capability: &str, method: &str, path: &str) -> ExecuteRequest {
        ExecuteRequest {
            capability: capability.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            body: None,
            headers: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_list_services() {
        let h = harness().await;
        let services = h.dispatcher.list_services().unwrap();

        let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["bybit_trade", "stripe_guarded", "stripe_readonly", "unset_secret"]
        );
        assert_eq!(services[2].service, "stripe");
        assert_eq!(services[2].ttl, "1h");
        assert!(services[0].requires_reason);
        assert!(services[3].auto_approve);
    }

    #[tokio::test]
    async fn test_allowed_request_is_signed_redacted_and_audited() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/v1/balance"))
            .and(query_param("currency", "usd"))
            .and(header("authorization", "Bearer sk_test_secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"available":100,"echo":"sk_test_secret"}"#),
            )
            .expect(2)
            .mount(&h.server)
            .await;

        let response = h
            .dispatcher
            .execute(request("stripe_readonly", "get", "/v1/balance?currency=usd"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.body_text(),
            Some(r#"{"available":100,"echo":"[REDACTED]"}"#)
        );
        assert_eq!(h.dispatcher.sessions().active_count().unwrap(), 1);

        h.dispatcher
            .execute(request("stripe_readonly", "GET", "/v1/balance?currency=usd"))
            .await
            .unwrap();
        assert_eq!(h.dispatcher.sessions().active_count().unwrap(), 1);

        let records = h.audit.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, Outcome::Allowed);
        assert_eq!(records[0].status, Some(200));
        assert_eq!(records[0].service, "stripe");
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].path, "/v1/balance?currency=usd");

        let persisted = serde_json::to_string(&records).unwrap();
        assert!(!persisted.contains("sk_test_secret"));
    }

    #[tokio::test]
    async fn test_policy_denial_never_reaches_upstream() {
        let h = harness().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&h.server)
            .await;

        let err = h
            .dispatcher
            .execute(request("stripe_readonly", "POST", "/v1/charges"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
        assert_eq!(err.kind(), "forbidden");
        assert_eq!(h.dispatcher.sessions().active_count().unwrap(), 0);

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Denied);
        assert_eq!(records[0].denial_reason.as_deref(), Some("denied by rule 'deny * *'"));
        assert_eq!(records[0].status, None);
    }

    #[tokio::test]
    async fn test_unknown_capability_is_audited() {
        let h = harness().await;
        let err = h
            .dispatcher
            .execute(request("github", "GET", "/user"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CapabilityNotFound(_)));

        let records = h.audit.records();
        assert_eq!(records[0].outcome, Outcome::Denied);
        assert_eq!(records[0].service, "");
    }

    #[tokio::test]
    async fn test_reason_required_before_any_session_or_secret() {
        let h = harness().await;
        let mut req = request("bybit_trade", "POST", "/v5/order/create");
        req.reason = Some("   ".to_string());

        let err = h.dispatcher.execute(req).await.unwrap_err();
        assert!(matches!(err, BrokerError::ReasonRequired(_)));
        assert_eq!(h.dispatcher.sessions().active_count().unwrap(), 0);
        assert_eq!(h.audit.records()[0].outcome, Outcome::Denied);
    }

    #[tokio::test]
    async fn test_hmac_recv_window_request() {
        let h = harness().await;
        Mock::given(method("POST"))
            .and(path("/v5/order/create"))
            .and(header("X-BAPI-API-KEY", "test-key"))
            .and(header("X-BAPI-TIMESTAMP", "1700000000000"))
            .and(header("X-BAPI-RECV-WINDOW", "5000"))
            .and(header(
                "X-BAPI-SIGN",
                "ad4a9c032a0d60d4681fd3d756df211465acfb1d0e031ea630eb740d5054852b",
            ))
            .and(header("content-type", "application/json"))
            .and(body_string(r#"{"symbol":"BTCUSDT"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"retCode":0}"#))
            .expect(1)
            .mount(&h.server)
            .await;

        let mut req = request("bybit_trade", "POST", "/v5/order/create");
        req.body = Some(r#"{"symbol":"BTCUSDT"}"#.to_string());
        req.reason = Some("rebalance".to_string());

        let response = h.dispatcher.execute(req).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            h.audit.records()[0].agent_reason.as_deref(),
            Some("rebalance")
        );
    }

    #[tokio::test]
    async fn test_missing_secret_is_an_error_not_a_denial() {
        let h = harness().await;
        let err = h
            .dispatcher
            .execute(request("unset_secret", "GET", "/anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SecretNotFound(_)));

        let record = &h.audit.records()[0];
        assert_eq!(record.outcome, Outcome::Error);
        assert!(record.error.as_deref().unwrap().starts_with("not_found:"));
    }

    #[tokio::test]
    async fn test_upstream_errors_pass_through() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/v1/charges/ch_missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"error":{"type":"invalid_request_error"}}"#),
            )
            .mount(&h.server)
            .await;

        let response = h
            .dispatcher
            .execute(request("stripe_readonly", "GET", "/v1/charges/ch_missing"))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert!(response.body_text().unwrap().contains("invalid_request_error"));
        assert_eq!(h.audit.records()[0].outcome, Outcome::Allowed);
        assert_eq!(h.audit.records()[0].status, Some(404));
    }

    #[tokio::test]
    async fn test_upstream_timeout_is_audited_as_error() {
        let h = harness_with_timeout(1).await;
        Mock::given(method("GET"))
            .and(path("/v1/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&h.server)
            .await;

        let err = h
            .dispatcher
            .execute(request("stripe_readonly", "GET", "/v1/slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout));
        assert_eq!(h.audit.records()[0].outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn test_unsafe_requests_are_rejected() {
        let h = harness().await;
        for (method, path) in [
            ("GET", "v1/balance"),
            ("GET", "/v1/../admin"),
            ("GET", "/v1/./balance"),
            ("GET", "/v1/%2e%2e/admin"),
            ("GET", "/v1/%2F/admin"),
            ("GET", "//evil.example.com/v1"),
            ("GET", "/v1//balance"),
            ("GET", "/v1/%zz"),
            ("GET", "/v1/caf\u{e9}"),
            ("GET", "/v1/balance\r\nX-Injected: 1"),
            ("GE T", "/v1/balance"),
            ("", "/v1/balance"),
        ] {
            let err = h
                .dispatcher
                .execute(request("stripe_readonly", method, path))
                .await
                .unwrap_err();
            assert!(
                matches!(err, BrokerError::InvalidRequest(_)),
                "expected {method} {path:?} to be rejected, got {err:?}"
            );
        }
        assert!(h.audit.records().iter().all(|r| r.outcome == Outcome::Denied));

        let mut bad_header = request("stripe_readonly", "GET", "/v1/balance");
        bad_header.headers = Some(BTreeMap::from([("bad header".to_string(), "x".to_string())]));
        assert!(matches!(
            h.dispatcher.execute(bad_header).await,
            Err(BrokerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_get_http_access_issues_fresh_sessions() {
        let h = harness().await;
        let first = h.dispatcher.get_http_access("stripe_readonly", None).unwrap();
        let second = h.dispatcher.get_http_access("stripe_readonly", None).unwrap();

        assert_eq!(first.url, "http://127.0.0.1:9119/stripe_readonly");
        assert_ne!(first.headers["Authorization"], second.headers["Authorization"]);
        assert!(first.headers["Authorization"].starts_with("Bearer tg_sess_"));
        assert_eq!(
            first.expires,
            Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + chrono::Duration::hours(1)
        );
        assert_eq!(h.dispatcher.sessions().active_count().unwrap(), 2);

        assert!(matches!(
            h.dispatcher.get_http_access("bybit_trade", None),
            Err(BrokerError::ReasonRequired(_))
        ));
        assert!(matches!(
            h.dispatcher.get_http_access("nope", None),
            Err(BrokerError::CapabilityNotFound(_))
        ));
    }

    fn session_id(access: &HttpAccess) -> String {
        access.headers["Authorization"]
            .strip_prefix("Bearer ")
            .unwrap()
            .to_string()
    }

    fn proxied(path: &str) -> ProxiedRequest {
        ProxiedRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_execute_in_session_lifecycle() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/v1/balance"))
            .and(header("authorization", "Bearer sk_test_secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&h.server)
            .await;

        let access = h.dispatcher.get_http_access("stripe_readonly", None).unwrap();
        let id = session_id(&access);

        let ok = h
            .dispatcher
            .execute_in_session(&id, "stripe_readonly", proxied("/v1/balance"))
            .await
            .unwrap();
        assert_eq!(ok.status, 200);

        assert!(matches!(
            h.dispatcher
                .execute_in_session(&id, "bybit_trade", proxied("/v5/order/create"))
                .await,
            Err(BrokerError::SessionNotFound)
        ));

        h.clock.advance(Duration::from_secs(3600));
        assert!(matches!(
            h.dispatcher
                .execute_in_session(&id, "stripe_readonly", proxied("/v1/balance"))
                .await,
            Err(BrokerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_revoked_session_is_unusable() {
        let h = harness().await;
        let access = h.dispatcher.get_http_access("stripe_readonly", None).unwrap();
        let id = session_id(&access);

        h.dispatcher.revoke_session(&id).unwrap();
        assert!(matches!(
            h.dispatcher
                .execute_in_session(&id, "stripe_readonly", proxied("/v1/balance"))
                .await,
            Err(BrokerError::SessionNotFound)
        ));
        assert!(matches!(
            h.dispatcher.revoke_session(&id),
            Err(BrokerError::SessionNotFound)
        ));
        assert_eq!(h.audit.records()[0].outcome, Outcome::Denied);
    }

    #[tokio::test]
    async fn test_reload_revokes_changed_capabilities() {
        let h = harness().await;
        let stripe = session_id(&h.dispatcher.get_http_access("stripe_readonly", None).unwrap());
        let bybit = session_id(
            &h.dispatcher
                .get_http_access("bybit_trade", Some("rebalance".to_string()))
                .unwrap(),
        );

        let mut next = h.dispatcher.runtime().unwrap().config.clone();
        next.capabilities.get_mut("stripe_readonly").unwrap().rules =
            vec!["allow GET /v1/balance".parse().unwrap()];
        let store = Arc::clone(&h.dispatcher.runtime().unwrap().store);

        assert_eq!(h.dispatcher.reload(next, store).unwrap(), 1);
        assert!(h.dispatcher.sessions().get(&stripe).is_err());
        assert!(h.dispatcher.sessions().get(&bybit).is_ok());
        assert_eq!(
            h.dispatcher.runtime().unwrap().config.capabilities["stripe_readonly"].rules.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reload_with_unservable_reference_keeps_old_config() {
        let h = harness().await;
        let mut next = h.dispatcher.runtime().unwrap().config.clone();
        next.services.get_mut("stripe").unwrap().auth = AuthConfig::Bearer {
            token: "vault://kv/stripe".to_string(),
        };

        let dir = TempDir::new().unwrap();
        let store = store_for(&next, &h.env, &dir);
        assert!(matches!(
            h.dispatcher.reload(next, store),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            &h.dispatcher.runtime().unwrap().config.services["stripe"].auth,
            AuthConfig::Bearer { token } if token == "env://STRIPE_KEY"
        ));
    }

    #[tokio::test]
    async fn test_health_and_sweep() {
        let h = harness().await;
        h.dispatcher.get_http_access("stripe_readonly", None).unwrap();

        let report = h.dispatcher.health().await.unwrap();
        assert_eq!(report.status, "ok");
        assert_eq!(report.providers["env"], "ok");
        assert_eq!(report.active_sessions, 1);

        h.clock.advance(Duration::from_secs(3600));
        assert_eq!(h.dispatcher.sweep_sessions().unwrap(), 1);
    }

    #[test]
    fn test_canonical_target() {
        assert_eq!(
            canonical_target("/v1/balance?currency=usd&x=a/../b").unwrap(),
            "/v1/balance?currency=usd&x=a/../b"
        );
        assert_eq!(canonical_target("/").unwrap(), "/");
        assert_eq!(canonical_target("/v1/charges/").unwrap(), "/v1/charges/");
        assert_eq!(canonical_target("/v1/file..txt").unwrap(), "/v1/file..txt");
        assert_eq!(canonical_target("/v1/%61dmin/%7Eme").unwrap(), "/v1/admin/~me");
        assert_eq!(canonical_target("/v1/a%2bb%3a").unwrap(), "/v1/a%2Bb%3A");
        assert_eq!(canonical_target("/v1/%2561dmin").unwrap(), "/v1/%2561dmin");

        assert!(canonical_target("/v1/..").is_err());
        assert!(canonical_target("/v1/%2e%2E").is_err());
        assert!(canonical_target("/v1/%5C..").is_err());
        assert!(canonical_target("/v1/%2f").is_err());
        assert!(canonical_target("/v1//admin").is_err());
        assert!(canonical_target("//v1").is_err());
        assert!(canonical_target("/v1/%6").is_err());
        assert!(canonical_target("/v1/%+1").is_err());
        assert!(canonical_target("/v1#frag").is_err());
    }

    #[tokio::test]
    async fn test_policy_sees_canonical_path() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&h.server)
            .await;

        for target in ["/v1/%61dmin/users", "/v1/adm%69n/users"] {
            let err = h
                .dispatcher
                .execute(request("stripe_guarded", "GET", target))
                .await
                .unwrap_err();
            assert!(
                matches!(err, BrokerError::Forbidden(_)),
                "expected {target:?} to be denied, got {err:?}"
            );
        }
        let err = h
            .dispatcher
            .execute(request("stripe_guarded", "GET", "/v1//admin/users"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest(_)));

        let response = h
            .dispatcher
            .execute(request("stripe_guarded", "GET", "/v1/%63ustomers"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let received = h.server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].url.path(), "/v1/customers");
    }

    #[tokio::test]
    async fn test_caller_cannot_negotiate_compression() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/v1/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"key":"sk_test_secret"}"#))
            .mount(&h.server)
            .await;

        let mut req = request("stripe_readonly", "GET", "/v1/balance");
        req.headers = Some(BTreeMap::from([
            ("Accept-Encoding".to_string(), "gzip, br".to_string()),
            ("Cookie".to_string(), "session=abc".to_string()),
        ]));
        let response = h.dispatcher.execute(req).await.unwrap();
        assert_eq!(response.body_text(), Some(r#"{"key":"[REDACTED]"}"#));

        let received = h.server.received_requests().await.unwrap();
        assert!(!received[0].headers.contains_key("cookie"));
        assert!(
            received[0]
                .headers
                .get("accept-encoding")
                .is_none_or(|value| value.to_str().unwrap() == "identity")
        );
    }

    #[tokio::test]
    async fn test_binary_body_reaches_upstream_unchanged() {
        let h = harness().await;
        Mock::given(method("GET"))
            .and(path("/v1/files/f_1"))
            .and(body_bytes(vec![0xff, 0x00, 0xfe]))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0x89, 0x50, 0xff], "image/png"))
            .mount(&h.server)
            .await;

        let access = h.dispatcher.get_http_access("stripe_readonly", None).unwrap();
        let mut proxied = proxied("/v1/files/f_1");
        proxied.body = Some(vec![0xff, 0x00, 0xfe]);
        let response = h
            .dispatcher
            .execute_in_session(&session_id(&access), "stripe_readonly", proxied)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, vec![0x89, 0x50, 0xff]);
        assert_eq!(response.body_text(), None);
    }

    #[test]
    fn test_method_validation() {
        assert_eq!(validate_method("patch").unwrap(), "PATCH");
        assert!(validate_method("GET\n").is_err());
        assert!(validate_method("G(ET").is_err());
    }
}
