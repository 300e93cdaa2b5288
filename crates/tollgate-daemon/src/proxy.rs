//! Session-bound HTTP proxy.
//!
//! Ordinary HTTP clients reach a service through
//! `http://<proxy_listen>/<capability>/<path>` with the header issued by
//! `get_http_access`:
//!
//! ```text
//! GET /stripe_readonly/v1/balance HTTP/1.1
//! Authorization: Bearer tg_sess_...
//! ```
//!
//! The session token is replaced with the service credential and the request
//! runs through the same pipeline as the `execute` tool. The path is taken
//! from the raw request URI, so the pipeline canonicalizes exactly what the
//! client sent. Bodies are forwarded as bytes in both directions. Broker
//! failures are answered with a JSON body `{"error": kind, "message": ...}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::dispatcher::{Dispatcher, ProxiedRequest};
use crate::error::{BrokerError, Result};

/// Largest request body the proxy accepts (10 MB).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// The session token; the signer strips the remaining hop and negotiation
/// headers for both surfaces.
const DROPPED_HEADERS: &[&str] = &["authorization"];

#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the axum router for the HTTP proxy.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/{capability}/{*path}", any(handle_request))
        .with_state(state)
}

/// Binds the proxy listener.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP proxy listening");
    Ok(listener)
}

/// Serves the proxy on `listener` until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: ProxyState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, stopping HTTP proxy");
        })
        .await?;
    Ok(())
}

async fn handle_request(
    State(state): State<ProxyState>,
    Path((capability, _)): Path<(String, String)>,
    req: Request,
) -> std::result::Result<Response, ProxyError> {
    let session_id = bearer_token(req.headers()).ok_or(BrokerError::SessionNotFound)?;

    let path = raw_service_path(req.uri().path())
        .ok_or_else(|| BrokerError::InvalidRequest("missing service path".to_string()))?;
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let method = req.method().to_string();
    let headers = forwarded_headers(req.headers());

    let body = axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| BrokerError::InvalidRequest(format!("failed to read body: {e}")))?;
    let body = (!body.is_empty()).then(|| body.to_vec());

    debug!(capability = %capability, method = %method, "Proxying request");
    let response = state
        .dispatcher
        .execute_in_session(
            &session_id,
            &capability,
            ProxiedRequest {
                method,
                path: format!("{path}{query}"),
                headers,
                body,
            },
        )
        .await?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            value.parse::<HeaderValue>(),
        ) {
            response_headers.append(name, value);
        }
    }
    response_headers.remove(header::CONTENT_LENGTH);

    Ok((status, response_headers, Body::from(response.body)).into_response())
}

/// The still-encoded remainder of `/<capability>/<rest>`, as `/<rest>`.
fn raw_service_path(uri_path: &str) -> Option<String> {
    let (_, rest) = uri_path.strip_prefix('/')?.split_once('/')?;
    Some(format!("/{rest}"))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !DROPPED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// A broker failure answered over HTTP.
#[derive(Debug)]
pub struct ProxyError(BrokerError);

impl From<BrokerError> for ProxyError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl ProxyError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match &self.0 {
            BrokerError::SessionNotFound => StatusCode::UNAUTHORIZED,
            BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
            BrokerError::CapabilityNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidRequest(_) | BrokerError::ReasonRequired(_) | BrokerError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = axum::Json(json!({
            "error": self.0.kind(),
            "message": self.0.sanitized_message(),
        }));
        (self.status(), body).into_response()
    }
}
