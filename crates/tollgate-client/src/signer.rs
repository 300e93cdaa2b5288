//! Request signing for the supported authentication schemes.
//!
//! | Scheme | Signed payload | Placement |
//! |--------|----------------|-----------|
//! | bearer | none | `Authorization: Bearer <token>` |
//! | headers | none | fixed header map |
//! | hmac-query | `<query>&timestamp=<ms>` | `signature` query parameter, hex |
//! | hmac-recv-window | `<ms><key><window><body or query>` | `X-BAPI-*` headers, hex |
//! | hmac-passphrase | `<iso ts><METHOD><path?query><body>` | `OK-ACCESS-*` headers, base64 |
//!
//! Every HMAC is HMAC-SHA256 keyed with the service secret. The canonical
//! strings must match the remote API byte for byte; a wrong byte yields a
//! signature the API rejects rather than a local error.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use typed_builder::TypedBuilder;

use crate::error::SigningError;

type HmacSha256 = Hmac<Sha256>;

/// Headers a caller may never set: credentials, routing, hop-by-hop, and
/// content negotiation that would hide the response body from redaction.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "accept-encoding",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Query parameters owned by the query-signing scheme.
const RESERVED_QUERY_PARAMS: &[&str] = &["timestamp", "signature"];

/// Shape of a request before and after signing.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct OutboundRequest {
    /// HTTP method. Normalized to uppercase by [`sign`].
    #[builder(setter(into))]
    pub method: String,
    /// Scheme, host, and optional path prefix of the service.
    #[builder(setter(into))]
    pub base_url: String,
    /// Path below `base_url`, starting with `/`, without query string.
    #[builder(setter(into))]
    pub path: String,
    /// Raw query string without the leading `?`. Empty when absent.
    #[builder(default, setter(into))]
    pub query: String,
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    #[builder(default, setter(strip_option, into))]
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    /// Builds a request from a caller-supplied `path[?query]` target.
    #[must_use]
    pub fn from_target(
        method: &str,
        base_url: impl Into<String>,
        target: &str,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        Self {
            method: method.to_ascii_uppercase(),
            base_url: base_url.into(),
            path: path.to_string(),
            query: query.to_string(),
            headers,
            body,
        }
    }

    /// Full URL the request will be sent to.
    #[must_use]
    pub fn url(&self) -> String {
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), self.path);
        if !self.query.is_empty() {
            url.push('?');
            url.push_str(&self.query);
        }
        url
    }

    /// Path as seen by the server, including any base URL prefix and query.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidBaseUrl`] if `base_url` does not parse.
    pub fn request_path(&self) -> Result<String, SigningError> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|_| SigningError::InvalidBaseUrl(self.base_url.clone()))?;
        let mut path = format!("{}{}", base.path().trim_end_matches('/'), self.path);
        if !self.query.is_empty() {
            path.push('?');
            path.push_str(&self.query);
        }
        Ok(path)
    }

    /// Returns the first header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every header named `name` with a single value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_header(&name);
        self.headers.push((name, value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn has_body_semantics(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH")
    }
}

/// Resolved credentials, one variant per authentication scheme.
#[derive(Clone)]
pub enum Credentials {
    Bearer {
        token: SecretString,
    },
    Headers {
        headers: Vec<(String, SecretString)>,
    },
    HmacQuery {
        api_key: SecretString,
        api_secret: SecretString,
    },
    HmacRecvWindow {
        api_key: SecretString,
        api_secret: SecretString,
        recv_window: u64,
    },
    HmacPassphrase {
        api_key: SecretString,
        api_secret: SecretString,
        passphrase: SecretString,
    },
}

impl Credentials {
    /// Every secret value held, for response redaction.
    #[must_use]
    pub fn secrets(&self) -> Vec<&SecretString> {
        match self {
            Self::Bearer { token } => vec![token],
            Self::Headers { headers } => headers.iter().map(|(_, v)| v).collect(),
            Self::HmacQuery {
                api_key,
                api_secret,
            }
            | Self::HmacRecvWindow {
                api_key,
                api_secret,
                ..
            } => vec![api_key, api_secret],
            Self::HmacPassphrase {
                api_key,
                api_secret,
                passphrase,
            } => vec![api_key, api_secret, passphrase],
        }
    }

    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Bearer { .. } => "bearer",
            Self::Headers { .. } => "headers",
            Self::HmacQuery { .. } => "hmac-query",
            Self::HmacRecvWindow { .. } => "hmac-recv-window",
            Self::HmacPassphrase { .. } => "hmac-passphrase",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("scheme", &self.scheme())
            .field("values", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Signs `request` in place for `credentials` at time `now`.
///
/// Caller-supplied credentials (`Authorization`, `Cookie`), `Accept-Encoding`,
/// `Host`, `Content-Length`, and hop-by-hop headers are removed first.
///
/// # Errors
///
/// Returns a [`SigningError`] for empty credentials, an unusable key, a header
/// that is not valid HTTP, or an unparsable base URL.
pub fn sign(
    request: &mut OutboundRequest,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    request.method.make_ascii_uppercase();
    request
        .headers
        .retain(|(name, _)| !STRIPPED_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)));

    match credentials {
        Credentials::Bearer { token } => {
            let token = non_empty(token, "token")?;
            request.set_header("Authorization", format!("Bearer {token}"));
        }
        Credentials::Headers { headers } => {
            for (name, value) in headers {
                request.set_header(name.clone(), value.expose_secret());
            }
        }
        Credentials::HmacQuery {
            api_key,
            api_secret,
        } => sign_query(request, api_key, api_secret, now)?,
        Credentials::HmacRecvWindow {
            api_key,
            api_secret,
            recv_window,
        } => sign_recv_window(request, api_key, api_secret, *recv_window, now)?,
        Credentials::HmacPassphrase {
            api_key,
            api_secret,
            passphrase,
        } => sign_passphrase(request, api_key, api_secret, passphrase, now)?,
    }

    validate_headers(request)
}

fn non_empty<'a>(value: &'a SecretString, field: &'static str) -> Result<&'a str, SigningError> {
    let value = value.expose_secret();
    if value.is_empty() {
        Err(SigningError::EmptyCredential(field))
    } else {
        Ok(value)
    }
}

/// HMAC-SHA256 over the concatenation of `parts`.
fn hmac_sha256(secret: &str, parts: &[&[u8]]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sign_query(
    request: &mut OutboundRequest,
    api_key: &SecretString,
    api_secret: &SecretString,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    let api_key = non_empty(api_key, "api_key")?;
    let api_secret = non_empty(api_secret, "api_secret")?;

    let mut params: Vec<&str> = request
        .query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split_once('=').map_or(*pair, |(k, _)| k);
            !RESERVED_QUERY_PARAMS.contains(&key)
        })
        .collect();
    let timestamp = format!("timestamp={}", now.timestamp_millis());
    params.push(&timestamp);

    let payload = params.join("&");
    let signature = hex::encode(hmac_sha256(api_secret, &[payload.as_bytes()])?);

    request.query = format!("{payload}&signature={signature}");
    request.set_header("X-MBX-APIKEY", api_key);
    Ok(())
}

fn sign_recv_window(
    request: &mut OutboundRequest,
    api_key: &SecretString,
    api_secret: &SecretString,
    recv_window: u64,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    let api_key = non_empty(api_key, "api_key")?;
    let api_secret = non_empty(api_secret, "api_secret")?;

    let timestamp = now.timestamp_millis().to_string();
    let recv_window = recv_window.to_string();
    // POST/PUT/PATCH sign the body, even when empty; everything else signs the query
    let signed_part = if request.has_body_semantics() {
        request.body.as_deref().unwrap_or_default()
    } else {
        request.query.as_bytes()
    };

    let prefix = format!("{timestamp}{api_key}{recv_window}");
    let signature = hex::encode(hmac_sha256(api_secret, &[prefix.as_bytes(), signed_part])?);

    request.set_header("X-BAPI-API-KEY", api_key);
    request.set_header("X-BAPI-TIMESTAMP", timestamp);
    request.set_header("X-BAPI-SIGN", signature);
    request.set_header("X-BAPI-RECV-WINDOW", recv_window);
    Ok(())
}

fn sign_passphrase(
    request: &mut OutboundRequest,
    api_key: &SecretString,
    api_secret: &SecretString,
    passphrase: &SecretString,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    let api_key = non_empty(api_key, "api_key")?;
    let api_secret = non_empty(api_secret, "api_secret")?;
    let passphrase = non_empty(passphrase, "passphrase")?;

    let timestamp = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let request_path = request.request_path()?;
    let body = request.body.as_deref().unwrap_or_default();

    let prefix = format!("{timestamp}{}{request_path}", request.method);
    let signature = STANDARD.encode(hmac_sha256(api_secret, &[prefix.as_bytes(), body])?);

    request.set_header("OK-ACCESS-KEY", api_key);
    request.set_header("OK-ACCESS-SIGN", signature);
    request.set_header("OK-ACCESS-TIMESTAMP", timestamp);
    request.set_header("OK-ACCESS-PASSPHRASE", passphrase);
    Ok(())
}

fn validate_headers(request: &OutboundRequest) -> Result<(), SigningError> {
    for (name, value) in &request.headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err()
        {
            return Err(SigningError::InvalidHeader(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeZone;

    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn at_millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn request(method: &str, target: &str, body: Option<&str>) -> OutboundRequest {
        OutboundRequest::from_target(
            method,
            "https://api.example.com",
            target,
            Vec::new(),
            body.map(|body| body.as_bytes().to_vec()),
        )
    }

    fn recv_window_credentials() -> Credentials {
        Credentials::HmacRecvWindow {
            api_key: secret("test-key"),
            api_secret: secret("test-secret"),
            recv_window: 5000,
        }
    }

    fn passphrase_credentials() -> Credentials {
        Credentials::HmacPassphrase {
            api_key: secret("test-key"),
            api_secret: secret("test-secret"),
            passphrase: secret("test-pass"),
        }
    }

    fn okx_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_bearer() {
        let mut req = request("GET", "/v1/balance", None);
        req.headers.push(("authorization".to_string(), "Bearer agent-supplied".to_string()));

        sign(&mut req, &Credentials::Bearer { token: secret("sk_test_123") }, at_millis(0)).unwrap();

        assert_eq!(req.header("Authorization"), Some("Bearer sk_test_123"));
        assert_eq!(
            req.headers.iter().filter(|(n, _)| n.eq_ignore_ascii_case("authorization")).count(),
            1
        );
    }

    #[test]
    fn test_static_headers_override_caller() {
        let mut req = request("GET", "/", None);
        req.headers.push(("x-api-key".to_string(), "spoofed".to_string()));
        req.headers.push(("Accept".to_string(), "application/json".to_string()));

        let credentials = Credentials::Headers {
            headers: vec![("X-Api-Key".to_string(), secret("real-key"))],
        };
        sign(&mut req, &credentials, at_millis(0)).unwrap();

        assert_eq!(req.header("x-api-key"), Some("real-key"));
        assert_eq!(req.header("accept"), Some("application/json"));
        assert_eq!(req.headers.len(), 2);
    }

    #[test]
    fn test_caller_routing_headers_are_dropped() {
        let mut req = request("GET", "/", None);
        for name in ["Host", "Content-Length", "Transfer-Encoding", "Connection", "Proxy-Authorization"] {
            req.headers.push((name.to_string(), "x".to_string()));
        }
        sign(&mut req, &Credentials::Bearer { token: secret("t") }, at_millis(0)).unwrap();
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn test_compression_and_cookies_are_dropped() {
        let mut req = request("GET", "/", None);
        req.headers.push(("Accept-Encoding".to_string(), "gzip, br".to_string()));
        req.headers.push(("cookie".to_string(), "session=abc".to_string()));
        req.headers.push(("Accept".to_string(), "application/json".to_string()));

        sign(&mut req, &Credentials::Bearer { token: secret("t") }, at_millis(0)).unwrap();

        assert_eq!(req.header("accept-encoding"), None);
        assert_eq!(req.header("cookie"), None);
        assert_eq!(req.header("accept"), Some("application/json"));
    }

    #[test]
    fn test_recv_window_signs_binary_body_bytes() {
        let mut text = request("POST", "/v5/order/create", Some(r#"{"symbol":"BTCUSDT"}"#));
        sign(&mut text, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();

        let mut binary = request("POST", "/v5/order/create", None);
        binary.body = Some(vec![0xff, 0x00, 0xfe]);
        sign(&mut binary, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();

        let expected = {
            let mut mac = HmacSha256::new_from_slice(b"test-secret").unwrap();
            mac.update(b"1700000000000test-key5000");
            mac.update(&[0xff, 0x00, 0xfe]);
            hex::encode(mac.finalize().into_bytes())
        };
        assert_eq!(binary.header("X-BAPI-SIGN"), Some(expected.as_str()));
        assert_ne!(binary.header("X-BAPI-SIGN"), text.header("X-BAPI-SIGN"));
    }

    #[test]
    fn test_query_signing_documented_vector() {
        let mut req = request(
            "POST",
            "/api/v3/order?symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000",
            None,
        );
        let credentials = Credentials::HmacQuery {
            api_key: secret("vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A"),
            api_secret: secret("NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j"),
        };
        sign(&mut req, &credentials, at_millis(1_499_827_319_559)).unwrap();

        assert_eq!(
            req.query,
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000\
             &timestamp=1499827319559\
             &signature=c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
        assert_eq!(
            req.header("X-MBX-APIKEY"),
            Some("vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A")
        );
    }

    #[test]
    fn test_query_signing_fixed_vector() {
        let mut req = request("GET", "/api/v3/ticker?symbol=BTCUSDT&category=spot", None);
        let credentials = Credentials::HmacQuery {
            api_key: secret("test-key"),
            api_secret: secret("test-secret"),
        };
        sign(&mut req, &credentials, at_millis(1_700_000_000_000)).unwrap();

        assert_eq!(
            req.query,
            "symbol=BTCUSDT&category=spot&timestamp=1700000000000\
             &signature=43cdafa0d2e4a5216ec3b11828a989509edc9eb37ba61699169b8807940d4163"
        );
    }

    #[test]
    fn test_query_signing_replaces_caller_timestamp_and_signature() {
        let mut req = request(
            "GET",
            "/api/v3/ticker?timestamp=1&symbol=BTCUSDT&signature=forged&category=spot",
            None,
        );
        let credentials = Credentials::HmacQuery {
            api_key: secret("test-key"),
            api_secret: secret("test-secret"),
        };
        sign(&mut req, &credentials, at_millis(1_700_000_000_000)).unwrap();

        assert!(req.query.starts_with("symbol=BTCUSDT&category=spot&timestamp=1700000000000&signature="));
        assert!(req.query.ends_with("43cdafa0d2e4a5216ec3b11828a989509edc9eb37ba61699169b8807940d4163"));
    }

    #[test]
    fn test_query_signing_without_query() {
        let mut req = request("GET", "/api/v3/account", None);
        let credentials = Credentials::HmacQuery {
            api_key: secret("test-key"),
            api_secret: secret("test-secret"),
        };
        sign(&mut req, &credentials, at_millis(1_700_000_000_000)).unwrap();

        assert_eq!(
            req.query,
            "timestamp=1700000000000\
             &signature=dccf2651b1d8329665bfddb0798eccd4650d986a9cfe5547b2f5822131e7620b"
        );
        assert_eq!(
            req.url(),
            format!("https://api.example.com/api/v3/account?{}", req.query)
        );
    }

    #[test]
    fn test_recv_window_get_signs_query() {
        let mut req = request("GET", "/v5/market/tickers?symbol=BTCUSDT&category=spot", None);
        sign(&mut req, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();

        assert_eq!(
            req.header("X-BAPI-SIGN"),
            Some("13c13514f92173fee359131962862c0ee30523625b9043357140795106f21677")
        );
        assert_eq!(req.header("X-BAPI-API-KEY"), Some("test-key"));
        assert_eq!(req.header("X-BAPI-TIMESTAMP"), Some("1700000000000"));
        assert_eq!(req.header("X-BAPI-RECV-WINDOW"), Some("5000"));
        assert_eq!(req.query, "symbol=BTCUSDT&category=spot");
    }

    #[test]
    fn test_recv_window_post_signs_body() {
        let mut req = request("POST", "/v5/order/create", Some(r#"{"symbol":"BTCUSDT"}"#));
        sign(&mut req, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();
        assert_eq!(
            req.header("X-BAPI-SIGN"),
            Some("ad4a9c032a0d60d4681fd3d756df211465acfb1d0e031ea630eb740d5054852b")
        );
    }

    #[test]
    fn test_recv_window_post_empty_body_never_signs_query() {
        let expected = Some("d8d5e71d8f986368aa5c13405f059ab6adb4f41df59d2f11bb056226b63457d6");

        let mut no_body = request("POST", "/v5/order/create?symbol=BTCUSDT&category=spot", None);
        sign(&mut no_body, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();
        assert_eq!(no_body.header("X-BAPI-SIGN"), expected);

        let mut empty_body = request("put", "/v5/order/amend?symbol=BTCUSDT", Some(""));
        sign(&mut empty_body, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();
        assert_eq!(empty_body.header("X-BAPI-SIGN"), expected);
    }

    #[test]
    fn test_recv_window_delete_without_query() {
        let mut req = request("delete", "/v5/order/cancel-all", Some("ignored"));
        sign(&mut req, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();
        assert_eq!(
            req.header("X-BAPI-SIGN"),
            Some("d8d5e71d8f986368aa5c13405f059ab6adb4f41df59d2f11bb056226b63457d6")
        );
    }

    #[test]
    fn test_passphrase_get_with_query() {
        let mut req = OutboundRequest::from_target(
            "GET",
            "https://www.okx.com",
            "/api/v5/account/balance?ccy=BTC",
            Vec::new(),
            None,
        );
        sign(&mut req, &passphrase_credentials(), okx_time()).unwrap();

        assert_eq!(req.header("OK-ACCESS-SIGN"), Some("HizPQSXiSU9q4kYm42z9KJQTLQGoM38nn8Q5rbWXqKo="));
        assert_eq!(req.header("OK-ACCESS-TIMESTAMP"), Some("2024-01-01T00:00:00.000Z"));
        assert_eq!(req.header("OK-ACCESS-KEY"), Some("test-key"));
        assert_eq!(req.header("OK-ACCESS-PASSPHRASE"), Some("test-pass"));
    }

    #[test]
    fn test_passphrase_post_body() {
        let mut req = OutboundRequest::from_target(
            "post",
            "https://www.okx.com/",
            "/api/v5/trade/order",
            Vec::new(),
            Some(br#"{"instId":"BTC-USDT"}"#.to_vec()),
        );
        sign(&mut req, &passphrase_credentials(), okx_time()).unwrap();
        assert_eq!(req.header("OK-ACCESS-SIGN"), Some("9KBSVQFNvWFtWsGPHr/laudonfdA131c4B+y6jaF8A0="));

        let mut empty = OutboundRequest::from_target(
            "POST",
            "https://www.okx.com",
            "/api/v5/trade/order",
            Vec::new(),
            None,
        );
        sign(&mut empty, &passphrase_credentials(), okx_time()).unwrap();
        assert_eq!(empty.header("OK-ACCESS-SIGN"), Some("wB8c0N0E0YQ+4FW7FtCTMs683rbN4dCrIr5P3nuQjSU="));
    }

    #[test]
    fn test_passphrase_includes_base_path_prefix() {
        let req = OutboundRequest::from_target(
            "GET",
            "https://gateway.example.com/okx/",
            "/api/v5/account/balance?ccy=BTC",
            Vec::new(),
            None,
        );
        assert_eq!(req.request_path().unwrap(), "/okx/api/v5/account/balance?ccy=BTC");
        assert_eq!(
            req.url(),
            "https://gateway.example.com/okx/api/v5/account/balance?ccy=BTC"
        );
    }

    #[test]
    fn test_signatures_are_deterministic() {
        let sign_once = || {
            let mut req = request("GET", "/v5/market/tickers?symbol=BTCUSDT&category=spot", None);
            sign(&mut req, &recv_window_credentials(), at_millis(1_700_000_000_000)).unwrap();
            req
        };
        assert_eq!(sign_once(), sign_once());
    }

    #[test]
    fn test_empty_credential_is_rejected() {
        let mut req = request("GET", "/", None);
        let credentials = Credentials::HmacQuery {
            api_key: secret("key"),
            api_secret: secret(""),
        };
        assert_eq!(
            sign(&mut req, &credentials, at_millis(0)),
            Err(SigningError::EmptyCredential("api_secret"))
        );
    }

    #[test]
    fn test_invalid_header_value_is_reported_by_name() {
        let mut req = request("GET", "/", None);
        let credentials = Credentials::Headers {
            headers: vec![("X-Key".to_string(), secret("bad\nvalue"))],
        };
        let err = sign(&mut req, &credentials, at_millis(0)).unwrap_err();
        assert_eq!(err, SigningError::InvalidHeader("X-Key".to_string()));
        assert!(!err.to_string().contains("bad"));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let debug = format!("{:?}", passphrase_credentials());
        assert!(!debug.contains("test-secret"));
        assert!(!debug.contains("test-pass"));
        assert!(debug.contains("hmac-passphrase"));
    }
}
