//! Service, authentication, and capability configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::policy::{self, Decision, Rule};

/// A third-party HTTP API the broker authenticates against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Scheme, host, and optional path prefix of the API.
    pub base_url: String,
    pub auth: AuthConfig,
}

const fn default_recv_window() -> u64 {
    5000
}

/// How requests to a service are authenticated.
///
/// Every credential field holds a secret reference such as
/// `local://stripe/api-key`, never the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// A fixed set of headers, each value resolved from a reference.
    Headers { headers: BTreeMap<String, String> },
    /// HMAC-SHA256 over the query string, signature appended as a parameter.
    #[serde(alias = "hmac", alias = "hmac-binance")]
    HmacQuery { api_key: String, api_secret: String },
    /// HMAC-SHA256 over timestamp, key, and receive window, sent in headers.
    #[serde(alias = "hmac-bybit")]
    HmacRecvWindow {
        api_key: String,
        api_secret: String,
        #[serde(default = "default_recv_window")]
        recv_window: u64,
    },
    /// Base64 HMAC-SHA256 with an additional passphrase header.
    #[serde(alias = "hmac-okx")]
    HmacPassphrase {
        api_key: String,
        api_secret: String,
        passphrase: String,
    },
}

impl AuthConfig {
    /// Stable name of the scheme, as written in configuration.
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

    /// Every secret reference this descriptor needs, keyed by field name.
    ///
    /// For static headers the field name is the header name.
    #[must_use]
    pub fn secret_references(&self) -> Vec<(&str, &str)> {
        match self {
            Self::Bearer { token } => vec![("token", token.as_str())],
            Self::Headers { headers } => headers
                .iter()
                .map(|(name, reference)| (name.as_str(), reference.as_str()))
                .collect(),
            Self::HmacQuery {
                api_key,
                api_secret,
            }
            | Self::HmacRecvWindow {
                api_key,
                api_secret,
                ..
            } => vec![("api_key", api_key.as_str()), ("api_secret", api_secret.as_str())],
            Self::HmacPassphrase {
                api_key,
                api_secret,
                passphrase,
            } => vec![
                ("api_key", api_key.as_str()),
                ("api_secret", api_secret.as_str()),
                ("passphrase", passphrase.as_str()),
            ],
        }
    }
}

/// A named, policy-scoped grant of access to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Name of the service this capability grants access to.
    pub service: String,
    /// Lifetime of sessions created for this capability.
    pub ttl: Ttl,
    /// Ordered access rules, first match wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// With no rules, allow every request instead of denying.
    #[serde(default)]
    pub auto_approve: bool,
    /// Reject requests that carry no reason.
    #[serde(default)]
    pub requires_reason: bool,
}

impl CapabilityConfig {
    /// Evaluates a request against this capability's rules.
    #[must_use]
    pub fn evaluate(&self, method: &str, path: &str) -> Decision {
        policy::evaluate(&self.rules, self.auto_approve, method, path)
    }
}

/// Errors produced while parsing a TTL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TtlError {
    #[error("ttl must be greater than zero")]
    Zero,
    #[error("invalid ttl '{0}': expected seconds or a number with suffix s, m, h, or d")]
    Invalid(String),
    #[error("ttl '{0}' is too large")]
    Overflow(String),
    #[error("ttl of {0}s exceeds the maximum of 365d")]
    TooLong(u64),
}

/// Longest session lifetime accepted (365 days).
pub const MAX_TTL_SECS: u64 = 365 * 86_400;

/// Session lifetime. Never zero, never longer than [`MAX_TTL_SECS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ttl(Duration);

impl Ttl {
    /// Creates a TTL of `secs` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`TtlError::Zero`] if `secs` is zero and
    /// [`TtlError::TooLong`] if it exceeds [`MAX_TTL_SECS`].
    pub const fn from_secs(secs: u64) -> Result<Self, TtlError> {
        if secs == 0 {
            return Err(TtlError::Zero);
        }
        if secs > MAX_TTL_SECS {
            return Err(TtlError::TooLong(secs));
        }
        Ok(Self(Duration::from_secs(secs)))
    }

    #[must_use]
    pub const fn as_duration(self) -> Duration {
        self.0
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0.as_secs()
    }
}

impl FromStr for Ttl {
    type Err = TtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, multiplier) = match s.as_bytes().last() {
            Some(b's') => (&s[..s.len() - 1], 1),
            Some(b'm') => (&s[..s.len() - 1], 60),
            Some(b'h') => (&s[..s.len() - 1], 3600),
            Some(b'd') => (&s[..s.len() - 1], 86_400),
            _ => (s, 1),
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TtlError::Invalid(s.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| TtlError::Overflow(s.to_string()))?;
        let secs = value
            .checked_mul(multiplier)
            .ok_or_else(|| TtlError::Overflow(s.to_string()))?;
        Self::from_secs(secs)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.as_secs();
        if secs % 86_400 == 0 {
            write!(f, "{}d", secs / 86_400)
        } else if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for Ttl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ttl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Self::from_secs(secs),
            Raw::Text(text) => text.parse(),
        }
        .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_ttl_parsing() {
        assert_eq!("90".parse::<Ttl>().unwrap().as_secs(), 90);
        assert_eq!("30s".parse::<Ttl>().unwrap().as_secs(), 30);
        assert_eq!("15m".parse::<Ttl>().unwrap().as_secs(), 900);
        assert_eq!("1h".parse::<Ttl>().unwrap().as_secs(), 3600);
        assert_eq!("2d".parse::<Ttl>().unwrap().as_secs(), 172_800);
    }

    #[test]
    fn test_ttl_rejects_zero_and_garbage() {
        assert_eq!("0".parse::<Ttl>(), Err(TtlError::Zero));
        assert_eq!("0m".parse::<Ttl>(), Err(TtlError::Zero));
        assert!(matches!("h".parse::<Ttl>(), Err(TtlError::Invalid(_))));
        assert!(matches!("-5s".parse::<Ttl>(), Err(TtlError::Invalid(_))));
        assert!(matches!("1w".parse::<Ttl>(), Err(TtlError::Invalid(_))));
        assert!(matches!(
            "99999999999999999999d".parse::<Ttl>(),
            Err(TtlError::Overflow(_))
        ));
    }

    #[test]
    fn test_ttl_upper_bound() {
        assert_eq!("365d".parse::<Ttl>().unwrap().as_secs(), MAX_TTL_SECS);
        assert_eq!(
            "10000000000000s".parse::<Ttl>(),
            Err(TtlError::TooLong(10_000_000_000_000))
        );
        assert_eq!("366d".parse::<Ttl>(), Err(TtlError::TooLong(366 * 86_400)));
        assert_eq!(Ttl::from_secs(MAX_TTL_SECS + 1), Err(TtlError::TooLong(MAX_TTL_SECS + 1)));

        let err = toml::from_str::<CapabilityConfig>(
            r#"
service = "stripe"
ttl = "10000000000000s"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
    }

    #[test]
    fn test_ttl_display_uses_largest_unit() {
        assert_eq!(Ttl::from_secs(3600).unwrap().to_string(), "1h");
        assert_eq!(Ttl::from_secs(90).unwrap().to_string(), "90s");
        assert_eq!(Ttl::from_secs(120).unwrap().to_string(), "2m");
        assert_eq!(Ttl::from_secs(86_400).unwrap().to_string(), "1d");
    }

    #[test]
    fn test_capability_from_toml() {
        let capability: CapabilityConfig = toml::from_str(
            r#"
            service = "stripe"
            ttl = "1h"
            rules = ["allow GET /v1/*", "deny * *"]
            requires_reason = true
            "#,
        )
        .unwrap();

        assert_eq!(capability.service, "stripe");
        assert_eq!(capability.ttl.as_secs(), 3600);
        assert_eq!(capability.rules.len(), 2);
        assert!(!capability.auto_approve);
        assert!(capability.requires_reason);
        assert!(capability.evaluate("GET", "/v1/charges").allowed);
        assert!(!capability.evaluate("POST", "/v1/charges").allowed);
    }

    #[test]
    fn test_capability_integer_ttl() {
        let capability: CapabilityConfig = toml::from_str(
            r#"
            service = "github"
            ttl = 600
            "#,
        )
        .unwrap();
        assert_eq!(capability.ttl.as_secs(), 600);
        assert!(capability.rules.is_empty());
    }

    #[test]
    fn test_capability_rejects_zero_ttl_and_bad_rule() {
        assert!(toml::from_str::<CapabilityConfig>("service = \"s\"\nttl = 0").is_err());
        assert!(
            toml::from_str::<CapabilityConfig>("service = \"s\"\nttl = 5\nrules = [\"allow\"]")
                .is_err()
        );
    }

    #[test]
    fn test_auth_variants_and_aliases() {
        let service: ServiceConfig = toml::from_str(
            r#"
            base_url = "https://api.bybit.com"
            auth = { type = "hmac-bybit", api_key = "env://BYBIT_KEY", api_secret = "local://bybit/secret" }
            "#,
        )
        .unwrap();
        assert_eq!(
            service.auth,
            AuthConfig::HmacRecvWindow {
                api_key: "env://BYBIT_KEY".to_string(),
                api_secret: "local://bybit/secret".to_string(),
                recv_window: 5000,
            }
        );
        assert_eq!(service.auth.scheme(), "hmac-recv-window");

        let binance: AuthConfig =
            toml::from_str("type = \"hmac\"\napi_key = \"k\"\napi_secret = \"s\"").unwrap();
        assert_eq!(binance.scheme(), "hmac-query");

        let okx: AuthConfig = toml::from_str(
            "type = \"hmac-okx\"\napi_key = \"k\"\napi_secret = \"s\"\npassphrase = \"p\"",
        )
        .unwrap();
        assert_eq!(okx.secret_references().len(), 3);
    }

    #[test]
    fn test_auth_missing_field_fails_at_load() {
        let result: Result<AuthConfig, _> =
            toml::from_str("type = \"hmac-passphrase\"\napi_key = \"k\"\napi_secret = \"s\"");
        assert!(result.is_err());

        let unknown: Result<AuthConfig, _> = toml::from_str("type = \"digest\"\ntoken = \"t\"");
        assert!(unknown.is_err());
    }

    #[test]
    fn test_header_references() {
        let auth: AuthConfig = toml::from_str(
            r#"
            type = "headers"
            headers = { "X-Api-Key" = "local://svc/key", "X-Tenant" = "env://TENANT" }
            "#,
        )
        .unwrap();
        let refs = auth.secret_references();
        assert_eq!(
            refs,
            vec![("X-Api-Key", "local://svc/key"), ("X-Tenant", "env://TENANT")]
        );
    }
}
