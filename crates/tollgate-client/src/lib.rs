//! # tollgate-client
//!
//! Outbound side of the broker: turns a resolved credential and a request
//! shape into exactly the headers and query parameters a third-party API
//! expects, then sends the request.
//!
//! - [`signer`]: bearer tokens, static headers, and three HMAC-SHA256 schemes
//! - [`upstream`]: `reqwest` client with bounded timeouts and response redaction
//!
//! ## Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use secrecy::SecretString;
//! use tollgate_client::{sign, Credentials, OutboundRequest};
//!
//! let mut request = OutboundRequest::builder()
//!     .method("GET")
//!     .base_url("https://api.binance.com")
//!     .path("/api/v3/account")
//!     .query("recvWindow=5000")
//!     .build();
//!
//! let credentials = Credentials::HmacQuery {
//!     api_key: SecretString::from("key".to_string()),
//!     api_secret: SecretString::from("secret".to_string()),
//! };
//!
//! let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
//! sign(&mut request, &credentials, now).unwrap();
//! assert!(request.query.starts_with("recvWindow=5000&timestamp=1700000000000&signature="));
//! assert_eq!(request.header("X-MBX-APIKEY"), Some("key"));
//! ```

pub mod error;
pub mod signer;
pub mod upstream;

pub use error::{ClientError, SigningError};
pub use signer::{Credentials, OutboundRequest, sign};
pub use upstream::{UpstreamClient, UpstreamResponse};
