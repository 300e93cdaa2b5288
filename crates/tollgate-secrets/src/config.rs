//! Provider configuration as it appears under `[providers.<name>]`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProviderError, Result};

/// Configuration of one provider instance.
///
/// `type` selects the constructor; the remaining keys are handed to it and
/// parsed into that provider's own options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Map::new(),
        }
    }

    /// Adds an option, builder style.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parses the options into a provider-specific type.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Internal`] naming the provider if an option is
    /// missing, unknown, or has the wrong type.
    pub fn parse_options<T: DeserializeOwned>(&self, provider: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.options.clone())).map_err(|e| {
            ProviderError::internal(provider, format!("invalid {} provider options: {e}", self.kind))
        })
    }
}
