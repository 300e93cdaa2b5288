//! Environment access behind a trait, so lookups can be substituted in tests.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

/// Reads environment variables.
pub trait ReadEnv {
    /// Returns the value of `key`, with the same semantics as [`std::env::var`].
    ///
    /// # Errors
    ///
    /// Returns [`env::VarError::NotPresent`] if the variable is unset, or
    /// [`env::VarError::NotUnicode`] if its value is not valid UTF-8.
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}

/// Environment shared between providers and the daemon.
pub type SharedEnv = Arc<dyn ReadEnv + Send + Sync>;

/// Delegates to the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}

/// Fixed in-memory environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl ReadEnv for MapEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        self.vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_env_delegation() {
        let std_result = std::env::var("PATH");
        let provider_result = SystemEnv.var("PATH");
        assert_eq!(std_result.is_ok(), provider_result.is_ok());
    }

    #[test]
    fn test_map_env() {
        let env = MapEnv::new().with("TOLLGATE_TEST", "value");
        assert_eq!(env.var("TOLLGATE_TEST").as_deref(), Ok("value"));
        assert_eq!(env.var("MISSING"), Err(env::VarError::NotPresent));
    }
}
