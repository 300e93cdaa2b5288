//! Secrets read from environment variables.
//!
//! The reference path names the variable: `env://STRIPE_API_KEY`.

use std::env::VarError;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::env::SharedEnv;
use crate::error::{ProviderError, Result};
use crate::provider::SecretProvider;
use crate::reference::{ProviderReference, SecretPath};
use crate::registry::ProviderContext;

/// Read-only provider over the process environment.
pub struct EnvProvider {
    name: String,
    env: SharedEnv,
}

impl EnvProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, env: SharedEnv) -> Self {
        Self {
            name: name.into(),
            env,
        }
    }

    pub(crate) fn construct(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SecretProvider>> {
        if !ctx.config.options.is_empty() {
            return Err(ProviderError::internal(ctx.name, "env provider takes no options"));
        }
        Ok(Arc::new(Self::new(ctx.name, Arc::clone(ctx.env))))
    }

    fn variable<'a>(&self, path: &'a SecretPath) -> Result<&'a str> {
        if path.depth() == 1 {
            Ok(path.as_str())
        } else {
            Err(ProviderError::InvalidPath(format!(
                "'{path}': env references name a single variable"
            )))
        }
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "env"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get_secret(
        &self,
        path: &SecretPath,
        field: Option<&str>,
    ) -> Result<Option<SecretString>> {
        if field.is_some() {
            return Err(ProviderError::invalid_reference(
                &format!("{}://{path}", self.name),
                "environment variables have no fields",
            ));
        }
        match self.env.var(self.variable(path)?) {
            Ok(value) => Ok(Some(SecretString::from(value))),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(ProviderError::internal(
                &self.name,
                format!("variable {path} is not valid UTF-8"),
            )),
        }
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn validate_reference(&self, reference: &ProviderReference) -> Result<()> {
        if reference.field().is_some() {
            return Err(ProviderError::invalid_reference(
                &reference.to_string(),
                "environment variables have no fields",
            ));
        }
        self.variable(reference.path()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use secrecy::ExposeSecret;

    use super::*;
    use crate::env::MapEnv;

    fn provider() -> EnvProvider {
        EnvProvider::new(
            "env",
            Arc::new(MapEnv::new().with("GITHUB_TOKEN", "ghp_example")),
        )
    }

    #[tokio::test]
    async fn test_reads_variable() {
        let provider = provider();
        let path = SecretPath::parse("GITHUB_TOKEN").unwrap();
        let value = provider.get_secret(&path, None).await.unwrap().unwrap();
        assert_eq!(value.expose_secret(), "ghp_example");
    }

    #[tokio::test]
    async fn test_absent_variable_is_none() {
        let provider = provider();
        let path = SecretPath::parse("NOT_SET").unwrap();
        assert!(provider.get_secret(&path, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nested_path_is_invalid() {
        let provider = provider();
        let path = SecretPath::parse("a/b").unwrap();
        assert!(matches!(
            provider.get_secret(&path, None).await.unwrap_err(),
            ProviderError::InvalidPath(_)
        ));

        let reference = ProviderReference::parse("env://a/b", "env").unwrap();
        assert!(provider.validate_reference(&reference).is_err());
    }

    #[tokio::test]
    async fn test_env_is_read_only() {
        let provider = provider();
        let path = SecretPath::parse("X").unwrap();
        let err = provider
            .set_secret(&path, None, &SecretString::from("v".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
    }
}
