//! Secret references and canonical secret paths.

use std::fmt;

use crate::error::{ProviderError, Result};

/// A validated, canonical secret path such as `exchanges/bybit`.
///
/// Canonicalization drops empty and `.` segments. Parsing rejects `..`,
/// backslashes, percent-encodings, control characters, and any segment
/// character outside `[A-Za-z0-9._@+-]`, so a path can never name anything
/// outside the provider's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretPath(String);

impl SecretPath {
    /// Parses and canonicalizes `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidPath`] if the path is empty after
    /// canonicalization or contains a forbidden sequence.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| ProviderError::InvalidPath(format!("'{raw}': {reason}"));

        if raw.contains('\\') {
            return Err(invalid("backslashes are not allowed"));
        }
        if raw.contains('%') {
            return Err(invalid("percent-encoding is not allowed"));
        }
        if raw.chars().any(char::is_control) {
            return Err(invalid("control characters are not allowed"));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(invalid("parent directory segments are not allowed")),
                _ if !segment.chars().all(is_segment_char) => {
                    return Err(invalid("segments may only contain A-Z a-z 0-9 . _ @ + -"));
                }
                _ => segments.push(segment),
            }
        }

        if segments.is_empty() {
            return Err(invalid("path is empty"));
        }
        Ok(Self(segments.join("/")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Number of `/` separated segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().count()
    }
}

const fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '+' | '-')
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed `provider://path#field` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderReference {
    provider: String,
    path: SecretPath,
    field: Option<String>,
}

impl ProviderReference {
    /// Parses `raw`, resolving a bare path against `default_provider`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidReference`] for a malformed provider
    /// name or field selector, and [`ProviderError::InvalidPath`] for a path
    /// that fails canonicalization.
    pub fn parse(raw: &str, default_provider: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::invalid_reference(raw, "reference is empty"));
        }

        let (provider, rest) = match trimmed.split_once("://") {
            Some((provider, rest)) => (provider, rest),
            None => (default_provider, trimmed),
        };
        if !is_provider_name(provider) {
            return Err(ProviderError::invalid_reference(
                raw,
                format!("provider name '{provider}' must match [a-z0-9_-]+"),
            ));
        }

        let (path, field) = match rest.split_once('#') {
            Some((path, field)) => {
                if field.is_empty() || !field.chars().all(is_field_char) {
                    return Err(ProviderError::invalid_reference(
                        raw,
                        "field selector must match [A-Za-z0-9._-]+",
                    ));
                }
                (path, Some(field.to_string()))
            }
            None => (rest, None),
        };

        Ok(Self {
            provider: provider.to_string(),
            path: SecretPath::parse(path)?,
            field,
        })
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub const fn path(&self) -> &SecretPath {
        &self.path
    }

    #[must_use]
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }
}

/// True if `name` is a syntactically valid provider name.
#[must_use]
pub fn is_provider_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

const fn is_field_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl fmt::Display for ProviderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.provider, self.path)?;
        if let Some(field) = &self.field {
            write!(f, "#{field}")?;
        }
        Ok(())
    }
}
