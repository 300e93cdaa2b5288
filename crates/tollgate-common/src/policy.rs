//! Method/path access rules and their evaluation.
//!
//! A rule is written as `"<allow|deny> <METHOD|*> <path-pattern>"`. Rules are
//! evaluated in declared order and the first matching rule decides the
//! verdict. When nothing matches, the request is denied.
//!
//! Path patterns:
//! - `*` on its own matches every path.
//! - A trailing `*` matches any remaining suffix, including further `/`
//!   separated segments (`/v1/*`, `/v1/cust*`).
//! - A `*` anywhere else matches one or more characters within a single
//!   segment (`/v1/*/charges`).
//! - Everything else is literal and case-sensitive.
//!
//! Query strings are never part of matching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a rule string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    /// The rule did not consist of exactly three whitespace separated parts.
    #[error("rule '{0}' must have the form '<allow|deny> <METHOD|*> <path>'")]
    Malformed(String),
    /// The effect was neither `allow` nor `deny`.
    #[error("unknown rule effect '{0}', expected 'allow' or 'deny'")]
    UnknownEffect(String),
    /// The method was not `*` or an HTTP method token.
    #[error("invalid method pattern '{0}'")]
    InvalidMethod(String),
    /// The path pattern was not `*` and did not start with `/`.
    #[error("invalid path pattern '{0}': must be '*' or start with '/'")]
    InvalidPath(String),
}

/// Whether a matching rule grants or refuses the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

impl FromStr for Effect {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("allow") {
            Ok(Self::Allow)
        } else if s.eq_ignore_ascii_case("deny") {
            Ok(Self::Deny)
        } else {
            Err(RuleError::UnknownEffect(s.to_string()))
        }
    }
}

/// HTTP method half of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodPattern {
    /// Matches every method.
    Any,
    /// Matches one method, compared case-insensitively. Stored uppercase.
    Exact(String),
}

impl MethodPattern {
    /// Returns true if `method` satisfies this pattern.
    #[must_use]
    pub fn matches(&self, method: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected.eq_ignore_ascii_case(method),
        }
    }
}

impl FromStr for MethodPattern {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Any);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(RuleError::InvalidMethod(s.to_string()));
        }
        Ok(Self::Exact(s.to_ascii_uppercase()))
    }
}

impl fmt::Display for MethodPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(method) => f.write_str(method),
        }
    }
}

/// Glob-style path half of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    pattern: String,
}

impl PathPattern {
    /// Returns true if `path` (without query string) satisfies this pattern.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        glob_match(self.pattern.as_bytes(), path.as_bytes())
    }

    /// The pattern as written, with runs of `*` collapsed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl FromStr for PathPattern {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s != "*" && !s.starts_with('/') {
            return Err(RuleError::InvalidPath(s.to_string()));
        }

        let mut pattern = String::with_capacity(s.len());
        for c in s.chars() {
            if c == '*' && pattern.ends_with('*') {
                continue;
            }
            pattern.push(c);
        }
        Ok(Self { pattern })
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', [])) => true,
        Some((b'*', rest)) => {
            let run = text.iter().take_while(|&&b| b != b'/').count();
            (1..=run).any(|n| glob_match(rest, &text[n..]))
        }
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// One ordered access rule of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rule {
    pub effect: Effect,
    pub method: MethodPattern,
    pub path: PathPattern,
}

impl Rule {
    /// Returns true if the rule applies to this method and path.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.matches(method) && self.path.matches(path)
    }
}

impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let [effect, method, path] = parts.as_slice() else {
            return Err(RuleError::Malformed(s.to_string()));
        };

        Ok(Self {
            effect: effect.parse()?,
            method: method.parse()?,
            path: path.parse()?,
        })
    }
}

impl TryFrom<String> for Rule {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rule> for String {
    fn from(rule: Rule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.effect, self.method, self.path)
    }
}

/// Outcome of evaluating a request against a capability's rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Index of the rule that decided, if any rule matched.
    pub matched_rule: Option<usize>,
    /// Human-readable explanation, recorded in the audit log on denial.
    pub reason: String,
}

impl Decision {
    fn allow(matched_rule: Option<usize>, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            matched_rule,
            reason: reason.into(),
        }
    }

    fn deny(matched_rule: Option<usize>, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            matched_rule,
            reason: reason.into(),
        }
    }
}

/// Evaluates `method` and `path` against `rules`, first match wins.
///
/// An empty rule list allows everything only when `auto_approve` is set.
/// Any query string on `path` is ignored.
#[must_use]
pub fn evaluate(rules: &[Rule], auto_approve: bool, method: &str, path: &str) -> Decision {
    if rules.is_empty() {
        return if auto_approve {
            Decision::allow(None, "no rules configured, capability is auto-approved")
        } else {
            Decision::deny(None, "no rules configured")
        };
    }

    let path = path.split_once('?').map_or(path, |(p, _)| p);

    rules
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.matches(method, path))
        .map_or_else(
            || Decision::deny(None, "no matching rule"),
            |(index, rule)| match rule.effect {
                Effect::Allow => Decision::allow(Some(index), format!("allowed by rule '{rule}'")),
                Effect::Deny => Decision::deny(Some(index), format!("denied by rule '{rule}'")),
            },
        )
}
