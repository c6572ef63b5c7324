//! Reading and compiling the service-name pattern that governs which peers
//! this Object Manager watches, and the well-known name it claims for
//! itself.

use std::env;

use regex::Regex;

use crate::{
    error::Error,
    types::{DEFAULT_SERVICE_NAME_PATTERN, SERVICE_NAME_PATTERN_ENV},
};

/// Compiled form of `DBUS_SERVICE_NAME_PATTERN`.
///
/// Used both to recognize peer services worth watching and as the prefix
/// for this connection's own claimed well-known name.
#[derive(Debug, Clone)]
pub struct ServiceNamePattern {
    raw: String,
    regex: Regex,
}

impl ServiceNamePattern {
    /// Reads `DBUS_SERVICE_NAME_PATTERN` from the environment, falling back
    /// to [`DEFAULT_SERVICE_NAME_PATTERN`] when unset or empty.
    ///
    /// # Errors
    /// Returns an error if the pattern does not compile as a regex.
    pub fn from_env() -> Result<Self, Error> {
        let raw = env::var(SERVICE_NAME_PATTERN_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME_PATTERN.to_string());

        Self::new(raw)
    }

    /// Compiles an explicit pattern, bypassing the environment.
    ///
    /// # Errors
    /// Returns an error if `raw` does not compile as a regex.
    pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        let regex = Regex::new(&raw).map_err(|source| Error::InvalidServiceNamePattern {
            pattern: raw.clone(),
            source,
        })?;
        Ok(Self { raw, regex })
    }

    /// Whether `name` matches this pattern.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The raw, uncompiled pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod new {
        use super::*;

        #[test]
        fn accepts_default_pattern() {
            let pattern = ServiceNamePattern::new(DEFAULT_SERVICE_NAME_PATTERN).unwrap();
            assert!(pattern.matches("qface.service.Xabc123"));
        }

        #[test]
        fn rejects_invalid_regex() {
            let result = ServiceNamePattern::new("(unterminated");
            assert!(result.is_err());
        }
    }

    mod matches {
        use super::*;

        #[test]
        fn rejects_unrelated_names() {
            let pattern = ServiceNamePattern::new(DEFAULT_SERVICE_NAME_PATTERN).unwrap();
            assert!(!pattern.matches("org.freedesktop.Notifications"));
        }
    }
}
