use std::env;
use std::fmt;

use crate::DeepQueryError;

/// An API key read from the environment. Never printed, not even in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***redacted***")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***redacted***")
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Read a secret from `var`; unset or blank is `MissingSecret`.
pub fn require_env(var: &str) -> Result<SecretValue, DeepQueryError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue::new(value)),
        _ => Err(DeepQueryError::MissingSecret(var.to_string())),
    }
}

/// Like [`require_env`] for secrets a backend can run without: no variable
/// name means no secret, a named but unset variable is still an error.
pub fn optional_env(var: Option<&str>) -> Result<Option<SecretValue>, DeepQueryError> {
    match var.map(str::trim) {
        Some(name) if !name.is_empty() => require_env(name).map(Some),
        _ => Ok(None),
    }
}
