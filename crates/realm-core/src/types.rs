//! Shared types used across Realmwatch crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Unique identifier of a realm (its canister principal).
pub type Principal = String;

// ── Realm configuration ────────────────────────────────────────────

/// A monitored realm.
///
/// Keyed by `principal`, which never changes once the realm is registered.
/// `enabled = false` pauses scheduling but keeps the realm and its history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealmConfig {
    pub principal: Principal,
    /// Endpoint of the realm. Defaults to the canister's `ic0.app` URL.
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "name")]
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-realm fetch interval; falls back to the scheduler default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealmConfigError {
    #[error("realm principal must not be empty")]
    EmptyPrincipal,

    #[error("realm principal contains whitespace: {0:?}")]
    InvalidPrincipal(String),

    #[error("fetch interval for {0} must be greater than zero")]
    ZeroInterval(Principal),
}

impl RealmConfig {
    pub fn new(principal: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            url: url.into(),
            display_name: String::new(),
            enabled: true,
            interval_secs: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate the config and fill in defaults for the URL and name.
    pub fn normalized(mut self) -> Result<Self, RealmConfigError> {
        self.principal = self.principal.trim().to_string();
        if self.principal.is_empty() {
            return Err(RealmConfigError::EmptyPrincipal);
        }
        if self.principal.chars().any(char::is_whitespace) {
            return Err(RealmConfigError::InvalidPrincipal(self.principal));
        }
        if self.interval_secs == Some(0) {
            return Err(RealmConfigError::ZeroInterval(self.principal));
        }

        self.url = self.url.trim().to_string();
        if self.url.is_empty() {
            self.url = format!("https://{}.ic0.app", self.principal);
        }
        if self.display_name.trim().is_empty() {
            let short: String = self.principal.chars().take(8).collect();
            self.display_name = format!("Realm {short}...");
        }
        Ok(self)
    }
}

// ── Status payload ─────────────────────────────────────────────────

/// The raw status document returned by a realm.
///
/// Stored verbatim. The only structural guarantee checked on construction
/// is that the top level is a JSON object; everything below it is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusPayload(Value);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Decode(String),

    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

impl StatusPayload {
    pub fn new(value: Value) -> Result<Self, PayloadError> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err(PayloadError::NotAnObject(json_kind(&value)))
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PayloadError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| PayloadError::Decode(e.to_string()))?;
        Self::new(value)
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Short name of a JSON value's type, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
