//! Secret (Vault) and configuration (Consul KV) backends.
//!
//! The rest of the crate only sees the two traits below, so the HTTP clients
//! can be swapped for the in-memory implementations in tests.

pub mod consul;
pub mod memory;
pub mod vault;

pub use consul::ConsulClient;
pub use memory::{MemoryConfigBackend, MemorySecretBackend};
pub use vault::VaultClient;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend} request to '{path}' failed: {source}")]
    Http {
        backend: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend} returned {status} for '{path}': {body}")]
    Status {
        backend: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    #[error("could not decode {backend} response for '{path}': {message}")]
    Decode {
        backend: &'static str,
        path: String,
        message: String,
    },

    #[error("invalid {backend} address '{addr}': {message}")]
    Address {
        backend: &'static str,
        addr: String,
        message: String,
    },

    #[error("could not read token file '{path}': {source}")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Unavailable(String),
}

/// Failure to pull a typed field out of a secret payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("field '{key}' is not present")]
    Missing { key: String },
    #[error("field '{key}' is a {found}, expected a string")]
    NotAString { key: String, found: &'static str },
}

// ============================================================================
// Payloads
// ============================================================================

/// The `data` object of a secret read. Values are kept dynamically typed;
/// callers go through [`SecretPayload::get_str`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretPayload {
    data: Map<String, Value>,
}

impl SecretPayload {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Result<&str, PayloadError> {
        match self.data.get(key) {
            None => Err(PayloadError::Missing { key: key.to_string() }),
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(PayloadError::NotAString {
                key: key.to_string(),
                found: json_kind(other),
            }),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for SecretPayload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Backend traits
// ============================================================================

/// Credential-bearing secret store.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Read the secret at `path`. `Ok(None)` when nothing is stored there.
    async fn read(&self, path: &str) -> Result<Option<SecretPayload>, BackendError>;

    /// Extend the lease of the backend's own token.
    async fn renew_self(&self, increment_secs: u64) -> Result<(), BackendError>;

    /// Revoke the backend's own token.
    async fn revoke_self(&self) -> Result<(), BackendError>;
}

/// Key/value configuration store.
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// Raw value at `path`. `Ok(None)` when the key does not exist.
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>, BackendError>;
}

/// Mask a secret for log output (first and last two chars).
pub fn redact_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}…{tail}")
}
