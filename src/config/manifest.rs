//! Injection manifest stored in Consul for each application.
//!
//! The manifest is YAML and mirrors the Kubernetes `env`/`valueFrom` shape:
//!
//! ```yaml
//! key: billing
//! env:
//!   - name: DB_PASS
//!     valueFrom:
//!       secretKeyRef: { name: db, key: password }
//! files:
//!   - { name: ca.pem, destination: /etc/ssl/ca.pem }
//! templates:
//!   - name: app.conf
//!     destination: /etc/app/app.conf
//!     env:
//!       - { name: USER, value: billing }
//! vault:
//!   - { name: db, path: secret/data/db }
//! consul:
//!   - { name: flags, type: json, path: billing/flags }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is empty")]
    Empty,
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_yaml::Error),
}

/// Declarative description of what to inject into the wrapped process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectionDefinition {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub files: Vec<FileSource>,
    #[serde(default)]
    pub templates: Vec<TemplateSource>,
    #[serde(default)]
    pub vault: Vec<Reference>,
    #[serde(default)]
    pub consul: Vec<Reference>,
}

impl InjectionDefinition {
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ManifestError::Empty);
        }
        Ok(serde_yaml::from_slice(bytes)?)
    }
}

/// A named pointer to a secret (Vault) or config value (Consul).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    /// Payload encoding; `json` enables key extraction from Consul values.
    #[serde(default, rename = "type")]
    pub kind: String,
    pub path: String,
}

impl Reference {
    pub fn is_json(&self) -> bool {
        self.kind == "json"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueSource>,
}

impl EnvVar {
    pub fn literal(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    pub fn from_secret(name: &str, ref_name: &str, key: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            value_from: Some(ValueSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: ref_name.to_string(),
                    key: key.to_string(),
                }),
                consul_key_ref: None,
            }),
        }
    }

    pub fn from_consul(name: &str, ref_name: &str, key: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            value_from: Some(ValueSource {
                secret_key_ref: None,
                consul_key_ref: Some(ConsulKeySelector {
                    name: ref_name.to_string(),
                    key: key.map(String::from),
                }),
            }),
        }
    }
}

/// Where a non-literal variable gets its value. When both selectors are
/// present the secret selector is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consul_key_ref: Option<ConsulKeySelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsulKeySelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A file copied verbatim from Consul `files/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSource {
    pub name: String,
    pub destination: PathBuf,
}

/// A template fetched from Consul `templates/<name>` and rendered with its
/// own `env` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSource {
    pub name: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}
