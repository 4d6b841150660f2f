//! Reference resolution: turns manifest `EnvVar` entries into concrete
//! strings using the secrets and config values fetched up front.

use crate::backends::{ConfigBackend, PayloadError, SecretBackend, SecretPayload};
use crate::config::{EnvVar, InjectionDefinition, Reference};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Why a single variable produced no value. Never fatal to the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("nothing found to do with '{var}'")]
    NoSource { var: String },

    #[error("could not find reference '{reference}' for '{var}'")]
    UnknownReference { var: String, reference: String },

    #[error("reference '{reference}' for '{var}': {source}")]
    Field {
        var: String,
        reference: String,
        #[source]
        source: PayloadError,
    },

    #[error("reference '{reference}' for '{var}' is not a JSON object: {message}")]
    Json {
        var: String,
        reference: String,
        message: String,
    },

    #[error("reference '{reference}' for '{var}' needs a key")]
    MissingKey { var: String, reference: String },

    #[error("'{var}' asks {expected} for '{reference}', but that name is a {found} reference")]
    WrongBackend {
        var: String,
        reference: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl ResolveError {
    pub fn var(&self) -> &str {
        match self {
            ResolveError::NoSource { var }
            | ResolveError::UnknownReference { var, .. }
            | ResolveError::Field { var, .. }
            | ResolveError::Json { var, .. }
            | ResolveError::MissingKey { var, .. }
            | ResolveError::WrongBackend { var, .. } => var,
        }
    }
}

/// Output of resolving one `env` list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub values: BTreeMap<String, String>,
    pub warnings: Vec<ResolveError>,
}

// ============================================================================
// Resolved references
// ============================================================================

/// Secrets and config values materialized once per run, keyed by reference
/// name. Read-only once the wrapped process is being prepared.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRefs {
    secrets: HashMap<String, (Reference, SecretPayload)>,
    config: HashMap<String, (Reference, Vec<u8>)>,
}

enum Found<'a> {
    Secret(&'a SecretPayload),
    Config(&'a Reference, &'a [u8]),
}

impl Found<'_> {
    fn backend(&self) -> &'static str {
        match self {
            Found::Secret(_) => VAULT,
            Found::Config(..) => CONSUL,
        }
    }
}

const VAULT: &str = "vault";
const CONSUL: &str = "consul";

impl ResolvedRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_secret(&mut self, reference: Reference, payload: SecretPayload) {
        self.secrets
            .insert(reference.name.clone(), (reference, payload));
    }

    pub fn insert_config(&mut self, reference: Reference, value: Vec<u8>) {
        self.config.insert(reference.name.clone(), (reference, value));
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    pub fn config_count(&self) -> usize {
        self.config.len()
    }

    /// Read every reference declared in the manifest. Failed or empty reads
    /// are logged and left out.
    pub async fn fetch(
        definition: &InjectionDefinition,
        secrets: &dyn SecretBackend,
        config: &dyn ConfigBackend,
    ) -> Self {
        let mut refs = Self::new();

        info!("Fetching vault secrets");
        for reference in &definition.vault {
            match secrets.read(&reference.path).await {
                Ok(Some(payload)) if !payload.is_empty() => {
                    refs.insert_secret(reference.clone(), payload);
                }
                Ok(_) => error!("No secret found at {}", reference.path),
                Err(e) => error!("Error during secret fetch for '{}': {}", reference.name, e),
            }
        }

        info!("Fetching consul values");
        for reference in &definition.consul {
            match config.get_value(&reference.path).await {
                Ok(Some(value)) => refs.insert_config(reference.clone(), value),
                Ok(None) => error!("Could not find any KV at path {}", reference.path),
                Err(e) => error!(
                    "Error while fetching consul path {}: {}",
                    reference.path, e
                ),
            }
        }

        info!(
            secrets = refs.secret_count(),
            config = refs.config_count(),
            "References resolved"
        );
        refs
    }

    /// Secret references shadow config references of the same name.
    fn find(&self, name: &str) -> Option<Found<'_>> {
        if let Some((_, payload)) = self.secrets.get(name) {
            return Some(Found::Secret(payload));
        }
        self.config
            .get(name)
            .map(|(reference, value)| Found::Config(reference, value.as_slice()))
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve an `env` list. Later entries win on duplicate names; failures are
/// collected in [`Resolution::warnings`] and the variable is left out.
pub fn resolve_env(env: &[EnvVar], refs: &ResolvedRefs) -> Resolution {
    let mut resolution = Resolution::default();

    for var in env {
        match resolve_var(var, refs) {
            Ok(value) => {
                debug!("Resolved env {}", var.name);
                resolution.values.insert(var.name.clone(), value);
            }
            Err(e) => {
                warn!("{}", e);
                resolution.warnings.push(e);
            }
        }
    }

    resolution
}

fn resolve_var(var: &EnvVar, refs: &ResolvedRefs) -> Result<String, ResolveError> {
    if let Some(literal) = var.value.as_deref().filter(|v| !v.is_empty()) {
        return Ok(literal.to_string());
    }

    let source = var.value_from.as_ref();
    let (ref_name, key, expected) = match (
        source.and_then(|s| s.secret_key_ref.as_ref()),
        source.and_then(|s| s.consul_key_ref.as_ref()),
    ) {
        (Some(secret), _) => (secret.name.as_str(), Some(secret.key.as_str()), VAULT),
        (None, Some(consul)) => (consul.name.as_str(), consul.key.as_deref(), CONSUL),
        (None, None) => {
            return Err(ResolveError::NoSource {
                var: var.name.clone(),
            })
        }
    };

    let found = refs
        .find(ref_name)
        .ok_or_else(|| ResolveError::UnknownReference {
            var: var.name.clone(),
            reference: ref_name.to_string(),
        })?;

    if found.backend() != expected {
        return Err(ResolveError::WrongBackend {
            var: var.name.clone(),
            reference: ref_name.to_string(),
            expected,
            found: found.backend(),
        });
    }

    match found {
        Found::Secret(payload) => extract_field(payload, key, &var.name, ref_name),
        Found::Config(reference, raw) if reference.is_json() => {
            let payload = parse_json_object(raw).map_err(|message| ResolveError::Json {
                var: var.name.clone(),
                reference: ref_name.to_string(),
                message,
            })?;
            extract_field(&payload, key, &var.name, ref_name)
        }
        Found::Config(_, raw) => Ok(String::from_utf8_lossy(raw).into_owned()),
    }
}

fn extract_field(
    payload: &SecretPayload,
    key: Option<&str>,
    var: &str,
    reference: &str,
) -> Result<String, ResolveError> {
    let key = key.filter(|k| !k.is_empty()).ok_or_else(|| ResolveError::MissingKey {
        var: var.to_string(),
        reference: reference.to_string(),
    })?;
    payload
        .get_str(key)
        .map(String::from)
        .map_err(|source| ResolveError::Field {
            var: var.to_string(),
            reference: reference.to_string(),
            source,
        })
}

fn parse_json_object(raw: &[u8]) -> Result<SecretPayload, String> {
    match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(SecretPayload::new(map)),
        Ok(other) => Err(format!("found {}", crate::backends::json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}
