//! In-memory backends for tests and dry runs.

use super::{BackendError, ConfigBackend, SecretBackend, SecretPayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default)]
struct SecretState {
    secrets: HashMap<String, SecretPayload>,
    failing_paths: Vec<String>,
    renew_results: VecDeque<bool>,
    renewals: Vec<(tokio::time::Instant, u64)>,
    revocations: usize,
}

/// Secret store backed by a map. Records every renewal and revocation so
/// tests can assert on lease handling.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretBackend {
    state: Arc<Mutex<SecretState>>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, payload: SecretPayload) {
        self.state.lock().secrets.insert(path.to_string(), payload);
    }

    /// Make reads of `path` fail with a backend error.
    pub fn fail_reads_at(&self, path: &str) {
        self.state.lock().failing_paths.push(path.to_string());
    }

    /// Queue outcomes for upcoming renewals; once drained, renewals succeed.
    pub fn script_renewals(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.state.lock().renew_results.extend(outcomes);
    }

    /// Instants (tokio clock) and increments of every renewal attempt.
    pub fn renewals(&self) -> Vec<(tokio::time::Instant, u64)> {
        self.state.lock().renewals.clone()
    }

    pub fn revocations(&self) -> usize {
        self.state.lock().revocations
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn read(&self, path: &str) -> Result<Option<SecretPayload>, BackendError> {
        let state = self.state.lock();
        if state.failing_paths.iter().any(|p| p == path) {
            return Err(BackendError::Unavailable(format!("read of '{path}' failed")));
        }
        Ok(state.secrets.get(path).cloned())
    }

    async fn renew_self(&self, increment_secs: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .renewals
            .push((tokio::time::Instant::now(), increment_secs));
        match state.renew_results.pop_front() {
            Some(false) => Err(BackendError::Unavailable("renewal rejected".into())),
            _ => Ok(()),
        }
    }

    async fn revoke_self(&self) -> Result<(), BackendError> {
        self.state.lock().revocations += 1;
        Ok(())
    }
}

/// KV store backed by a map.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigBackend {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryConfigBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, value: impl Into<Vec<u8>>) {
        self.values.lock().insert(path.to_string(), value.into());
    }
}

#[async_trait]
impl ConfigBackend for MemoryConfigBackend {
    async fn get_value(&self, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.values.lock().get(path).cloned())
    }
}
