/// Default configuration constants used across the system.

/// File holding the bootstrap Vault token (projected by the pod spec).
pub const DEFAULT_VAULT_SECRET_PATH: &str = "/var/run/secrets/vaultproject.io/secret.json";

/// Vault path of the secret that hands out the Consul token.
pub const DEFAULT_CONSUL_TOKEN_PATH: &str = "consul/creds/readonly";

/// Consul KV root holding per-application manifests.
pub const DEFAULT_CONSUL_CONFIG_ROOT: &str = "kube-pod-decorator";

/// Default lease requested on each renewal (10 minutes).
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 600;

/// Default delay before retrying a failed renewal.
pub const DEFAULT_RENEW_RETRY_INTERVAL_SECS: u64 = 10;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_VAULT_ADDR: &str = "http://127.0.0.1:8200";

pub const DEFAULT_CONSUL_ADDR: &str = "http://127.0.0.1:8500";

/// Field of the bootstrap secret carrying the Consul token.
pub const CONSUL_TOKEN_FIELD: &str = "token";
