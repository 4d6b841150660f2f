use crate::config::{
    DEFAULT_CONSUL_ADDR, DEFAULT_CONSUL_CONFIG_ROOT, DEFAULT_CONSUL_TOKEN_PATH,
    DEFAULT_LOG_LEVEL, DEFAULT_VAULT_ADDR, DEFAULT_VAULT_SECRET_PATH,
};
use clap::Parser;

/// Command line surface. Every option can also be supplied through the
/// environment, which is how the decorator is normally configured inside a
/// pod spec.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pod-decorator",
    version,
    about = "Inject Vault secrets and Consul config into a wrapped process"
)]
pub struct Cli {
    /// Application name used to locate the manifest in Consul.
    #[arg(long, env = "K8SPODDECORATOR_APPLICATIONNAME", default_value = "")]
    pub application_name: String,

    /// File holding the bootstrap Vault token.
    #[arg(long, env = "K8SPODDECORATOR_VAULTSECRETPATH", default_value = DEFAULT_VAULT_SECRET_PATH)]
    pub vault_secret_path: String,

    /// Vault path of the secret carrying the Consul token.
    #[arg(long, env = "K8SPODDECORATOR_CONSULTOKENPATH", default_value = DEFAULT_CONSUL_TOKEN_PATH)]
    pub consul_token_path: String,

    /// Consul KV root under which application manifests live.
    #[arg(
        long,
        env = "K8SPODDECORATOR_CONSULCONFIGROOT",
        default_value = DEFAULT_CONSUL_CONFIG_ROOT
    )]
    pub consul_config_root: String,

    #[arg(long, env = "K8SPODDECORATOR_VAULTLEASEDURATIONSECONDS", default_value_t = 0)]
    pub lease_duration_seconds: u64,

    #[arg(
        long,
        env = "K8SPODDECORATOR_VAULTRENEWFAILURERETRYINTERVALSECONDS",
        default_value_t = 0
    )]
    pub renew_retry_interval_seconds: u64,

    /// Renew once this percentage of the lease has elapsed. Unset means
    /// renew at half the lease.
    #[arg(long, env = "K8SPODDECORATOR_VAULTLEASERENEWALPERCENTAGE")]
    pub lease_renewal_percentage: Option<u8>,

    #[arg(long, env = "K8SPODDECORATOR_LOGLEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    #[arg(long, env = "VAULT_ADDR", default_value = DEFAULT_VAULT_ADDR)]
    pub vault_addr: String,

    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = DEFAULT_CONSUL_ADDR)]
    pub consul_addr: String,

    /// Program to run, followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}
