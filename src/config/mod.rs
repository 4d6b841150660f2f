mod defaults;
mod manifest;

pub use defaults::*;
pub use manifest::*;

use crate::cli::Cli;
use crate::lease::LeaseSettings;
use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing::info;

/// Validated runtime settings for one decorator run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub application_name: String,
    pub vault_secret_path: PathBuf,
    pub consul_token_path: String,
    pub consul_config_root: String,
    pub lease: LeaseSettings,
    pub log_level: String,
    pub vault_addr: String,
    pub consul_addr: String,
}

impl Settings {
    /// Build settings from parsed CLI/environment input, filling zero values
    /// with defaults.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let application_name = cli.application_name.trim().to_string();
        if application_name.is_empty() {
            bail!("ApplicationName can not be empty (set K8SPODDECORATOR_APPLICATIONNAME)");
        }

        if let Some(pct) = cli.lease_renewal_percentage {
            if pct == 0 || pct > 100 {
                bail!("Lease renewal percentage must be within 1..=100, got {pct}");
            }
        }

        let duration_secs = non_zero_or(cli.lease_duration_seconds, DEFAULT_LEASE_DURATION_SECS);
        let retry_interval_secs = non_zero_or(
            cli.renew_retry_interval_seconds,
            DEFAULT_RENEW_RETRY_INTERVAL_SECS,
        );

        Ok(Self {
            application_name,
            vault_secret_path: PathBuf::from(&cli.vault_secret_path),
            consul_token_path: cli.consul_token_path.clone(),
            consul_config_root: cli.consul_config_root.trim_end_matches('/').to_string(),
            lease: LeaseSettings {
                duration_secs,
                retry_interval_secs,
                renewal_percentage: cli.lease_renewal_percentage,
            },
            log_level: cli.log_level.trim().to_string(),
            vault_addr: cli.vault_addr.clone(),
            consul_addr: cli.consul_addr.clone(),
        })
    }

    /// `<config_root>/<application_name>`: parent of the manifest and of
    /// file and template bodies.
    pub fn app_prefix(&self) -> String {
        format!("{}/{}", self.consul_config_root, self.application_name)
    }

    /// Consul key of the application's manifest.
    pub fn manifest_path(&self) -> String {
        format!("{}/config", self.app_prefix())
    }

    pub fn log_summary(&self) {
        info!(
            application = %self.application_name,
            vault_addr = %self.vault_addr,
            consul_addr = %self.consul_addr,
            vault_secret_path = %self.vault_secret_path.display(),
            consul_token_path = %self.consul_token_path,
            config_root = %self.consul_config_root,
            lease_secs = self.lease.duration_secs,
            retry_secs = self.lease.retry_interval_secs,
            renewal_pct = ?self.lease.renewal_percentage,
            log_level = %self.log_level,
            "Loaded configuration"
        );
    }
}

/// Consul sub-folder a materialized body is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFolder {
    Files,
    Templates,
}

impl BodyFolder {
    pub fn as_str(self) -> &'static str {
        match self {
            BodyFolder::Files => "files",
            BodyFolder::Templates => "templates",
        }
    }
}

fn non_zero_or(value: u64, default: u64) -> u64 {
    if value == 0 {
        default
    } else {
        value
    }
}
