use clap::Parser;
use pod_decorator::backends::{ConsulClient, VaultClient};
use pod_decorator::cli::Cli;
use pod_decorator::config::Settings;
use pod_decorator::logging;
use pod_decorator::runner::{Orchestrator, RunError};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli)?;
    logging::init(&settings.log_level);
    settings.log_summary();

    let vault =
        VaultClient::from_token_file(&settings.vault_addr, &settings.vault_secret_path).await?;
    let consul_addr = settings.consul_addr.clone();
    let orchestrator = Orchestrator::new(settings, Arc::new(vault), cli.command)?;

    match orchestrator
        .run(|token| ConsulClient::new(&consul_addr, Some(token)))
        .await
    {
        Ok(code) => {
            info!("Wrapped process exited with code {}", code);
            Ok(ExitCode::from(code.clamp(0, 255) as u8))
        }
        Err(RunError::DoubleShutdown) => {
            error!("Double shutdown triggered, wrapped process was killed");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
