//! Binary entry point for the Hetzner Cloud CSI controller plugin.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};

use hcloud_csi::telemetry::{self, TelemetryError};
use hcloud_csi::{
    ConfigError, ControllerService, CsiConfig, HcloudConfig, HcloudVolumeService,
    IdempotentVolumeService, ListenEndpoint, MetadataClient, MetadataError, PluginServer,
    ReadinessFlag, ServeError, VolumeError,
};

mod cli;

use cli::{Cli, LogFormat};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("location discovery failed: {0}")]
    Metadata(#[from] MetadataError),
    #[error("failed to resolve this server's location: {0}")]
    Location(#[from] VolumeError),
    #[error("server error: {0}")]
    Serve(#[from] ServeError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        report_error(&err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    telemetry::init(log_format(cli.log_format))?;

    let hcloud_config = HcloudConfig::load_without_cli_args()?;
    let csi_config = CsiConfig::load_without_cli_args()?;
    let endpoint: ListenEndpoint = csi_config.endpoint.parse()?;

    let adapter = HcloudVolumeService::from_config(&hcloud_config);
    let location = resolve_location(&hcloud_config, &adapter).await?;
    info!(%location, version = env!("CARGO_PKG_VERSION"), "starting controller");

    let coordinator = IdempotentVolumeService::new(Arc::new(adapter));
    let controller = ControllerService::new(Arc::new(coordinator), location)
        .with_default_timeout(csi_config.operation_timeout());
    let server = PluginServer::new(controller, ReadinessFlag::new());
    server.serve(&endpoint).await?;
    info!("controller stopped");
    Ok(())
}

const fn log_format(format: LogFormat) -> telemetry::LogFormat {
    match format {
        LogFormat::Text => telemetry::LogFormat::Text,
        LogFormat::Json => telemetry::LogFormat::Json,
    }
}

async fn resolve_location(
    config: &HcloudConfig,
    adapter: &HcloudVolumeService,
) -> Result<String, CliError> {
    if let Some(location) = config.default_location() {
        return Ok(location.to_owned());
    }
    let metadata = MetadataClient::new(&config.metadata_endpoint);
    let server_id = match metadata.instance_id().await {
        Ok(id) => id,
        Err(err) => {
            if matches!(err, MetadataError::Unreachable { .. }) {
                warn!(
                    error = %err,
                    "metadata service unreachable; set HCLOUD_VOLUME_DEFAULT_LOCATION outside Hetzner Cloud"
                );
            }
            return Err(err.into());
        }
    };
    let location = adapter.server_location(server_id).await?;
    info!(server_id, %location, "discovered location from metadata service");
    Ok(location)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
