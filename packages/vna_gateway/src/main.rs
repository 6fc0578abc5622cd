use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use vna_gateway::Gateway;
use vna_gateway::config::{self, FileConfig, GatewayConfig, Profile};

#[derive(Parser)]
#[command(name = "vna-gateway")]
#[command(about = "Network control and telemetry gateway for the VNA rig")]
struct Args {
    /// Config file (missing file is ignored)
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Configuration preset
    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port shared by text commands and WebSocket (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "vna_gateway=debug,job_registry=debug,tower_http=debug,warn"
    } else {
        "vna_gateway=info,job_registry=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let file_config: FileConfig = config::load_config(&args.config, args.profile.as_ref())
        .extract()
        .with_context(|| format!("Invalid configuration ({})", args.config.display()))?;

    let mut gateway_config = GatewayConfig::from_file(&file_config);
    if let Some(host) = args.host {
        gateway_config.host = host;
    }
    if let Some(port) = args.port {
        gateway_config.port = port;
    }

    info!(
        "Starting VNA gateway: jobs run '{}', telemetry from {:?}",
        gateway_config.jobs.launcher.command_line(&[]).join(" "),
        gateway_config.telemetry.source
    );

    let gateway = Gateway::bind(gateway_config)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, stopping jobs...");
    };

    gateway.run(shutdown).await
}
