use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use unmtls_proxy::cli::Cli;
use unmtls_proxy::config::ProxyConfig;
use unmtls_proxy::{lifecycle, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging before anything else can fail
    if let Err(e) = logging::init(cli.log_level) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    // Display version information
    info!("unmtls-proxy v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ProxyConfig::from_cli(&cli).context("Invalid configuration")?;
    lifecycle::run(config).await
}
