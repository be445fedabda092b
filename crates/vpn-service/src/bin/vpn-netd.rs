use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use vpn_service::{NetworkService, ServiceConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(
    name = "vpn-netd",
    about = "Port forwarding, WireGuard and firewall management daemon",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.dump_default_config {
        print!("{}", ServiceConfig::default().to_toml()?);
        return Ok(());
    }

    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let service = match NetworkService::new(config).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "Failed to initialize network service");
            return Err(e).context("network service initialization failed");
        }
    };
    service.init().await;

    let overview = service.overview().await;
    info!(
        rules = overview.forward_rules,
        running = overview.running_rules,
        tunnel = %overview.tunnel_state,
        peers = overview.peer_count,
        "vpn-netd ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    service.shutdown().await;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    match path {
        Some(path) => ServiceConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                ServiceConfig::load_from_file(default_path)
                    .with_context(|| format!("failed to load {}", default_path.display()))
            } else {
                Ok(ServiceConfig::default())
            }
        }
    }
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}
