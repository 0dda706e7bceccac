use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use minidhcp::{Result, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "minidhcpd")]
#[command(version, about = "Minimal address leasing server", long_about = None)]
struct Cli {
    /// Resource file: one `<ipv4-address> <netmask>` per line
    config: PathBuf,

    #[arg(short, long)]
    port: Option<u16>,

    /// Lease ttl offered to clients, and the longest ttl granted
    #[arg(long)]
    lease_ttl: Option<u16>,

    /// Seconds an offered address stays reserved without a REQUEST
    #[arg(long)]
    offer_timeout: Option<u64>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{}", error);
            eprintln!("minidhcpd: {}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ServerConfig::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(lease_ttl) = cli.lease_ttl {
        config.lease_ttl = lease_ttl;
    }
    if let Some(offer_timeout) = cli.offer_timeout {
        config.offer_timeout_seconds = offer_timeout;
    }
    config.validate()?;

    if cli.show_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting lease server with config: {:?}", cli.config);
    let mut server = Server::bind(&config).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            Ok(())
        }
    }
}
