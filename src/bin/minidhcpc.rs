use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use minidhcp::{Client, ClientConfig, Result};

#[derive(Parser)]
#[command(name = "minidhcpc")]
#[command(version, about = "Minimal address leasing client", long_about = None)]
struct Cli {
    /// IPv4 address of the lease server
    server: Ipv4Addr,

    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds to wait for each OFFER or ACK
    #[arg(long)]
    reply_timeout: Option<u64>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
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
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{}", error);
            eprintln!("minidhcpc: {}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::new(cli.server);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(seconds) = cli.reply_timeout {
        config.reply_timeout_millis = seconds.saturating_mul(1000);
    }

    let mut client = Client::bind(config).await?;

    client
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", error);
            }
            info!("Received shutdown signal, releasing lease...");
        })
        .await
}
