use anyhow::Result;
use clap::{Parser, Subcommand};

use pulse::config::ServerConfig;
use pulse::server;

#[derive(Parser)]
#[command(name = "pulse")]
#[command(version, about = "Live session monitoring backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring server
    Serve {
        /// Port to serve on
        #[arg(short, long, env = "PULSE_PORT", default_value = "4820")]
        port: u16,

        /// Permissive CORS and 0.0.0.0 binding for frontend development
        #[arg(long)]
        dev: bool,

        /// Maximum concurrent stream connections
        #[arg(long, default_value = "50")]
        max_streams: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulse=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            port,
            dev,
            max_streams,
        } => {
            let config = ServerConfig {
                port,
                dev_mode: dev,
                max_stream_connections: max_streams,
                ..ServerConfig::default()
            };
            server::start_server(config).await?;
        }
    }
    Ok(())
}
