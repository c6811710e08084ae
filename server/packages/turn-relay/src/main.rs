use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use turn_relay::relay::{RelayConfig, DEFAULT_MODEL};
use turn_relay::{run_server, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "turn-relay")]
#[command(about = "Relays a captured chat turn as an OpenAI Responses endpoint", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8787)]
    port: u16,

    /// Deadline for a turn to reach a terminal signal.
    #[arg(long, default_value_t = 60_000)]
    turn_timeout_ms: u64,

    /// Model name echoed when the caller does not send one.
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "turn-relay failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();

    let cli = Cli::parse();
    run_server(ServerConfig {
        host: cli.host,
        port: cli.port,
        relay: RelayConfig {
            turn_timeout: Duration::from_millis(cli.turn_timeout_ms),
            default_model: cli.model,
        },
        cors_allow_origins: cli.cors_allow_origin,
    })
    .await
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}
