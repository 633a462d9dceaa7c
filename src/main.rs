use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use zai_proxy::config::Config;
use zai_proxy::gateway;

/// OpenAI-compatible chat-completions proxy for the z.ai GLM web frontend.
#[derive(Parser, Debug)]
#[command(name = "zai-proxy", version, about)]
struct Cli {
    /// Listener host (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listener port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut config = Config::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    gateway::run_gateway(&config).await
}
