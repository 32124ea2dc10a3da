use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cq_domain::config::Config;
use cq_gateway::api;
use cq_gateway::state::AppState;
use cq_store::Store;

#[derive(Parser)]
#[command(name = "colloquy", version, about = "Multi-agent conversational runtime")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(cli.config.as_deref()).context("loading config")?;
            run_server(config).await
        }
        Some(Command::Version) => {
            println!("colloquy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cq_gateway=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind = config.server.bind.clone();
    if config.auth.jwt_secret.is_empty() {
        tracing::warn!("no JWT secret configured; all chat sockets will be rejected");
    }

    let store = Store::connect(&config.database.url)
        .await
        .context("opening database")?;
    let state = AppState::new(config, store);
    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "colloquy gateway listening");

    axum::serve(listener, app).await.context("serving")?;

    // Not reached in normal operation; explicit teardown for completeness.
    state.lm.shutdown();
    Ok(())
}
