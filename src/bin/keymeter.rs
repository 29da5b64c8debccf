use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keymeter::{AppConfig, AppState, LoadOptions, router};

#[derive(Debug, Parser)]
#[command(
    name = "keymeter",
    about = "Proxy credential and usage-governance engine for an upstream LLM API"
)]
struct Args {
    /// Address to bind the HTTP listener on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Optional TOML config file (models, prices, rate limits, thresholds).
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, default_value = "keymeter.db")]
    sqlite: PathBuf,

    /// Upstream provider base URL. Overrides the config file.
    #[arg(long)]
    upstream_url: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    // Fail fast: a missing or malformed master key or pepper aborts here,
    // before the process accepts any traffic.
    let config = AppConfig::load(LoadOptions {
        listen: args.listen,
        sqlite_path: args.sqlite,
        upstream_url: args.upstream_url,
        config_path: args.config,
    })?;

    if config.admin_token.is_none() {
        tracing::warn!("no admin token configured, the admin plane is disabled");
    }

    let state = AppState::from_config(&config)?;
    state.store().init().await?;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        upstream = %config.upstream_url,
        sqlite = %config.sqlite_path.display(),
        "keymeter listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
