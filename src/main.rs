//! gguf-serve worker binary.
//!
//! Parses the model container, then serves the load protocol and the
//! inference endpoints on a loopback address. A supervisor drives it
//! through fit/alloc/commit; it can also be committed directly via
//! `POST /load` for standalone use.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use gguf_serve::config::{Cli, Config, EnvConfig};
use gguf_serve::server::routes::ModelFile;
use gguf_serve::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gguf_serve=debug,tower_http=debug"
    } else {
        "gguf_serve=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("gguf-serve v{}", env!("CARGO_PKG_VERSION"));

    let env = EnvConfig::from_env();
    let mut config = Config::load(&cli.config)?;
    if let Some(model) = &cli.model {
        config.model.model_path = model.clone();
    }

    let model_file = if config.model.model_path.exists() {
        Some(ModelFile::open(&config.model.model_path)?)
    } else {
        info!(
            path = %config.model.model_path.display(),
            "no model file at startup; waiting for load"
        );
        None
    };

    let state = AppState::new(env, config, model_file);
    let app = build_router(state);

    let listen = cli.listen;
    let listener = TcpListener::bind(&listen).await?;
    info!(addr = listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
