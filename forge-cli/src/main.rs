// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use forge_server::{serve, ServerConfig, StubCompiler};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "forged", about = "Forge remote JIT compilation server")]
struct Cli {
    /// Path to a JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:38400
    #[arg(long)]
    listen: Option<String>,

    /// Number of compilation workers
    #[arg(long)]
    workers: Option<usize>,

    /// Directory for persisted AOT caches
    #[arg(long)]
    aot_cache_dir: Option<PathBuf>,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.bind_addr = listen;
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    if let Some(dir) = cli.aot_cache_dir {
        config.aot_cache_dir = Some(dir);
    }

    info!(
        bind_addr = %config.bind_addr,
        workers = config.worker_count,
        version = env!("CARGO_PKG_VERSION"),
        "Forge server starting"
    );

    serve(config, Arc::new(StubCompiler)).await
}
