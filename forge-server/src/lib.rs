// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

//! Server-side compilation coordination core of the Forge remote JIT
//! compilation service. Client VMs ship compilation requests over the
//! network; a pool of workers performs the optimization work and returns
//! generated native code, so many small clients share one powerful host.

pub mod aot;
pub mod cache;
pub mod chtable;
pub mod compiler;
pub mod config;
pub mod gate;
pub mod health;
pub mod processor;
pub mod registry;
pub mod resolve;
pub mod scratch;
pub mod sequencer;
pub mod session;
pub mod shared_rom;

pub use aot::{AotCache, AotCacheMap, AotConfig, CachedAotMethod};
pub use compiler::{CompilationContext, CompilationOutcome, CompileError, CompilerBackend, StubCompiler};
pub use config::ServerConfig;
pub use gate::ClassUnloadGate;
pub use health::{HealthConfig, HealthSampler, MemoryProbe};
pub use processor::{run_worker, ServerContext};
pub use registry::{PurgePolicy, SessionRegistry};
pub use resolve::ResolvedMethod;
pub use session::ClientSession;
pub use shared_rom::SharedRomClassCache;

use std::sync::Arc;

use forge_transport::{CompileListener, ListenerConfig, ServerStream};
use tokio::sync::mpsc;
use tracing::info;

/// Wires up the whole server from a config: shared caches, health sampler,
/// registry, listener and worker pool. Runs until the listener fails.
pub async fn serve(config: ServerConfig, backend: Arc<dyn CompilerBackend>) -> anyhow::Result<()> {
    let health = HealthSampler::new(config.health_config());
    let shared_rom = SharedRomClassCache::new();
    let registry = SessionRegistry::new(config.purge_policy(), shared_rom, health.clone());
    let aot_map = config
        .aot_cache_enabled
        .then(|| AotCacheMap::new(config.aot_config()));

    let listener = CompileListener::bind(ListenerConfig {
        bind_addr: config.bind_addr.clone(),
        version_tag: config.version_tag(),
        tls: config.tls.clone(),
    })
    .await?;

    let (queue_tx, queue_rx) = mpsc::channel::<ServerStream>(config.queue_capacity);
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

    let ctx = Arc::new(ServerContext {
        registry,
        aot_map,
        health,
        compiler: backend,
        server_uid: std::process::id() as u64,
        config,
    });

    info!(
        "[Server] starting {} workers, queue capacity {}",
        ctx.config.worker_count, ctx.config.queue_capacity
    );
    for worker_id in 0..ctx.config.worker_count {
        tokio::spawn(run_worker(ctx.clone(), worker_id, queue_rx.clone(), queue_tx.clone()));
    }

    listener.run(queue_tx).await
}
