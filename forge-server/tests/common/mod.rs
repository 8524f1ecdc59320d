// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

//! Test harness: an in-process server on an ephemeral port plus a scripted
//! client that answers the server's lazy fetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use forge_model::{
    ChTableMod, ClassHandle, ClientId, CompilationRequest, ConstantPoolHandle, LoaderHandle,
    Message, MethodDetails, MethodHandle, OptimizationPlan, RomClassPayload, VmInfo,
};
use forge_server::compiler::{BoxFuture, CompilationContext, CompilationOutcome, CompileError};
use forge_server::{
    run_worker, AotCacheMap, CompilerBackend, HealthConfig, HealthSampler, MemoryProbe,
    ServerConfig, ServerContext, SessionRegistry, SharedRomClassCache, StubCompiler,
};
use forge_transport::{ClientStream, CompileListener, ListenerConfig, ServerStream};
use tokio::sync::mpsc;

/// Backend wrapper counting invocations, so tests can assert the compiler
/// was (or was not) reached.
pub struct CountingCompiler {
    inner: StubCompiler,
    pub invocations: AtomicUsize,
}

impl CountingCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: StubCompiler, invocations: AtomicUsize::new(0) })
    }

    pub fn count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl CompilerBackend for CountingCompiler {
    fn compile<'a>(
        &'a self,
        ctx: &'a mut CompilationContext<'_>,
    ) -> BoxFuture<'a, Result<CompilationOutcome, CompileError>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(ctx)
    }
}

struct FixedMemory(u64);

impl MemoryProbe for FixedMemory {
    fn free_physical_memory(&mut self) -> Option<u64> {
        Some(self.0)
    }
}

pub struct TestServer {
    pub addr: String,
    pub ctx: Arc<ServerContext>,
    pub compiler: Arc<CountingCompiler>,
}

pub struct ServerOptions {
    pub config: ServerConfig,
    /// Free physical memory the health sampler observes.
    pub free_memory_bytes: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        let mut config = ServerConfig::default();
        config.bind_addr = "127.0.0.1:0".to_string();
        config.worker_count = 4;
        Self { config, free_memory_bytes: u64::MAX }
    }
}

pub async fn start_server() -> Result<TestServer> {
    start_server_with(ServerOptions::default()).await
}

pub async fn start_server_with(options: ServerOptions) -> Result<TestServer> {
    let config = options.config;
    let health = HealthSampler::with_probe(
        HealthConfig { normal_sample_period: std::time::Duration::ZERO, ..config.health_config() },
        Box::new(FixedMemory(options.free_memory_bytes)),
    );
    let shared_rom = SharedRomClassCache::new();
    let registry = SessionRegistry::new(config.purge_policy(), shared_rom, health.clone());
    let aot_map = config.aot_cache_enabled.then(|| AotCacheMap::new(config.aot_config()));
    let compiler = CountingCompiler::new();

    let listener = CompileListener::bind(ListenerConfig {
        bind_addr: config.bind_addr.clone(),
        version_tag: config.version_tag(),
        tls: config.tls.clone(),
    })
    .await?;
    let addr = listener.local_addr()?.to_string();

    let (queue_tx, queue_rx) = mpsc::channel::<ServerStream>(config.queue_capacity);
    let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

    let ctx = Arc::new(ServerContext {
        registry,
        aot_map,
        health,
        compiler: compiler.clone(),
        server_uid: 0xF0,
        config,
    });

    for worker_id in 0..ctx.config.worker_count {
        tokio::spawn(run_worker(ctx.clone(), worker_id, queue_rx.clone(), queue_tx.clone()));
    }
    tokio::spawn(listener.run(queue_tx));

    Ok(TestServer { addr, ctx, compiler })
}

/// A scripted client VM: owns a set of classes it can describe on demand
/// and drives one connection.
pub struct TestClient {
    pub stream: ClientStream,
    pub client_id: ClientId,
    pub vm_info: VmInfo,
    pub classes: HashMap<ClassHandle, RomClassPayload>,
    pub chtable_snapshot: Vec<ChTableMod>,
}

pub fn default_vm_info() -> VmInfo {
    VmInfo {
        process_id: 41,
        gc_write_barrier: 1,
        compressed_refs_shift: 3,
        pointer_width: 8,
        string_compression_enabled: true,
        uses_method_trampolines: false,
        interpreter_vtable_offset: 0x150,
        helper_addresses: vec![0x7000, 0x7008],
        shared_cache_descriptors: vec![],
        aot_header: vec![1, 2, 3, 4],
        uses_aot_cache: false,
        aot_cache_name: String::new(),
    }
}

/// A class payload whose loader identity is complete, so AOT record
/// creation can succeed.
pub fn class_payload(class: ClassHandle, signature: &str) -> RomClassPayload {
    RomClassPayload {
        rom_body: format!("romclass:{}", signature).into_bytes(),
        remote_rom_ptr: class.0 + 0x10,
        methods_base: MethodHandle(class.0 * 0x100),
        method_count: 8,
        parent: None,
        interfaces: vec![],
        base_component: None,
        num_dimensions: 0,
        loader: LoaderHandle(0x10AD),
        constant_pool: ConstantPoolHandle(class.0 + 0x20),
        class_flags: 0,
        total_instance_size: 32,
        signature: signature.to_string(),
        name_identifying_loader: "app".to_string(),
        chain_offset_identifying_loader: 0x200,
        has_final_fields: false,
        initialized: true,
    }
}

impl TestClient {
    pub async fn connect(addr: &str, client_id: u64) -> Result<Self> {
        let stream = ClientStream::connect(addr, forge_model::wire_version(0)).await?;
        Ok(Self {
            stream,
            client_id: ClientId(client_id),
            vm_info: default_vm_info(),
            classes: HashMap::new(),
            chtable_snapshot: vec![],
        })
    }

    pub fn add_class(&mut self, class: ClassHandle, signature: &str) -> RomClassPayload {
        let payload = class_payload(class, signature);
        self.classes.insert(class, payload.clone());
        payload
    }

    /// A minimal valid request; tests override the fields they exercise.
    pub fn request(&self, seq_no: u32, critical_seq_no: u32, class: ClassHandle) -> CompilationRequest {
        CompilationRequest {
            client_id: self.client_id,
            seq_no,
            critical_seq_no,
            method: MethodHandle(class.0 * 0x100),
            class,
            details: MethodDetails::Ordinary,
            plan: OptimizationPlan::cold(),
            options: String::new(),
            recompilation_info: vec![],
            unloaded_classes: vec![],
            illegal_final_modifications: vec![],
            chtable_removes: vec![],
            chtable_mods: vec![],
            class_info: self.classes.get(&class).cloned(),
            use_aot_compilation: false,
            in_startup_phase: false,
            aot_cache_store: false,
            aot_cache_load: false,
            method_index: 0,
            defining_class_chain_offset: 0x300,
            ram_class_chain: vec![],
            uncached_classes: vec![],
            uncached_class_infos: vec![],
            new_known_ids: vec![],
            use_server_offsets: false,
        }
    }

    /// Sends a compilation request and serves every lazy fetch the server
    /// issues until a terminal reply arrives.
    pub async fn compile(&mut self, request: CompilationRequest) -> Result<Message> {
        self.stream.send(&Message::CompilationRequest(request)).await?;
        self.pump().await
    }

    pub async fn pump(&mut self) -> Result<Message> {
        loop {
            let message = self.stream.recv().await?;
            let reply = match message {
                Message::VmInfoFetch => Message::VmInfoReply(self.vm_info.clone()),
                Message::GetUnloadedClassRangesAndChTable { .. } => {
                    Message::UnloadedClassRangesAndChTable {
                        ranges: vec![],
                        max_ranges: 1024,
                        chtable: self.chtable_snapshot.clone(),
                    }
                }
                Message::RomClassFetch { class } => Message::RomClassReply {
                    info: self.classes.get(&class).cloned(),
                },
                Message::ClassChainFetch { class } => Message::ClassChainReply {
                    chain: vec![class],
                    chain_offset: 0x300,
                },
                Message::StaticFinalFetch { .. } => Message::StaticFinalReply { value: Some(0) },
                Message::MethodResolveFetch { .. } => {
                    Message::MethodResolveReply { resolved: None }
                }
                Message::FieldAttributesFetch { .. } => {
                    Message::FieldAttributesReply { attributes: None }
                }
                Message::ProfileFetch { .. } => Message::ProfileReply { entry: None },
                terminal @ (Message::CompilationCode(_)
                | Message::CompilationFailure { .. }
                | Message::AotCacheSerializedMethod { .. }
                | Message::AotCacheFailure { .. }
                | Message::AotCacheMapReply { .. }) => return Ok(terminal),
                other => bail!("unexpected message from server: {:?}", other.message_type()),
            };
            self.stream.send(&reply).await?;
        }
    }
}
