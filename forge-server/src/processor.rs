// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::sync::Arc;

use forge_model::{
    ClassHandle, CompilationReply, CompilationRequest, FailureCode, Message, MessageType,
    MethodDetails,
};
use forge_transport::{IncomingRequest, ServerStream, StreamError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::aot::AotCacheMap;
use crate::compiler::{CompilationContext, CompileError, CompilerBackend};
use crate::config::ServerConfig;
use crate::gate::GateProbe;
use crate::health::HealthSampler;
use crate::registry::SessionRegistry;
use crate::scratch::ScratchCaches;
use crate::sequencer::{self, Admission};
use crate::session::ClientSession;

/// Process-wide collaborators a worker needs to drive one request.
pub struct ServerContext {
    pub registry: Arc<SessionRegistry>,
    pub aot_map: Option<Arc<AotCacheMap>>,
    pub health: Arc<HealthSampler>,
    pub compiler: Arc<dyn CompilerBackend>,
    pub config: ServerConfig,
    pub server_uid: u64,
}

/// What happens to the stream once the request is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Put the stream back in the queue for the connection's next request.
    Recycle,
    /// The connection is finished or unusable.
    Drop,
}

/// Per-request state. The state field tracks the request lifecycle for
/// diagnostics; transitions happen in `process_request`.
struct CompilationTask {
    seq_no: u32,
    critical_seq_no: u32,
    is_critical: bool,
    state: TaskState,
    /// `lastProcessedCriticalSeqNo` was advanced for this request; abort
    /// paths must not advance it a second time.
    completed_critical: bool,
    /// This worker owns one `num_active_threads` increment.
    counted_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Queued,
    AwaitingOrder,
    Ready,
    ServingAot,
    Compiling,
    Replying,
    Done,
    Aborted,
}

enum RequestFailure {
    Stream(StreamError),
    Compile(CompileError),
    /// The class to compile no longer exists on the client.
    ClassGone,
}

impl From<StreamError> for RequestFailure {
    fn from(e: StreamError) -> Self {
        RequestFailure::Stream(e)
    }
}

impl From<CompileError> for RequestFailure {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::Stream(e) => RequestFailure::Stream(e),
            other => RequestFailure::Compile(other),
        }
    }
}

/// Worker loop: one request to completion per iteration. Streams
/// are recycled through the same queue the listener feeds.
pub async fn run_worker(
    ctx: Arc<ServerContext>,
    worker_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<ServerStream>>>,
    requeue: mpsc::Sender<ServerStream>,
) {
    info!("[Worker {}] started", worker_id);
    loop {
        let mut stream = {
            let mut rx = queue.lock().await;
            match rx.recv().await {
                Some(stream) => stream,
                None => break,
            }
        };

        let disposition = process_request(&ctx, &mut stream).await;

        match disposition {
            Disposition::Recycle if !ctx.config.per_request_streams => {
                if let Err(e) = requeue.try_send(stream) {
                    warn!("[Worker {}] queue full, dropping recycled stream: {}", worker_id, e);
                }
            }
            _ => {} // stream drops here
        }
    }
    info!("[Worker {}] stopped", worker_id);
}

async fn process_request(ctx: &ServerContext, stream: &mut ServerStream) -> Disposition {
    let incoming = match stream.read_compile_request().await {
        Ok(incoming) => incoming,
        Err(e) => return fail_before_session(ctx, stream, e).await,
    };

    let request = match incoming {
        IncomingRequest::Compile(request) => request,
        IncomingRequest::AotCacheMap { cache_name } => {
            return serve_aot_cache_map(ctx, stream, &cache_name).await;
        }
    };

    stream.set_client_id(request.client_id);
    ctx.registry.purge_old();
    let (session, created) = ctx.registry.find_or_create(request.client_id, request.critical_seq_no);

    let mut task = CompilationTask {
        seq_no: request.seq_no,
        critical_seq_no: request.critical_seq_no,
        is_critical: is_critical_request(&request),
        state: TaskState::Queued,
        completed_critical: false,
        counted_active: false,
    };
    debug!(
        "[Processor] client={} seqNo={} criticalSeqNo={} critical={} state={:?} session {}",
        request.client_id,
        task.seq_no,
        task.critical_seq_no,
        task.is_critical,
        task.state,
        if created { "created" } else { "found" },
    );

    session.merge_known_ids(&request.new_known_ids);

    // Order the request against its critical predecessor.
    task.state = TaskState::AwaitingOrder;
    match sequencer::admit(&session, task.seq_no, task.critical_seq_no, task.is_critical).await {
        Admission::Proceed => {
            task.counted_active = true;
        }
        Admission::StaleCritical => {
            task.state = TaskState::Aborted;
            stream.write_error(FailureCode::StreamLostMessage, 0).await;
            ctx.registry.release(&session);
            return Disposition::Recycle;
        }
    }

    ctx.health.inc_active_workers();
    task.state = TaskState::Ready;

    let result = drive(ctx, stream, &session, &request, &mut task).await;
    let disposition = conclude(ctx, stream, &session, &request, &mut task, result).await;

    // Release counters and per-compilation scratch
    // on every path. The reader gate was released when its guard dropped.
    ctx.health.dec_active_workers();
    if task.counted_active {
        let mut state = session.sequencing.lock().await;
        state.num_active_threads -= 1;
    }
    ctx.registry.release(&session);

    let stats = session.stats();
    debug!(
        "[Processor] client={} seqNo={} finished state={:?} cachedClasses={} cachedMethods={}",
        request.client_id, task.seq_no, task.state, stats.cached_classes, stats.cached_methods,
    );
    disposition
}

fn is_critical_request(request: &CompilationRequest) -> bool {
    let has_state_deltas = !request.unloaded_classes.is_empty()
        || !request.illegal_final_modifications.is_empty()
        || !request.chtable_removes.is_empty()
        || !request.chtable_mods.is_empty();
    // JitDump recompilations ignore any critical updates they carry.
    has_state_deltas && request.details != MethodDetails::JitDump
}

/// The healthy path from READY to the terminal reply.
/// Returns `Ok` when a terminal reply was sent (code, cached AOT method, or
/// AOT-store failure notice).
async fn drive(
    ctx: &ServerContext,
    stream: &mut ServerStream,
    session: &Arc<ClientSession>,
    request: &CompilationRequest,
    task: &mut CompilationTask,
) -> Result<(), RequestFailure> {
    // Class redefinition through hot-code-replace extensions invalidates
    // everything we believe about this client.
    if request.unloaded_classes.contains(&ClassHandle::REDEFINITION_SENTINEL) {
        info!(
            "[Processor] client={} clearing all caches (redefinition sentinel)",
            request.client_id
        );
        session.clear_caches_locked().await;
    }

    reconcile_caches(ctx, stream, session, request).await?;

    // Critical effects are applied: let dependents through.
    if task.is_critical {
        sequencer::complete_critical(session, task.seq_no).await;
        task.completed_critical = true;
    }

    // Everything from here happens under the reader side of the gate
    // so lazy fetches cannot race an unload.
    let gate = session.gate().clone();
    let _read = gate.read().await;
    stream.bind_session_probe(Arc::new(GateProbe(session.gate().clone())));

    let result = compile_under_gate(ctx, stream, session, request, task).await;
    stream.clear_session_probe();
    result
}

/// Incremental reconcile when the caches are warm, full
/// re-initialization from a client snapshot otherwise.
async fn reconcile_caches(
    ctx: &ServerContext,
    stream: &mut ServerStream,
    session: &Arc<ClientSession>,
    request: &CompilationRequest,
) -> Result<(), RequestFailure> {
    let unloads: Vec<ClassHandle> = request
        .unloaded_classes
        .iter()
        .copied()
        .filter(|c| *c != ClassHandle::REDEFINITION_SENTINEL)
        .collect();

    if !session.caches_cleared() {
        session.process_unloaded_classes(&unloads, true).await;
        session.process_illegal_final_modifications(&request.illegal_final_modifications);
        if request.details != MethodDetails::JitDump {
            session.apply_chtable_deltas(&request.chtable_mods, &request.chtable_removes);
        }
        return Ok(());
    }

    // Caches are empty: ask the client for the full unloaded-address ranges
    // and serialized CH-table. The init lock serializes concurrent
    // first-comers; losers see the flag lowered and proceed.
    let _init = session.cache_init.lock().await;
    if !session.caches_cleared() {
        return Ok(());
    }
    debug!(
        "[Processor] client={} requesting unloaded ranges and CH-table snapshot",
        request.client_id
    );
    stream
        .write(&Message::GetUnloadedClassRangesAndChTable { server_uid: ctx.server_uid })
        .await?;
    match stream.read().await? {
        Message::UnloadedClassRangesAndChTable { ranges, max_ranges, chtable } => {
            session.initialize_unloaded_ranges(ranges, max_ranges);
            session.initialize_chtable(&chtable);
            // The snapshot already covers the ranges; this request's unload
            // list still purges whatever the previous session state cached.
            session.process_unloaded_classes(&unloads, false).await;
            session.set_caches_cleared(false);
            Ok(())
        }
        other => Err(StreamError::TypeMismatch {
            expected: Some(MessageType::UnloadedClassRangesAndChTable),
            actual: other.message_type(),
        }
        .into()),
    }
}

async fn compile_under_gate(
    ctx: &ServerContext,
    stream: &mut ServerStream,
    session: &Arc<ClientSession>,
    request: &CompilationRequest,
    task: &mut CompilationTask,
) -> Result<(), RequestFailure> {
    // The class being compiled must be described server-side before the
    // optimizer runs.
    if !session
        .ensure_rom_class(stream, request.class, request.class_info.as_ref())
        .await?
    {
        return Err(RequestFailure::ClassGone);
    }

    // AOT cache arbitration.
    let aot_cache = session
        .get_or_create_aot_cache(stream, ctx.aot_map.as_ref())
        .await?;
    let map_has_space = ctx
        .aot_map
        .as_ref()
        .map(|m| m.cache_has_space())
        .unwrap_or(false);
    let mut aot_store = request.aot_cache_store && aot_cache.is_some() && map_has_space;
    let mut aot_load = request.aot_cache_load && aot_cache.is_some();
    if let Some(cache) = &aot_cache {
        if !aot_load {
            cache.record_bypass();
        }
    }

    let mut chain_record = None;
    if aot_store || aot_load {
        let cache = aot_cache.as_ref().expect("aot paths require a cache");
        for (class, info) in request.uncached_classes.iter().zip(&request.uncached_class_infos) {
            session.cache_rom_class(*class, info);
        }

        let mut missing_loader_info = false;
        chain_record = session
            .class_chain_record(
                stream,
                request.class,
                request.defining_class_chain_offset,
                &request.ram_class_chain,
                cache,
                &mut missing_loader_info,
            )
            .await?;
        if chain_record.is_none() {
            info!(
                "[Processor] client={} no defining class chain record for {:?} ({}); AOT cache skipped",
                request.client_id,
                request.class,
                if missing_loader_info { "missing class loader info" } else { "cache size limit" },
            );
            if aot_load {
                cache.record_miss();
            }
            aot_store = false;
            aot_load = false;
        }
    }

    // Load attempt: a hit short-circuits the compilation entirely.
    if aot_load {
        let cache = aot_cache.as_ref().expect("load requires a cache");
        let header = session.aot_header_record().expect("bound cache implies header record");
        let chain = chain_record.expect("load requires a chain record");
        if let Some(cached) = cache.find_method(chain, request.method_index, request.plan.opt_level, header)
        {
            task.state = TaskState::ServingAot;
            let records = session.with_known_ids(|known| cache.serialization_records(&cached, known));
            let reply = Message::AotCacheSerializedMethod {
                method: cached.to_wire_bytes(),
                records: records.iter().map(|r| r.to_wire_bytes()).collect(),
                plan: request.plan.clone(),
                memory_state: ctx.health.memory_state(ctx.registry.size()),
                thread_state: ctx.health.thread_state(),
            };
            stream.write(&reply).await?;
            info!(
                "[Processor] client={} served {} from AOT cache",
                request.client_id, cached.signature
            );
            task.state = TaskState::Done;
            return Ok(());
        }
    }

    // In server-offsets mode a store request that cannot be satisfied must
    // abort rather than degrade to a plain compilation.
    if request.use_server_offsets && request.aot_cache_store && !aot_store {
        task.state = TaskState::Aborted;
        let message = Message::AotCacheFailure {
            cache_unavailable: aot_cache.is_none(),
            store_unavailable: true,
        };
        stream.write(&message).await?;
        return Ok(());
    }

    // Invoke the external compiler.
    task.state = TaskState::Compiling;
    let mut scratch = ScratchCaches::new();
    let mut comp_ctx = CompilationContext::new(session, stream, &mut scratch, request, aot_cache.clone());
    let outcome = ctx.compiler.compile(&mut comp_ctx).await?;
    let validation_records = comp_ctx.take_validation_records();

    // Store path.
    if aot_store {
        let cache = aot_cache.as_ref().expect("store requires a cache");
        let header = session.aot_header_record().expect("bound cache implies header record");
        let chain = chain_record.expect("store requires a chain record");
        let signature = session
            .with_class_info(request.class, |info| info.signature.clone())
            .unwrap_or_default();
        let stored = cache.store_method(
            chain,
            request.method_index,
            request.plan.opt_level,
            header,
            validation_records,
            outcome.code.clone(),
            outcome.data.clone(),
            format!("{}#{}", signature, request.method_index),
        );
        match stored {
            Some(_) => {
                if let Some(map) = &ctx.aot_map {
                    let map = map.clone();
                    let cache = cache.clone();
                    tokio::spawn(async move { map.persist(&cache).await });
                }
            }
            None if request.use_server_offsets => {
                task.state = TaskState::Aborted;
                let message = Message::AotCacheFailure {
                    cache_unavailable: false,
                    store_unavailable: true,
                };
                stream.write(&message).await?;
                return Ok(());
            }
            None => {
                warn!(
                    "[Processor] client={} could not store {:?} in AOT cache (size limit)",
                    request.client_id, request.method
                );
            }
        }
    }

    // Package the artifact with the health tags.
    task.state = TaskState::Replying;
    let reply = CompilationReply {
        code: outcome.code,
        data: outcome.data,
        chtable_commit: outcome.chtable_commit,
        do_not_extend: outcome.do_not_extend,
        assumptions: outcome.assumptions,
        trampoline_methods: outcome.trampoline_methods,
        compilation_log: outcome.log,
        memory_state: ctx.health.memory_state(ctx.registry.size()),
        thread_state: ctx.health.thread_state(),
    };
    stream.finish_compilation(reply).await;
    task.state = TaskState::Done;
    Ok(())
}

/// Maps the failure taxonomy onto replies, stream disposition and the
/// mandatory sequence-number advancement.
async fn conclude(
    ctx: &ServerContext,
    stream: &mut ServerStream,
    session: &Arc<ClientSession>,
    request: &CompilationRequest,
    task: &mut CompilationTask,
    result: Result<(), RequestFailure>,
) -> Disposition {
    let failure = match result {
        Ok(()) => return Disposition::Recycle,
        Err(failure) => failure,
    };
    task.state = TaskState::Aborted;

    // A dying critical request still advances the sequence number,
    // otherwise its dependents deadlock.
    if task.is_critical && !task.completed_critical {
        sequencer::advance_on_abort(session, task.seq_no).await;
    }

    match failure {
        RequestFailure::Stream(StreamError::Failure(e)) => {
            debug!("[Processor] client={} stream failed: {}", request.client_id, e);
            Disposition::Drop
        }
        RequestFailure::Stream(StreamError::Corrupt(reason)) => {
            warn!("[Processor] client={} sent a malformed frame: {}", request.client_id, reason);
            Disposition::Drop
        }
        RequestFailure::Stream(StreamError::ConnectionTerminate) => Disposition::Drop,
        RequestFailure::Stream(StreamError::ClientSessionTerminate(client_id)) => {
            ctx.registry.delete(client_id, true);
            Disposition::Drop
        }
        RequestFailure::Stream(StreamError::Interrupted) => {
            // Client aborted the in-flight compile; nothing to send back.
            Disposition::Recycle
        }
        RequestFailure::Stream(StreamError::CompilationInterrupted) => {
            // Class-unload race: the session is being reset, the client
            // retries later.
            debug!(
                "[Processor] client={} seqNo={} interrupted by class unload",
                request.client_id, task.seq_no
            );
            Disposition::Recycle
        }
        RequestFailure::Stream(StreamError::VersionIncompatible { .. }) => {
            stream.write_error(FailureCode::StreamVersionIncompatible, 0).await;
            Disposition::Drop
        }
        RequestFailure::Stream(StreamError::TypeMismatch { expected, actual }) => {
            warn!(
                "[Processor] client={} message type mismatch (expected {:?}, got {:?})",
                request.client_id, expected, actual
            );
            stream.write_error(FailureCode::StreamMessageTypeMismatch, 0).await;
            Disposition::Drop
        }
        RequestFailure::Compile(CompileError::OutOfMemory) => {
            let memory_state = ctx.health.memory_state(ctx.registry.size());
            stream
                .write_error(FailureCode::LowPhysicalMemory, memory_state as u64)
                .await;
            Disposition::Recycle
        }
        RequestFailure::Compile(CompileError::AotRecordUnavailable) => {
            let message = Message::AotCacheFailure { cache_unavailable: false, store_unavailable: true };
            if let Err(e) = stream.write(&message).await {
                debug!("[Processor] could not send AOT failure notice: {}", e);
            }
            Disposition::Recycle
        }
        RequestFailure::Compile(CompileError::Failed(reason)) => {
            warn!(
                "[Processor] client={} compilation of {:?} failed: {}",
                request.client_id, request.method, reason
            );
            stream.write_error(FailureCode::GenericFailure, 0).await;
            Disposition::Recycle
        }
        RequestFailure::Compile(CompileError::Stream(_)) => unreachable!("flattened by From"),
        RequestFailure::ClassGone => {
            stream.write_error(FailureCode::GenericFailure, 0).await;
            Disposition::Recycle
        }
    }
}

/// Errors on the very first read, before any session is bound.
async fn fail_before_session(
    ctx: &ServerContext,
    stream: &mut ServerStream,
    error: StreamError,
) -> Disposition {
    match error {
        StreamError::ConnectionTerminate => Disposition::Drop,
        StreamError::ClientSessionTerminate(client_id) => {
            info!("[Processor] client {} asked for session teardown", client_id);
            ctx.registry.delete(client_id, true);
            Disposition::Drop
        }
        StreamError::VersionIncompatible { ours, theirs } => {
            warn!(
                "[Processor] incompatible client version {:#x} (ours {:#x}) from {}",
                theirs,
                ours,
                stream.peer()
            );
            stream.write_error(FailureCode::StreamVersionIncompatible, 0).await;
            Disposition::Drop
        }
        StreamError::TypeMismatch { expected, actual } => {
            warn!(
                "[Processor] unexpected first message from {} (expected {:?}, got {:?})",
                stream.peer(),
                expected,
                actual
            );
            stream.write_error(FailureCode::StreamMessageTypeMismatch, 0).await;
            Disposition::Drop
        }
        StreamError::Corrupt(reason) => {
            warn!("[Processor] malformed frame from {}: {}", stream.peer(), reason);
            Disposition::Drop
        }
        StreamError::Failure(_) | StreamError::Interrupted | StreamError::CompilationInterrupted => {
            Disposition::Drop
        }
    }
}

async fn serve_aot_cache_map(
    ctx: &ServerContext,
    stream: &mut ServerStream,
    cache_name: &str,
) -> Disposition {
    let method_signatures = ctx
        .aot_map
        .as_ref()
        .and_then(|map| map.method_signatures(cache_name))
        .unwrap_or_default();
    info!(
        "[Processor] serving AOT cache '{}' method list ({} entries)",
        cache_name,
        method_signatures.len()
    );
    let message = Message::AotCacheMapReply { method_signatures };
    if let Err(e) = stream.write(&message).await {
        debug!("[Processor] could not send AOT cache map reply: {}", e);
    }
    Disposition::Drop
}
