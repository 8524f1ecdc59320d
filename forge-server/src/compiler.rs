// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use forge_model::{
    AssumptionKind, ChTableCommit, ClassHandle, CompilationRequest, ConstantPoolHandle,
    FieldAttributes, MethodHandle, ProfileEntry, RecordId, SerializedAssumption,
};
use forge_transport::{ServerStream, StreamError};

use crate::aot::AotCache;
use crate::scratch::ScratchCaches;
use crate::session::ClientSession;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Scratch allocation exceeded what the server can spare.
    #[error("server out of memory during compilation")]
    OutOfMemory,

    /// Server-offsets mode could not build a required AOT record; the
    /// compilation aborts instead of degrading.
    #[error("required AOT cache record unavailable")]
    AotRecordUnavailable,

    #[error("compilation failed: {0}")]
    Failed(String),
}

/// Everything a successful compilation hands back for the reply payload
/// (the processor attaches the health tags).
#[derive(Debug, Default, Clone)]
pub struct CompilationOutcome {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub chtable_commit: ChTableCommit,
    pub do_not_extend: Vec<ClassHandle>,
    pub assumptions: Vec<SerializedAssumption>,
    pub trampoline_methods: Vec<MethodHandle>,
    pub log: Vec<u8>,
}

/// The view of one in-flight compilation handed to the backend. The backend
/// calls back into the session caches and the stream through this context;
/// every lazy fetch happens on the request's own stream, under the reader
/// gate the processor already holds.
pub struct CompilationContext<'a> {
    pub session: &'a Arc<ClientSession>,
    pub stream: &'a mut ServerStream,
    pub scratch: &'a mut ScratchCaches,
    pub request: &'a CompilationRequest,
    pub aot_cache: Option<Arc<AotCache>>,
    pub(crate) validation_records: Vec<RecordId>,
}

impl<'a> CompilationContext<'a> {
    pub fn new(
        session: &'a Arc<ClientSession>,
        stream: &'a mut ServerStream,
        scratch: &'a mut ScratchCaches,
        request: &'a CompilationRequest,
        aot_cache: Option<Arc<AotCache>>,
    ) -> Self {
        Self {
            session,
            stream,
            scratch,
            request,
            aot_cache,
            validation_records: Vec::new(),
        }
    }

    /// Relocatable (AOT) compilations record validation evidence for every
    /// resolution and fold it into the stored method's dependency set.
    pub fn is_relocatable(&self) -> bool {
        self.request.use_aot_compilation
    }

    pub fn use_server_offsets(&self) -> bool {
        self.request.use_server_offsets
    }

    pub fn take_validation_records(&mut self) -> Vec<RecordId> {
        std::mem::take(&mut self.validation_records)
    }

    /// Profile data for one bytecode index: per-compilation scratch first,
    /// then the session cache, then a lazy fetch which populates both.
    pub async fn profile_entry(
        &mut self,
        method: MethodHandle,
        bytecode_index: u32,
    ) -> Result<Option<ProfileEntry>, CompileError> {
        if let Some(cached) = self.scratch.get_profile(method, bytecode_index) {
            return Ok(cached);
        }
        let session_hit = self.session.with_method_info(method, |info| {
            info.profile.as_ref().and_then(|p| p.get(&bytecode_index).cloned())
        });
        if let Some(Some(entry)) = session_hit {
            self.scratch.put_profile(method, bytecode_index, Some(entry.clone()));
            return Ok(Some(entry));
        }

        self.stream
            .write(&forge_model::Message::ProfileFetch { method, bytecode_index })
            .await?;
        let entry = match self.stream.read().await? {
            forge_model::Message::ProfileReply { entry } => entry,
            other => {
                return Err(StreamError::TypeMismatch {
                    expected: Some(forge_model::MessageType::ProfileReply),
                    actual: other.message_type(),
                }
                .into())
            }
        };

        // An empty answer is cached too: it is the "no info" sentinel that
        // stops us from asking again within this compilation. Real answers
        // also persist in the session for later compilations of the client.
        if let Some(entry) = &entry {
            self.session.cache_profile_entry(method, bytecode_index, entry.clone());
        }
        self.scratch.put_profile(method, bytecode_index, entry.clone());
        Ok(entry)
    }

    /// Field attributes for a constant-pool slot: scratch first, then the
    /// owning class's settled cache, then a lazy fetch. Only resolved
    /// answers are persisted into the session; unresolved ones stay in
    /// scratch behind the TTL.
    pub async fn field_attributes(
        &mut self,
        constant_pool: ConstantPoolHandle,
        cp_index: u32,
        is_static: bool,
    ) -> Result<Option<FieldAttributes>, CompileError> {
        if let Some(cached) = self.scratch.get_field_attributes(constant_pool, cp_index, is_static)
        {
            return Ok(cached);
        }
        if let Some(cached) = self.session.cached_field_attributes(constant_pool, cp_index, is_static)
        {
            self.scratch
                .put_field_attributes(constant_pool, cp_index, is_static, Some(cached));
            return Ok(Some(cached));
        }

        self.stream
            .write(&forge_model::Message::FieldAttributesFetch {
                constant_pool,
                cp_index,
                is_static,
            })
            .await?;
        let attributes = match self.stream.read().await? {
            forge_model::Message::FieldAttributesReply { attributes } => attributes,
            other => {
                return Err(StreamError::TypeMismatch {
                    expected: Some(forge_model::MessageType::FieldAttributesReply),
                    actual: other.message_type(),
                }
                .into())
            }
        };

        if let Some(attributes) = attributes {
            if !attributes.unresolved_in_cp {
                self.session
                    .cache_field_attributes(constant_pool, cp_index, is_static, attributes);
            }
        }
        self.scratch.put_field_attributes(constant_pool, cp_index, is_static, attributes);
        Ok(attributes)
    }

    /// Value of a static final field, through the session cache.
    pub async fn static_final_value(&mut self, address: u64) -> Result<Option<u64>, CompileError> {
        if let Some(cached) = self.scratch.get_static_final(address) {
            return Ok(cached);
        }
        if let Some(cached) = self.session.cached_static_final(address) {
            self.scratch.put_static_final(address, cached);
            return Ok(cached);
        }

        self.stream
            .write(&forge_model::Message::StaticFinalFetch { address })
            .await?;
        let value = match self.stream.read().await? {
            forge_model::Message::StaticFinalReply { value } => value,
            other => {
                return Err(StreamError::TypeMismatch {
                    expected: Some(forge_model::MessageType::StaticFinalReply),
                    actual: other.message_type(),
                }
                .into())
            }
        };
        self.session.cache_static_final(address, value);
        self.scratch.put_static_final(address, value);
        Ok(value)
    }
}

/// The optimizing compiler proper, a black box to this crate.
pub trait CompilerBackend: Send + Sync {
    fn compile<'a>(
        &'a self,
        ctx: &'a mut CompilationContext<'_>,
    ) -> BoxFuture<'a, Result<CompilationOutcome, CompileError>>;
}

/// Deterministic stand-in backend used by the daemon until a real optimizer
/// is linked in, and by the test suite. Identical `(class, method, opt
/// level)` inputs produce byte-identical artifacts, which the round-trip
/// tests rely on.
pub struct StubCompiler;

impl CompilerBackend for StubCompiler {
    fn compile<'a>(
        &'a self,
        ctx: &'a mut CompilationContext<'_>,
    ) -> BoxFuture<'a, Result<CompilationOutcome, CompileError>> {
        Box::pin(async move {
            let request = ctx.request;
            let mut hasher = blake3::Hasher::new();
            hasher.update(&request.class.0.to_le_bytes());
            hasher.update(&request.method.0.to_le_bytes());
            hasher.update(&[request.plan.opt_level as u8]);
            let mut code = vec![0u8; 64];
            hasher.finalize_xof().fill(&mut code);

            let data = request.method_index.to_le_bytes().to_vec();
            let assumptions = vec![SerializedAssumption {
                kind: AssumptionKind::ClassUnload,
                code_offset: 0,
                target: request.class.0,
            }];

            Ok(CompilationOutcome {
                code,
                data,
                chtable_commit: ChTableCommit::default(),
                do_not_extend: Vec::new(),
                assumptions,
                trampoline_methods: Vec::new(),
                log: Vec::new(),
            })
        })
    }
}
