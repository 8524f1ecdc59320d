// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::aot::RecordId;
use crate::chtable::{AddressRange, ChTableCommit, ChTableMod};
use crate::health::{MemoryState, ThreadState};
use crate::ids::{ClassHandle, ClientId, ConstantPoolHandle, LoaderHandle, MethodHandle};
use crate::plan::OptimizationPlan;
use crate::vm::{RomClassPayload, VmInfo};

/// Frame type tag, carried in every frame header as a u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    CompilationRequest = 0,
    ConnectionTerminate = 1,
    ClientSessionTerminate = 2,
    CompilationInterrupted = 3,
    CompilationCode = 4,
    CompilationFailure = 5,
    GetUnloadedClassRangesAndChTable = 6,
    UnloadedClassRangesAndChTable = 7,
    VmInfoFetch = 8,
    VmInfoReply = 9,
    RomClassFetch = 10,
    RomClassReply = 11,
    ClassChainFetch = 12,
    ClassChainReply = 13,
    StaticFinalFetch = 14,
    StaticFinalReply = 15,
    MethodResolveFetch = 16,
    MethodResolveReply = 17,
    ProfileFetch = 18,
    ProfileReply = 19,
    AotCacheMapRequest = 20,
    AotCacheMapReply = 21,
    AotCacheSerializedMethod = 22,
    AotCacheFailure = 23,
    FieldAttributesFetch = 24,
    FieldAttributesReply = 25,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<MessageType> {
        use MessageType::*;
        const ALL: [MessageType; 26] = [
            CompilationRequest,
            ConnectionTerminate,
            ClientSessionTerminate,
            CompilationInterrupted,
            CompilationCode,
            CompilationFailure,
            GetUnloadedClassRangesAndChTable,
            UnloadedClassRangesAndChTable,
            VmInfoFetch,
            VmInfoReply,
            RomClassFetch,
            RomClassReply,
            ClassChainFetch,
            ClassChainReply,
            StaticFinalFetch,
            StaticFinalReply,
            MethodResolveFetch,
            MethodResolveReply,
            ProfileFetch,
            ProfileReply,
            AotCacheMapRequest,
            AotCacheMapReply,
            AotCacheSerializedMethod,
            AotCacheFailure,
            FieldAttributesFetch,
            FieldAttributesReply,
        ];
        ALL.get(raw as usize).copied()
    }

    /// Terminal replies may be sent even while a class-unload writer is
    /// waiting; everything else must observe the interrupt probe first.
    pub fn is_terminal_reply(self) -> bool {
        matches!(
            self,
            MessageType::CompilationCode
                | MessageType::CompilationFailure
                | MessageType::AotCacheSerializedMethod
                | MessageType::AotCacheFailure
        )
    }
}

/// Status codes carried by `CompilationFailure`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub enum FailureCode {
    StreamVersionIncompatible,
    StreamMessageTypeMismatch,
    /// The server lost a critical predecessor and reset the session; the
    /// client must resubmit with fresh dependencies.
    StreamLostMessage,
    LowPhysicalMemory,
    AotCacheUnavailable,
    GenericFailure,
}

/// What kind of method body the request names. JitDump recompilations are
/// exempt from critical-request ordering: their state deltas are ignored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub enum MethodDetails {
    Ordinary,
    JitDump,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
pub enum ResolveKind {
    Static,
    Special,
    Virtual,
    Interface,
}

/// Attributes of one instance or static field resolved through a
/// constant-pool slot. For static fields `offset_or_address` is an absolute
/// client address; for instance fields it is an object offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub struct FieldAttributes {
    pub offset_or_address: u64,
    pub data_type: FieldDataType,
    pub is_volatile: bool,
    pub is_final: bool,
    pub is_private: bool,
    /// The slot has not been resolved on the client yet; the answer may
    /// change and must not be cached past its TTL.
    pub unresolved_in_cp: bool,
    pub defining_class: Option<ClassHandle>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
pub enum FieldDataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Address,
}

/// Answer to a `MethodResolveFetch`. `None` fields mirror an unresolved
/// constant-pool slot on the client.
#[derive(
    Debug, Clone, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct ResolvedMethodPayload {
    pub method: MethodHandle,
    pub defining_class: ClassHandle,
    pub vtable_slot: u32,
    pub unresolved_in_cp: bool,
    /// Entry point of an already-jitted body on the client, zero if none.
    pub jitted_entry: u64,
}

/// One bytecode-index profile record fetched lazily from the client.
#[derive(
    Debug, Clone, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct ProfileEntry {
    pub bytecode_index: u32,
    pub samples: u64,
    pub dominant_target: Option<ClassHandle>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub enum AssumptionKind {
    ClassUnload,
    MethodOverride,
    StaticFinalFold,
}

/// Runtime assumption created during a compilation, serialized for the
/// client-side installer to register.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub struct SerializedAssumption {
    pub kind: AssumptionKind,
    pub code_offset: u64,
    pub target: u64,
}

/// The primary client-to-server message.
#[derive(
    Debug, Clone, PartialEq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct CompilationRequest {
    pub client_id: ClientId,
    /// Client-assigned, monotonically increasing per client.
    pub seq_no: u32,
    /// Highest critical seqNo this request depends on; `<= seq_no`.
    pub critical_seq_no: u32,
    pub method: MethodHandle,
    pub class: ClassHandle,
    pub details: MethodDetails,
    pub plan: OptimizationPlan,
    pub options: String,
    pub recompilation_info: Vec<u8>,
    /// Classes unloaded on the client since the previous critical request.
    /// May contain `ClassHandle::REDEFINITION_SENTINEL`.
    pub unloaded_classes: Vec<ClassHandle>,
    pub illegal_final_modifications: Vec<ClassHandle>,
    pub chtable_removes: Vec<ClassHandle>,
    pub chtable_mods: Vec<ChTableMod>,
    /// Class description embedded to save a round trip, when the client
    /// believes the server has not cached it yet.
    pub class_info: Option<RomClassPayload>,
    pub use_aot_compilation: bool,
    pub in_startup_phase: bool,
    pub aot_cache_store: bool,
    pub aot_cache_load: bool,
    /// Index of the method in its defining class's method table.
    pub method_index: u32,
    pub defining_class_chain_offset: u64,
    pub ram_class_chain: Vec<ClassHandle>,
    pub uncached_classes: Vec<ClassHandle>,
    pub uncached_class_infos: Vec<RomClassPayload>,
    /// AOT record ids the client has learned since its last request.
    pub new_known_ids: Vec<RecordId>,
    /// The client asks the server to use AOT record ids in place of
    /// shared-cache offsets; store failures then abort instead of degrading.
    pub use_server_offsets: bool,
}

/// The success reply payload.
#[derive(
    Debug, Clone, PartialEq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct CompilationReply {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub chtable_commit: ChTableCommit,
    pub do_not_extend: Vec<ClassHandle>,
    pub assumptions: Vec<SerializedAssumption>,
    pub trampoline_methods: Vec<MethodHandle>,
    pub compilation_log: Vec<u8>,
    pub memory_state: MemoryState,
    pub thread_state: ThreadState,
}

/// Every frame payload. The variant must agree with the frame header's type
/// tag; the stream layer rejects frames where the two disagree.
#[derive(
    Debug, Clone,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub enum Message {
    CompilationRequest(CompilationRequest),
    ConnectionTerminate,
    ClientSessionTerminate { client_id: ClientId },
    CompilationInterrupted,
    CompilationCode(CompilationReply),
    CompilationFailure { code: FailureCode, detail: u64 },
    GetUnloadedClassRangesAndChTable { server_uid: u64 },
    UnloadedClassRangesAndChTable {
        ranges: Vec<AddressRange>,
        max_ranges: u32,
        chtable: Vec<ChTableMod>,
    },
    VmInfoFetch,
    VmInfoReply(VmInfo),
    RomClassFetch { class: ClassHandle },
    RomClassReply { info: Option<RomClassPayload> },
    ClassChainFetch { class: ClassHandle },
    ClassChainReply { chain: Vec<ClassHandle>, chain_offset: u64 },
    StaticFinalFetch { address: u64 },
    StaticFinalReply { value: Option<u64> },
    MethodResolveFetch {
        constant_pool: ConstantPoolHandle,
        cp_index: u32,
        kind: ResolveKind,
    },
    MethodResolveReply { resolved: Option<ResolvedMethodPayload> },
    ProfileFetch { method: MethodHandle, bytecode_index: u32 },
    ProfileReply { entry: Option<ProfileEntry> },
    AotCacheMapRequest { cache_name: String },
    AotCacheMapReply { method_signatures: Vec<String> },
    AotCacheSerializedMethod {
        method: Vec<u8>,
        records: Vec<Vec<u8>>,
        plan: OptimizationPlan,
        memory_state: MemoryState,
        thread_state: ThreadState,
    },
    AotCacheFailure {
        cache_unavailable: bool,
        store_unavailable: bool,
    },
    FieldAttributesFetch {
        constant_pool: ConstantPoolHandle,
        cp_index: u32,
        is_static: bool,
    },
    FieldAttributesReply { attributes: Option<FieldAttributes> },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::CompilationRequest(_) => MessageType::CompilationRequest,
            Message::ConnectionTerminate => MessageType::ConnectionTerminate,
            Message::ClientSessionTerminate { .. } => MessageType::ClientSessionTerminate,
            Message::CompilationInterrupted => MessageType::CompilationInterrupted,
            Message::CompilationCode(_) => MessageType::CompilationCode,
            Message::CompilationFailure { .. } => MessageType::CompilationFailure,
            Message::GetUnloadedClassRangesAndChTable { .. } => {
                MessageType::GetUnloadedClassRangesAndChTable
            }
            Message::UnloadedClassRangesAndChTable { .. } => {
                MessageType::UnloadedClassRangesAndChTable
            }
            Message::VmInfoFetch => MessageType::VmInfoFetch,
            Message::VmInfoReply(_) => MessageType::VmInfoReply,
            Message::RomClassFetch { .. } => MessageType::RomClassFetch,
            Message::RomClassReply { .. } => MessageType::RomClassReply,
            Message::ClassChainFetch { .. } => MessageType::ClassChainFetch,
            Message::ClassChainReply { .. } => MessageType::ClassChainReply,
            Message::StaticFinalFetch { .. } => MessageType::StaticFinalFetch,
            Message::StaticFinalReply { .. } => MessageType::StaticFinalReply,
            Message::MethodResolveFetch { .. } => MessageType::MethodResolveFetch,
            Message::MethodResolveReply { .. } => MessageType::MethodResolveReply,
            Message::ProfileFetch { .. } => MessageType::ProfileFetch,
            Message::ProfileReply { .. } => MessageType::ProfileReply,
            Message::AotCacheMapRequest { .. } => MessageType::AotCacheMapRequest,
            Message::AotCacheMapReply { .. } => MessageType::AotCacheMapReply,
            Message::AotCacheSerializedMethod { .. } => MessageType::AotCacheSerializedMethod,
            Message::AotCacheFailure { .. } => MessageType::AotCacheFailure,
            Message::FieldAttributesFetch { .. } => MessageType::FieldAttributesFetch,
            Message::FieldAttributesReply { .. } => MessageType::FieldAttributesReply,
        }
    }

    /// Fetch replies pair with the fetch that elicited them. Used by the
    /// stream layer to match a reply against the last outgoing type.
    pub fn reply_type_for(request: MessageType) -> Option<MessageType> {
        use MessageType::*;
        Some(match request {
            GetUnloadedClassRangesAndChTable => UnloadedClassRangesAndChTable,
            VmInfoFetch => VmInfoReply,
            RomClassFetch => RomClassReply,
            ClassChainFetch => ClassChainReply,
            StaticFinalFetch => StaticFinalReply,
            MethodResolveFetch => MethodResolveReply,
            ProfileFetch => ProfileReply,
            FieldAttributesFetch => FieldAttributesReply,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips_through_u32() {
        for raw in 0..26 {
            let ty = MessageType::from_u32(raw).expect("tag must decode");
            assert_eq!(ty as u32, raw);
        }
        assert_eq!(MessageType::from_u32(26), None);
    }

    #[test]
    fn terminal_replies_are_the_only_interrupt_exempt_types() {
        let exempt: Vec<_> = (0..26)
            .filter_map(MessageType::from_u32)
            .filter(|t| t.is_terminal_reply())
            .collect();
        assert_eq!(
            exempt,
            vec![
                MessageType::CompilationCode,
                MessageType::CompilationFailure,
                MessageType::AotCacheSerializedMethod,
                MessageType::AotCacheFailure,
            ]
        );
    }
}
