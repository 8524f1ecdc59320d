// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

pub mod aot;
pub mod chtable;
pub mod health;
pub mod ids;
pub mod message;
pub mod plan;
pub mod version;
pub mod vm;

pub use aot::{RecordId, RecordKind};
pub use chtable::{AddressRange, ChTableCommit, ChTableMod};
pub use health::{MemoryState, ThreadState};
pub use ids::{ClassHandle, ClientId, ConstantPoolHandle, LoaderHandle, MethodHandle};
pub use message::{
    AssumptionKind, CompilationReply, CompilationRequest, FailureCode, FieldAttributes,
    FieldDataType, Message, MessageType, MethodDetails, ProfileEntry, ResolveKind,
    ResolvedMethodPayload, SerializedAssumption,
};
pub use plan::{OptLevel, OptimizationPlan};
pub use version::wire_version;
pub use vm::{CacheDescriptor, RomClassPayload, VmInfo};
