// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::ids::{ClassHandle, ConstantPoolHandle, LoaderHandle, MethodHandle};

/// Descriptor of one client shared-class-cache segment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub struct CacheDescriptor {
    pub cache_start: u64,
    pub cache_size: u64,
    pub rom_class_start: u64,
    pub metadata_start: u64,
}

/// One-shot immutable description of a client VM, fetched once per session
/// and cached for its lifetime.
#[derive(
    Debug, Clone, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct VmInfo {
    pub process_id: u64,
    pub gc_write_barrier: u32,
    pub compressed_refs_shift: u32,
    pub pointer_width: u32,
    pub string_compression_enabled: bool,
    pub uses_method_trampolines: bool,
    pub interpreter_vtable_offset: u64,
    pub helper_addresses: Vec<u64>,
    pub shared_cache_descriptors: Vec<CacheDescriptor>,
    /// Fingerprint of the client's AOT configuration; compilations from
    /// clients with different headers never share cached artifacts.
    pub aot_header: Vec<u8>,
    pub uses_aot_cache: bool,
    pub aot_cache_name: String,
}

/// Full description of one client class, shipped either inside a compilation
/// request or in answer to a `RomClassFetch`.
#[derive(
    Debug, Clone, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct RomClassPayload {
    /// The ROM class body, copied in full so the optimizer can read it
    /// without round-tripping to the client.
    pub rom_body: Vec<u8>,
    /// Address of the ROM class on the client.
    pub remote_rom_ptr: u64,
    /// Methods of a class occupy a contiguous handle range starting here.
    pub methods_base: MethodHandle,
    pub method_count: u32,
    pub parent: Option<ClassHandle>,
    pub interfaces: Vec<ClassHandle>,
    pub base_component: Option<ClassHandle>,
    pub num_dimensions: i32,
    pub loader: LoaderHandle,
    pub constant_pool: ConstantPoolHandle,
    pub class_flags: u32,
    pub total_instance_size: u64,
    /// JVM-style signature, e.g. `Lfoo/Bar;`.
    pub signature: String,
    /// Name identifying the defining loader for AOT record purposes.
    /// Empty iff `chain_offset_identifying_loader` is zero.
    pub name_identifying_loader: String,
    pub chain_offset_identifying_loader: u64,
    pub has_final_fields: bool,
    pub initialized: bool,
}
