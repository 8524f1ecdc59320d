// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use forge_model::{
    AddressRange, ClassHandle, ConstantPoolHandle, FieldAttributes, LoaderHandle, MethodHandle,
    ProfileEntry, RecordId, RomClassPayload,
};

use crate::shared_rom::SharedRomClass;

/// Bit set in `ClassInfo::class_flags` when the client reports an illegal
/// modification of a final field of the class.
pub const CLASS_FLAG_ILLEGAL_FINAL_MODIFICATIONS: u32 = 1 << 5;

/// Cached description of one client class. Lives until the class is unloaded
/// or redefined, at which point every dependent cache entry goes with it.
pub struct ClassInfo {
    pub rom: Arc<SharedRomClass>,
    pub remote_rom_ptr: u64,
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
    pub signature: String,
    pub name_identifying_loader: String,
    pub chain_offset_identifying_loader: u64,
    pub has_final_fields: bool,
    pub initialized: bool,
    /// Loaders other than `loader` that looked this class up by signature;
    /// the inverse purge must erase their `class_by_signature` keys too.
    pub referencing_class_loaders: HashSet<LoaderHandle>,
    /// Settled field-attribute answers keyed by `(cp_index, is_static)`.
    /// Unresolved answers never land here; they live in per-compilation
    /// scratch with a TTL.
    pub field_attributes: HashMap<(u32, bool), FieldAttributes>,
    pub aot_class_record: Option<RecordId>,
}

impl ClassInfo {
    pub fn from_payload(payload: &RomClassPayload, rom: Arc<SharedRomClass>) -> Self {
        // Loader-identifying name and chain offset travel together or not
        // at all.
        debug_assert_eq!(
            payload.name_identifying_loader.is_empty(),
            payload.chain_offset_identifying_loader == 0,
        );
        Self {
            rom,
            remote_rom_ptr: payload.remote_rom_ptr,
            methods_base: payload.methods_base,
            method_count: payload.method_count,
            parent: payload.parent,
            interfaces: payload.interfaces.clone(),
            base_component: payload.base_component,
            num_dimensions: payload.num_dimensions,
            loader: payload.loader,
            constant_pool: payload.constant_pool,
            class_flags: payload.class_flags,
            total_instance_size: payload.total_instance_size,
            signature: payload.signature.clone(),
            name_identifying_loader: payload.name_identifying_loader.clone(),
            chain_offset_identifying_loader: payload.chain_offset_identifying_loader,
            has_final_fields: payload.has_final_fields,
            initialized: payload.initialized,
            referencing_class_loaders: HashSet::new(),
            field_attributes: HashMap::new(),
            aot_class_record: None,
        }
    }

    /// Handle of the i-th method of this class; methods occupy a contiguous
    /// handle range on the client.
    pub fn method_at(&self, index: u32) -> Option<MethodHandle> {
        (index < self.method_count).then(|| MethodHandle(self.methods_base.0 + index as u64))
    }
}

/// Cached description of one client method.
pub struct MethodInfo {
    pub owning_class: ClassHandle,
    /// Index in the owning class's method table.
    pub index: u32,
    pub is_tracing: bool,
    /// Per-bytecode-index profile data, fetched lazily. `None` means never
    /// asked; an empty map means asked and the client had nothing.
    pub profile: Option<HashMap<u32, ProfileEntry>>,
    pub aot_method_record: Option<RecordId>,
}

/// Lazily populated class-chain data for one class.
#[derive(Default)]
pub struct ClassChainData {
    pub chain_offset: Option<u64>,
    pub chain: Option<Vec<ClassHandle>>,
    pub aot_chain_record: Option<RecordId>,
}

/// Sparse set of client addresses known to hold unloaded classes: the range
/// snapshot fetched at session init plus individually reported unloads.
pub struct UnloadedAddressSet {
    ranges: Vec<AddressRange>,
    max_ranges: usize,
    singles: HashSet<u64>,
}

impl UnloadedAddressSet {
    pub fn new(ranges: Vec<AddressRange>, max_ranges: usize) -> Self {
        let mut ranges = ranges;
        ranges.sort_by_key(|r| r.start);
        Self { ranges, max_ranges, singles: HashSet::new() }
    }

    pub fn add(&mut self, addr: u64) {
        if !self.contains(addr) {
            self.singles.insert(addr);
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        if self.singles.contains(&addr) {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.end <= addr);
        self.ranges.get(idx).map(|r| r.contains(addr)).unwrap_or(false)
    }

    pub fn max_ranges(&self) -> usize {
        self.max_ranges
    }
}

/// ROM class and method caches share one monitor, exactly like the caches
/// they mirror share their lifetime: methods die with their class.
#[derive(Default)]
pub struct RomMaps {
    pub classes: HashMap<ClassHandle, ClassInfo>,
    pub methods: HashMap<MethodHandle, MethodInfo>,
    pub unloaded: Option<UnloadedAddressSet>,
}

impl RomMaps {
    /// Registers the methods of a freshly cached class so later per-method
    /// lookups hit without a round trip.
    pub fn insert_class(&mut self, class: ClassHandle, info: ClassInfo) {
        let tracing_enabled = false;
        for index in 0..info.method_count {
            let handle = MethodHandle(info.methods_base.0 + index as u64);
            self.methods.entry(handle).or_insert_with(|| MethodInfo {
                owning_class: class,
                index,
                is_tracing: tracing_enabled,
                profile: None,
                aot_method_record: None,
            });
        }
        self.classes.insert(class, info);
    }

    /// Removes one class and every method belonging to it, returning the
    /// keys dependent caches must purge.
    pub fn evict_class(&mut self, class: ClassHandle) -> Option<EvictedClass> {
        let info = self.classes.remove(&class)?;
        for index in 0..info.method_count {
            let handle = MethodHandle(info.methods_base.0 + index as u64);
            self.methods.remove(&handle);
        }

        let mut signature_keys = Vec::with_capacity(1 + info.referencing_class_loaders.len());
        signature_keys.push((info.loader, info.signature.clone()));
        for loader in &info.referencing_class_loaders {
            signature_keys.push((*loader, info.signature.clone()));
        }

        Some(EvictedClass { constant_pool: info.constant_pool, signature_keys })
    }
}

/// Keys into the secondary indexes left behind by an evicted class.
pub struct EvictedClass {
    pub constant_pool: ConstantPoolHandle,
    pub signature_keys: Vec<(LoaderHandle, String)>,
}

/// Most recent well-known-classes answer used by relocatable compilations.
#[derive(Clone, PartialEq, Eq)]
pub struct WellKnownClassesCache {
    pub included_classes: u32,
    pub chain_offsets: Vec<u64>,
    /// Client-side pointer to the published offsets block.
    pub remote_ptr: u64,
    pub aot_record: Option<RecordId>,
}

/// Per-session J2I thunk registries, keyed by (signature, shareable).
#[derive(Default)]
pub struct ThunkRegistry {
    pub thunks: HashMap<(String, bool), u64>,
    pub invoke_exact: HashSet<(String, bool)>,
}
