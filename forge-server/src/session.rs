// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use forge_model::{
    AddressRange, ChTableMod, ClassHandle, ClientId, ConstantPoolHandle, LoaderHandle, Message,
    MethodHandle, RecordId, RomClassPayload, VmInfo,
};
use forge_transport::{ServerStream, StreamError};
use tracing::{debug, info};

use crate::aot::{AotCache, AotCacheMap};
use crate::cache::{
    ClassChainData, ClassInfo, RomMaps, ThunkRegistry, UnloadedAddressSet, WellKnownClassesCache,
    CLASS_FLAG_ILLEGAL_FINAL_MODIFICATIONS,
};
use crate::chtable::ChTableMirror;
use crate::gate::ClassUnloadGate;
use crate::sequencer::SequencerState;
use crate::shared_rom::SharedRomClassCache;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// AOT cache binding of one session, materialized at most once.
#[derive(Default)]
pub struct AotBinding {
    pub cache: Option<Arc<AotCache>>,
    pub header_record: Option<RecordId>,
    /// Set when the binding permanently failed (size pressure, missing
    /// header); further requests skip the AOT paths for this client.
    pub disabled: bool,
}

/// All server-side state keyed to one client VM.
///
/// Lock discipline: `in_use` and `marked_for_deletion` are
/// mutated only under the registry lock; `num_active_threads` lives inside
/// `sequencing`; each cache has its own monitor, taken one at a time in the
/// canonical order and never held across stream I/O. The two locks that are
/// held across awaits (`sequencing`, `cache_init`) are async locks.
pub struct ClientSession {
    client_id: ClientId,
    last_access_ms: AtomicI64,
    in_use: AtomicI32,
    marked_for_deletion: AtomicBool,

    pub sequencing: tokio::sync::Mutex<SequencerState>,
    /// Serializes the caches-cleared re-initialization fetch.
    pub(crate) cache_init: tokio::sync::Mutex<()>,
    /// True when every cache is empty and the next request must fetch the
    /// full unloaded-ranges + CH-table snapshot from its client.
    caches_cleared: AtomicBool,

    rom_maps: Mutex<RomMaps>,
    class_by_signature: Mutex<HashMap<(LoaderHandle, String), ClassHandle>>,
    class_chains: Mutex<HashMap<ClassHandle, ClassChainData>>,
    cp_to_class: Mutex<HashMap<ConstantPoolHandle, ClassHandle>>,
    static_finals: Mutex<HashMap<u64, Option<u64>>>,
    thunks: Mutex<ThunkRegistry>,
    well_known: Mutex<Option<WellKnownClassesCache>>,
    chtable: Mutex<ChTableMirror>,
    known_ids: Mutex<HashSet<RecordId>>,

    vm_info: tokio::sync::Mutex<Option<Arc<VmInfo>>>,
    aot: Mutex<AotBinding>,

    gate: Arc<ClassUnloadGate>,
    shared_rom: Arc<SharedRomClassCache>,
}

impl ClientSession {
    pub fn new(
        client_id: ClientId,
        initial_seq_no: u32,
        shared_rom: Arc<SharedRomClassCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            last_access_ms: AtomicI64::new(now_millis()),
            in_use: AtomicI32::new(0),
            marked_for_deletion: AtomicBool::new(false),
            sequencing: tokio::sync::Mutex::new(SequencerState::new(initial_seq_no)),
            cache_init: tokio::sync::Mutex::new(()),
            caches_cleared: AtomicBool::new(true),
            rom_maps: Mutex::new(RomMaps::default()),
            class_by_signature: Mutex::new(HashMap::new()),
            class_chains: Mutex::new(HashMap::new()),
            cp_to_class: Mutex::new(HashMap::new()),
            static_finals: Mutex::new(HashMap::new()),
            thunks: Mutex::new(ThunkRegistry::default()),
            well_known: Mutex::new(None),
            chtable: Mutex::new(ChTableMirror::new()),
            known_ids: Mutex::new(HashSet::new()),
            vm_info: tokio::sync::Mutex::new(None),
            aot: Mutex::new(AotBinding::default()),
            gate: ClassUnloadGate::new(),
            shared_rom,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn gate(&self) -> &Arc<ClassUnloadGate> {
        &self.gate
    }

    // Lifecycle. All four are called only under the registry lock.

    pub fn inc_in_use(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_in_use(&self) -> i32 {
        let left = self.in_use.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(left >= 0, "in_use must stay non-negative");
        left
    }

    pub fn in_use(&self) -> i32 {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    pub fn update_last_access(&self) {
        self.last_access_ms.store(now_millis(), Ordering::Release);
    }

    pub fn millis_since_last_access(&self) -> i64 {
        now_millis() - self.last_access_ms.load(Ordering::Acquire)
    }

    pub fn caches_cleared(&self) -> bool {
        self.caches_cleared.load(Ordering::Acquire)
    }

    pub fn set_caches_cleared(&self, cleared: bool) {
        self.caches_cleared.store(cleared, Ordering::Release);
    }

    /// Destroys every entry in every cache. May only run with the writer
    /// side of the class-unload gate held and no active threads, or during
    /// session teardown; callers own that precondition.
    pub fn clear_caches(&self) {
        {
            let mut maps = self.rom_maps.lock().unwrap();
            maps.classes.clear();
            maps.methods.clear();
            maps.unloaded = None;
        }
        self.class_by_signature.lock().unwrap().clear();
        self.class_chains.lock().unwrap().clear();
        self.cp_to_class.lock().unwrap().clear();
        {
            let mut thunks = self.thunks.lock().unwrap();
            thunks.thunks.clear();
            thunks.invoke_exact.clear();
        }
        *self.well_known.lock().unwrap() = None;
        self.chtable.lock().unwrap().clear();
        self.known_ids.lock().unwrap().clear();
        self.set_caches_cleared(true);
        info!("[Session] client={} caches cleared", self.client_id);
    }

    /// Full clear while the client keeps sending requests: the redefinition
    /// sentinel path. Takes the writer gate itself.
    pub async fn clear_caches_locked(&self) {
        let _write = self.gate.write().await;
        self.clear_caches();
    }

    // Cache population.

    /// Installs the range snapshot obtained from the client at session init.
    pub fn initialize_unloaded_ranges(&self, ranges: Vec<AddressRange>, max_ranges: u32) {
        let mut maps = self.rom_maps.lock().unwrap();
        maps.unloaded = Some(UnloadedAddressSet::new(ranges, max_ranges as usize));
    }

    pub fn initialize_chtable(&self, snapshot: &[ChTableMod]) {
        let mut table = self.chtable.lock().unwrap();
        debug_assert!(!table.is_initialized());
        table.initialize(snapshot);
    }

    /// Caches one class description, interning the ROM body, registering the
    /// method handles and the signature index entry.
    pub fn cache_rom_class(&self, class: ClassHandle, payload: &RomClassPayload) {
        let rom = self.shared_rom.intern(payload.rom_body.clone());
        let info = ClassInfo::from_payload(payload, rom);
        let loader = info.loader;
        let signature = info.signature.clone();
        let constant_pool = info.constant_pool;

        {
            let mut maps = self.rom_maps.lock().unwrap();
            if maps.classes.contains_key(&class) {
                return; // another worker raced us here; first write wins
            }
            maps.insert_class(class, info);
        }
        self.class_by_signature
            .lock()
            .unwrap()
            .insert((loader, signature), class);
        self.cp_to_class.lock().unwrap().insert(constant_pool, class);
    }

    pub fn rom_class_is_cached(&self, class: ClassHandle) -> bool {
        self.rom_maps.lock().unwrap().classes.contains_key(&class)
    }

    /// Reads a `ClassInfo` projection without exposing the map guard.
    pub fn with_class_info<R>(
        &self,
        class: ClassHandle,
        f: impl FnOnce(&ClassInfo) -> R,
    ) -> Option<R> {
        let maps = self.rom_maps.lock().unwrap();
        maps.classes.get(&class).map(f)
    }

    pub fn with_method_info<R>(
        &self,
        method: MethodHandle,
        f: impl FnOnce(&crate::cache::MethodInfo) -> R,
    ) -> Option<R> {
        let maps = self.rom_maps.lock().unwrap();
        maps.methods.get(&method).map(f)
    }

    /// Persists one lazily fetched profile record. The per-method table is
    /// created on demand and freed when the owning class unloads.
    pub fn cache_profile_entry(
        &self,
        method: MethodHandle,
        bytecode_index: u32,
        entry: forge_model::ProfileEntry,
    ) {
        let mut maps = self.rom_maps.lock().unwrap();
        if let Some(info) = maps.methods.get_mut(&method) {
            info.profile
                .get_or_insert_with(HashMap::new)
                .insert(bytecode_index, entry);
        }
    }

    /// Ensures the ROM class for `class` is cached, preferring an embedded
    /// payload over a round trip. Returns false when the client reports the
    /// class gone.
    pub async fn ensure_rom_class(
        &self,
        stream: &mut ServerStream,
        class: ClassHandle,
        embedded: Option<&RomClassPayload>,
    ) -> Result<bool, StreamError> {
        if self.rom_class_is_cached(class) {
            return Ok(true);
        }
        if let Some(payload) = embedded {
            self.cache_rom_class(class, payload);
            return Ok(true);
        }

        stream.write(&Message::RomClassFetch { class }).await?;
        match stream.read().await? {
            Message::RomClassReply { info: Some(payload) } => {
                self.cache_rom_class(class, &payload);
                Ok(true)
            }
            Message::RomClassReply { info: None } => Ok(false),
            other => Err(StreamError::TypeMismatch {
                expected: Some(forge_model::MessageType::RomClassReply),
                actual: other.message_type(),
            }),
        }
    }

    pub fn lookup_class_by_signature(
        &self,
        loader: LoaderHandle,
        signature: &str,
    ) -> Option<ClassHandle> {
        self.class_by_signature
            .lock()
            .unwrap()
            .get(&(loader, signature.to_string()))
            .copied()
    }

    /// Registers that `loader` resolved `class` by name even though it is
    /// not the defining loader; the unload purge consults this index.
    pub fn record_referencing_loader(&self, class: ClassHandle, loader: LoaderHandle) {
        let signature = {
            let mut maps = self.rom_maps.lock().unwrap();
            let Some(info) = maps.classes.get_mut(&class) else { return };
            if info.loader == loader || !info.referencing_class_loaders.insert(loader) {
                return;
            }
            info.signature.clone()
        };
        self.class_by_signature.lock().unwrap().insert((loader, signature), class);
    }

    pub fn lookup_constant_pool(&self, cp: ConstantPoolHandle) -> Option<ClassHandle> {
        self.cp_to_class.lock().unwrap().get(&cp).copied()
    }

    /// Settled field-attribute answer for a constant-pool slot of the class
    /// owning `cp`. Purged with the class: the entries live in `ClassInfo`.
    pub fn cached_field_attributes(
        &self,
        cp: ConstantPoolHandle,
        cp_index: u32,
        is_static: bool,
    ) -> Option<forge_model::FieldAttributes> {
        let class = self.lookup_constant_pool(cp)?;
        let maps = self.rom_maps.lock().unwrap();
        maps.classes
            .get(&class)?
            .field_attributes
            .get(&(cp_index, is_static))
            .copied()
    }

    pub fn cache_field_attributes(
        &self,
        cp: ConstantPoolHandle,
        cp_index: u32,
        is_static: bool,
        attributes: forge_model::FieldAttributes,
    ) {
        let Some(class) = self.lookup_constant_pool(cp) else { return };
        let mut maps = self.rom_maps.lock().unwrap();
        if let Some(info) = maps.classes.get_mut(&class) {
            info.field_attributes.insert((cp_index, is_static), attributes);
        }
    }

    pub fn class_is_unloaded(&self, class: ClassHandle) -> bool {
        let maps = self.rom_maps.lock().unwrap();
        maps.unloaded.as_ref().map(|u| u.contains(class.0)).unwrap_or(false)
    }

    // Reconciliation.

    /// Applies one request's unloaded-classes list: marks addresses, purges
    /// the primary class/method caches and every dependent secondary index.
    /// Runs under the writer side of the gate because entries are freed.
    pub async fn process_unloaded_classes(
        &self,
        classes: &[ClassHandle],
        update_unloaded_set: bool,
    ) {
        if classes.is_empty() {
            return;
        }
        debug!(
            "[Session] client={} processing {} unloaded classes",
            self.client_id,
            classes.len()
        );
        let _write = self.gate.write().await;

        let mut evicted = Vec::new();
        {
            let mut maps = self.rom_maps.lock().unwrap();
            for &class in classes {
                if update_unloaded_set {
                    if let Some(unloaded) = maps.unloaded.as_mut() {
                        unloaded.add(class.0);
                    }
                }
                match maps.evict_class(class) {
                    Some(keys) => evicted.push((class, Some(keys))),
                    // Never cached: dependent indexes are purged by value.
                    None => evicted.push((class, None)),
                }
            }
        }

        {
            let mut chains = self.class_chains.lock().unwrap();
            for &class in classes {
                chains.remove(&class);
            }
        }

        {
            let mut by_signature = self.class_by_signature.lock().unwrap();
            for (class, keys) in &evicted {
                match keys {
                    Some(keys) => {
                        for key in &keys.signature_keys {
                            by_signature.remove(key);
                        }
                    }
                    None => by_signature.retain(|_, v| v != class),
                }
            }
        }

        {
            let mut cp_map = self.cp_to_class.lock().unwrap();
            for (class, keys) in &evicted {
                match keys {
                    Some(keys) => {
                        cp_map.remove(&keys.constant_pool);
                    }
                    None => cp_map.retain(|_, v| v != class),
                }
            }
        }
    }

    /// Raises the illegal-final-modification flag on each listed class that
    /// is present in the cache.
    pub fn process_illegal_final_modifications(&self, classes: &[ClassHandle]) {
        if classes.is_empty() {
            return;
        }
        let mut maps = self.rom_maps.lock().unwrap();
        for class in classes {
            if let Some(info) = maps.classes.get_mut(class) {
                info.class_flags |= CLASS_FLAG_ILLEGAL_FINAL_MODIFICATIONS;
            }
        }
    }

    pub fn apply_chtable_deltas(&self, mods: &[ChTableMod], removes: &[ClassHandle]) {
        if mods.is_empty() && removes.is_empty() {
            return;
        }
        let mut table = self.chtable.lock().unwrap();
        debug_assert!(table.is_initialized(), "CH-table must be initialized before deltas");
        table.apply(mods, removes);
    }

    pub fn with_chtable<R>(&self, f: impl FnOnce(&mut ChTableMirror) -> R) -> R {
        f(&mut self.chtable.lock().unwrap())
    }

    // Small typed caches.

    pub fn cached_static_final(&self, address: u64) -> Option<Option<u64>> {
        self.static_finals.lock().unwrap().get(&address).copied()
    }

    pub fn cache_static_final(&self, address: u64, value: Option<u64>) {
        self.static_finals.lock().unwrap().insert(address, value);
    }

    pub fn with_thunks<R>(&self, f: impl FnOnce(&mut ThunkRegistry) -> R) -> R {
        f(&mut self.thunks.lock().unwrap())
    }

    /// Returns the cached well-known-classes answer when the included set
    /// and offsets match exactly.
    pub fn cached_well_known(
        &self,
        included_classes: u32,
        chain_offsets: &[u64],
    ) -> Option<WellKnownClassesCache> {
        let cached = self.well_known.lock().unwrap();
        cached.as_ref().filter(|c| {
            c.included_classes == included_classes && c.chain_offsets == chain_offsets
        }).cloned()
    }

    pub fn cache_well_known(&self, entry: WellKnownClassesCache) {
        *self.well_known.lock().unwrap() = Some(entry);
    }

    // AOT cache integration.

    pub fn merge_known_ids(&self, ids: &[RecordId]) {
        if ids.is_empty() {
            return;
        }
        self.known_ids.lock().unwrap().extend(ids.iter().copied());
    }

    pub fn with_known_ids<R>(&self, f: impl FnOnce(&HashSet<RecordId>) -> R) -> R {
        f(&self.known_ids.lock().unwrap())
    }

    pub async fn get_or_cache_vm_info(
        &self,
        stream: &mut ServerStream,
    ) -> Result<Arc<VmInfo>, StreamError> {
        let mut slot = self.vm_info.lock().await;
        if let Some(info) = slot.as_ref() {
            return Ok(info.clone());
        }
        stream.write(&Message::VmInfoFetch).await?;
        match stream.read().await? {
            Message::VmInfoReply(info) => {
                let info = Arc::new(info);
                *slot = Some(info.clone());
                Ok(info)
            }
            other => Err(StreamError::TypeMismatch {
                expected: Some(forge_model::MessageType::VmInfoReply),
                actual: other.message_type(),
            }),
        }
    }

    /// One-time materialization of the AOT cache bound to this client's AOT
    /// header. A `None` result with the binding not disabled
    /// means the cache is still loading from disk; try again next request.
    pub async fn get_or_create_aot_cache(
        &self,
        stream: &mut ServerStream,
        map: Option<&Arc<AotCacheMap>>,
    ) -> Result<Option<Arc<AotCache>>, StreamError> {
        {
            let binding = self.aot.lock().unwrap();
            if let Some(cache) = &binding.cache {
                return Ok(Some(cache.clone()));
            }
            if binding.disabled {
                return Ok(None);
            }
        }

        let vm_info = self.get_or_cache_vm_info(stream).await?;
        if !vm_info.uses_aot_cache {
            return Ok(None);
        }
        let Some(map) = map else {
            debug!("[Session] client={} requested AOT cache but it is disabled at the server", self.client_id);
            self.aot.lock().unwrap().disabled = true;
            return Ok(None);
        };

        let (cache, loading) = map.clone().get(&vm_info.aot_cache_name, self.client_id);
        let Some(cache) = cache else {
            if loading {
                debug!(
                    "[Session] client={} AOT cache '{}' still loading from disk",
                    self.client_id, vm_info.aot_cache_name
                );
                return Ok(None);
            }
            info!(
                "[Session] client={} AOT cache '{}' unavailable (size limit), disabling",
                self.client_id, vm_info.aot_cache_name
            );
            self.aot.lock().unwrap().disabled = true;
            return Ok(None);
        };

        let Some(header_record) = cache.get_or_create_header(&vm_info.aot_header) else {
            info!(
                "[Session] client={} failed to create AOT header record, disabling AOT cache",
                self.client_id
            );
            self.aot.lock().unwrap().disabled = true;
            return Ok(None);
        };

        let mut binding = self.aot.lock().unwrap();
        // Header record is published before the cache: code that sees the
        // cache may assume the header record exists.
        binding.header_record = Some(header_record);
        binding.cache = Some(cache.clone());
        Ok(Some(cache))
    }

    pub fn aot_header_record(&self) -> Option<RecordId> {
        self.aot.lock().unwrap().header_record
    }

    /// AOT class record for one cached class; `None` with
    /// `missing_loader_info` set distinguishes the unrecoverable case from
    /// cache size pressure.
    pub fn class_record(
        &self,
        class: ClassHandle,
        cache: &Arc<AotCache>,
        missing_loader_info: &mut bool,
    ) -> Option<RecordId> {
        let (cached_record, loader_name, signature, digest) = {
            let maps = self.rom_maps.lock().unwrap();
            let info = maps.classes.get(&class)?;
            (
                info.aot_class_record,
                info.name_identifying_loader.clone(),
                info.signature.clone(),
                *info.rom.digest(),
            )
        };
        if let Some(record) = cached_record {
            return Some(record);
        }
        if loader_name.is_empty() {
            *missing_loader_info = true;
            return None;
        }

        let loader_record = cache.get_or_create_loader(&loader_name)?;
        let record = cache.get_or_create_class(loader_record, &signature, digest)?;

        let mut maps = self.rom_maps.lock().unwrap();
        if let Some(info) = maps.classes.get_mut(&class) {
            info.aot_class_record = Some(record);
        }
        Some(record)
    }

    pub fn method_record(
        &self,
        method: MethodHandle,
        defining_class_record: RecordId,
        cache: &Arc<AotCache>,
    ) -> Option<RecordId> {
        let (cached, index) = {
            let maps = self.rom_maps.lock().unwrap();
            let info = maps.methods.get(&method)?;
            (info.aot_method_record, info.index)
        };
        if let Some(record) = cached {
            return Some(record);
        }
        let record = cache.get_or_create_method(defining_class_record, index)?;
        let mut maps = self.rom_maps.lock().unwrap();
        if let Some(info) = maps.methods.get_mut(&method) {
            info.aot_method_record = Some(record);
        }
        Some(record)
    }

    /// Computes (and caches) the class-chain record keying this class in the
    /// AOT cache, lazily fetching the chain and any uncached classes from
    /// the client. Must be called with the reader gate held.
    pub async fn class_chain_record(
        &self,
        stream: &mut ServerStream,
        class: ClassHandle,
        chain_offset: u64,
        ram_class_chain: &[ClassHandle],
        cache: &Arc<AotCache>,
        missing_loader_info: &mut bool,
    ) -> Result<Option<RecordId>, StreamError> {
        if let Some(record) = self.class_chains.lock().unwrap().get(&class).and_then(|d| d.aot_chain_record) {
            return Ok(Some(record));
        }

        let chain: Vec<ClassHandle> = if ram_class_chain.is_empty() {
            stream.write(&Message::ClassChainFetch { class }).await?;
            match stream.read().await? {
                Message::ClassChainReply { chain, .. } => chain,
                other => {
                    return Err(StreamError::TypeMismatch {
                        expected: Some(forge_model::MessageType::ClassChainReply),
                        actual: other.message_type(),
                    })
                }
            }
        } else {
            ram_class_chain.to_vec()
        };
        if chain.is_empty() {
            return Ok(None);
        }

        let mut class_records = Vec::with_capacity(chain.len());
        for &chain_class in &chain {
            if !self.ensure_rom_class(stream, chain_class, None).await? {
                return Ok(None);
            }
            match self.class_record(chain_class, cache, missing_loader_info) {
                Some(record) => class_records.push(record),
                None => return Ok(None),
            }
        }

        let Some(chain_record) = cache.get_or_create_chain(class_records) else {
            return Ok(None);
        };

        let mut chains = self.class_chains.lock().unwrap();
        let data = chains.entry(class).or_insert_with(ClassChainData::default);
        data.chain_offset = Some(chain_offset);
        data.chain = Some(chain);
        data.aot_chain_record = Some(chain_record);
        Ok(Some(chain_record))
    }

    /// Counters for the periodic stats event.
    pub fn stats(&self) -> SessionStats {
        let (cached_classes, cached_methods) = {
            let maps = self.rom_maps.lock().unwrap();
            (maps.classes.len(), maps.methods.len())
        };
        SessionStats {
            cached_classes,
            cached_methods,
            chtable_classes: self.chtable.lock().unwrap().len(),
            known_ids: self.known_ids.lock().unwrap().len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub cached_classes: usize,
    pub cached_methods: usize,
    pub chtable_classes: usize,
    pub known_ids: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aot::{AotCacheMap, AotConfig};

    fn session() -> Arc<ClientSession> {
        let rom_cache = SharedRomClassCache::new();
        rom_cache.initialize();
        ClientSession::new(ClientId(1), 1, rom_cache)
    }

    fn payload(class: ClassHandle, signature: &str) -> RomClassPayload {
        RomClassPayload {
            rom_body: signature.as_bytes().to_vec(),
            remote_rom_ptr: 0x10,
            methods_base: MethodHandle(class.0 * 0x100),
            method_count: 2,
            parent: None,
            interfaces: vec![],
            base_component: None,
            num_dimensions: 0,
            loader: LoaderHandle(0x11),
            constant_pool: ConstantPoolHandle(class.0 + 1),
            class_flags: 0,
            total_instance_size: 16,
            signature: signature.to_string(),
            name_identifying_loader: "app".to_string(),
            chain_offset_identifying_loader: 0x40,
            has_final_fields: false,
            initialized: true,
        }
    }

    #[tokio::test]
    async fn unload_purges_referencing_loader_entries_too() {
        let session = session();
        let class = ClassHandle(0x30);
        session.cache_rom_class(class, &payload(class, "Lr/R;"));
        session.record_referencing_loader(class, LoaderHandle(0x99));

        assert_eq!(session.lookup_class_by_signature(LoaderHandle(0x99), "Lr/R;"), Some(class));
        session.process_unloaded_classes(&[class], false).await;

        assert_eq!(session.lookup_class_by_signature(LoaderHandle(0x11), "Lr/R;"), None);
        assert_eq!(session.lookup_class_by_signature(LoaderHandle(0x99), "Lr/R;"), None);
        assert_eq!(session.lookup_constant_pool(ConstantPoolHandle(class.0 + 1)), None);
    }

    #[tokio::test]
    async fn unloaded_address_set_tracks_reported_classes() {
        let session = session();
        session.initialize_unloaded_ranges(vec![], 16);
        let class = ClassHandle(0x31);
        session.cache_rom_class(class, &payload(class, "Lu/U;"));

        assert!(!session.class_is_unloaded(class));
        session.process_unloaded_classes(&[class], true).await;
        assert!(session.class_is_unloaded(class));
    }

    #[test]
    fn thunk_registry_and_well_known_cache_round_trip() {
        let session = session();
        session.with_thunks(|t| {
            t.thunks.insert(("(I)V".to_string(), true), 0x5000);
            t.invoke_exact.insert(("(I)V".to_string(), false));
        });
        assert_eq!(
            session.with_thunks(|t| t.thunks.get(&("(I)V".to_string(), true)).copied()),
            Some(0x5000)
        );

        session.cache_well_known(WellKnownClassesCache {
            included_classes: 0b101,
            chain_offsets: vec![8, 16],
            remote_ptr: 0x6000,
            aot_record: None,
        });
        assert!(session.cached_well_known(0b101, &[8, 16]).is_some());
        // Any difference in the included set or offsets misses.
        assert!(session.cached_well_known(0b111, &[8, 16]).is_none());
        assert!(session.cached_well_known(0b101, &[8, 24]).is_none());
    }

    #[tokio::test]
    async fn clear_caches_empties_everything_and_requests_a_snapshot() {
        let session = session();
        session.set_caches_cleared(false);
        let class = ClassHandle(0x32);
        session.cache_rom_class(class, &payload(class, "Lc/C;"));
        session.cache_static_final(0x77, Some(9));
        session.merge_known_ids(&[RecordId::new(forge_model::RecordKind::Class, 0)]);

        session.clear_caches();

        assert!(session.caches_cleared());
        assert!(!session.rom_class_is_cached(class));
        assert_eq!(session.stats().known_ids, 0);
        // Static finals survive a clear: they are keyed by address, not by
        // class handle, and stay valid across unload storms.
        assert_eq!(session.cached_static_final(0x77), Some(Some(9)));
    }

    #[test]
    fn method_records_are_interned_once_per_method() {
        let session = session();
        let class = ClassHandle(0x33);
        session.cache_rom_class(class, &payload(class, "Lm/M;"));

        let map = AotCacheMap::new(AotConfig::default());
        let (cache, _) = map.get("unit", ClientId(1));
        let cache = cache.unwrap();

        let mut missing = false;
        let class_record = session.class_record(class, &cache, &mut missing).unwrap();
        assert!(!missing);

        let method = MethodHandle(class.0 * 0x100);
        let first = session.method_record(method, class_record, &cache).unwrap();
        let second = session.method_record(method, class_record, &cache).unwrap();
        assert_eq!(first, second);
    }
}
