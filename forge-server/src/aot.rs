// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use forge_model::{ClientId, OptLevel, RecordId, RecordKind};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{debug, info, warn};

/// Process-wide AOT cache tuning.
#[derive(Debug, Clone)]
pub struct AotConfig {
    pub enabled: bool,
    /// One file per cache name lives here when set.
    pub persist_dir: Option<PathBuf>,
    /// Combined size budget across every named cache.
    pub max_bytes: u64,
}

impl Default for AotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_dir: None,
            max_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Content of one interned record. The keying fields double as the interning
/// identity; everything a record references is listed in its `deps`.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RecordPayload {
    ClassLoader { name: String },
    Class { loader: RecordId, signature: String, rom_digest: [u8; 32] },
    Method { defining_class: RecordId, index: u32 },
    ClassChain { classes: Vec<RecordId> },
    WellKnownClasses { included_classes: u32, chains: Vec<RecordId> },
    AotHeader { header: Vec<u8> },
}

impl RecordPayload {
    fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::ClassLoader { .. } => RecordKind::ClassLoader,
            RecordPayload::Class { .. } => RecordKind::Class,
            RecordPayload::Method { .. } => RecordKind::Method,
            RecordPayload::ClassChain { .. } => RecordKind::ClassChain,
            RecordPayload::WellKnownClasses { .. } => RecordKind::WellKnownClasses,
            RecordPayload::AotHeader { .. } => RecordKind::AotHeader,
        }
    }

    fn deps(&self) -> Vec<RecordId> {
        match self {
            RecordPayload::ClassLoader { .. } | RecordPayload::AotHeader { .. } => Vec::new(),
            RecordPayload::Class { loader, .. } => vec![*loader],
            RecordPayload::Method { defining_class, .. } => vec![*defining_class],
            RecordPayload::ClassChain { classes } => classes.clone(),
            RecordPayload::WellKnownClasses { chains, .. } => chains.clone(),
        }
    }

    fn approximate_size(&self) -> u64 {
        let variable = match self {
            RecordPayload::ClassLoader { name } => name.len(),
            RecordPayload::Class { signature, .. } => signature.len() + 32,
            RecordPayload::Method { .. } => 0,
            RecordPayload::ClassChain { classes } => classes.len() * 16,
            RecordPayload::WellKnownClasses { chains, .. } => chains.len() * 16,
            RecordPayload::AotHeader { header } => header.len(),
        };
        64 + variable as u64
    }
}

/// One interned record with its stable `(kind, id)` identity.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct AotRecord {
    pub id: RecordId,
    pub payload: RecordPayload,
}

impl AotRecord {
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|b| b.into_vec())
            .unwrap_or_default()
    }
}

/// One compiled method stored in the cache, keyed by
/// `(defining class chain, method index, opt level, AOT header)`.
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct CachedAotMethod {
    pub defining_chain: RecordId,
    pub method_index: u32,
    pub opt_level: OptLevel,
    pub header: RecordId,
    /// Every record this method's relocation data references.
    pub deps: Vec<RecordId>,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub signature: String,
}

impl CachedAotMethod {
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        rkyv::to_bytes::<_, 1024>(self)
            .map(|b| b.into_vec())
            .unwrap_or_default()
    }

    fn approximate_size(&self) -> u64 {
        (self.code.len() + self.data.len() + self.signature.len() + 64) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MethodKey {
    chain: RecordId,
    index: u32,
    opt_level: OptLevel,
    header: RecordId,
}

#[derive(Default)]
struct CacheState {
    next_ids: HashMap<RecordKind, u64>,
    records: HashMap<RecordId, Arc<AotRecord>>,
    loaders_by_name: HashMap<String, RecordId>,
    classes_by_key: HashMap<(RecordId, String, [u8; 32]), RecordId>,
    methods_by_key: HashMap<(RecordId, u32), RecordId>,
    chains_by_key: HashMap<Vec<RecordId>, RecordId>,
    well_known_by_key: HashMap<(u32, Vec<RecordId>), RecordId>,
    headers_by_key: HashMap<Vec<u8>, RecordId>,
    methods: HashMap<MethodKey, Arc<CachedAotMethod>>,
}

/// One named AOT cache: interned records plus compiled methods, all
/// de-duplicated by identity. Its monitor is never held across
/// stream I/O.
pub struct AotCache {
    name: String,
    state: Mutex<CacheState>,
    /// Shared across the whole map so the size budget is global.
    total_bytes: Arc<AtomicU64>,
    max_bytes: u64,
    dirty: AtomicBool,
    num_hits: AtomicU64,
    num_misses: AtomicU64,
    num_bypasses: AtomicU64,
    num_stores: AtomicU64,
}

impl AotCache {
    fn new(name: String, total_bytes: Arc<AtomicU64>, max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(CacheState::default()),
            total_bytes,
            max_bytes,
            dirty: AtomicBool::new(false),
            num_hits: AtomicU64::new(0),
            num_misses: AtomicU64::new(0),
            num_bypasses: AtomicU64::new(0),
            num_stores: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reserve(&self, bytes: u64) -> bool {
        let mut current = self.total_bytes.load(Ordering::Acquire);
        loop {
            if current + bytes > self.max_bytes {
                return false;
            }
            match self.total_bytes.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn intern(
        &self,
        state: &mut CacheState,
        payload: RecordPayload,
    ) -> Option<RecordId> {
        if !self.reserve(payload.approximate_size()) {
            return None;
        }
        let kind = payload.kind();
        let next = state.next_ids.entry(kind).or_insert(0);
        let id = RecordId::new(kind, *next);
        *next += 1;
        state.records.insert(id, Arc::new(AotRecord { id, payload }));
        self.dirty.store(true, Ordering::Release);
        Some(id)
    }

    pub fn get_or_create_loader(&self, name: &str) -> Option<RecordId> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.loaders_by_name.get(name) {
            return Some(*id);
        }
        let id = self.intern(&mut state, RecordPayload::ClassLoader { name: name.to_string() })?;
        state.loaders_by_name.insert(name.to_string(), id);
        Some(id)
    }

    pub fn get_or_create_class(
        &self,
        loader: RecordId,
        signature: &str,
        rom_digest: [u8; 32],
    ) -> Option<RecordId> {
        let key = (loader, signature.to_string(), rom_digest);
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.classes_by_key.get(&key) {
            return Some(*id);
        }
        let id = self.intern(
            &mut state,
            RecordPayload::Class { loader, signature: signature.to_string(), rom_digest },
        )?;
        state.classes_by_key.insert(key, id);
        Some(id)
    }

    pub fn get_or_create_method(&self, defining_class: RecordId, index: u32) -> Option<RecordId> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.methods_by_key.get(&(defining_class, index)) {
            return Some(*id);
        }
        let id = self.intern(&mut state, RecordPayload::Method { defining_class, index })?;
        state.methods_by_key.insert((defining_class, index), id);
        Some(id)
    }

    pub fn get_or_create_chain(&self, classes: Vec<RecordId>) -> Option<RecordId> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.chains_by_key.get(&classes) {
            return Some(*id);
        }
        let id = self.intern(&mut state, RecordPayload::ClassChain { classes: classes.clone() })?;
        state.chains_by_key.insert(classes, id);
        Some(id)
    }

    pub fn get_or_create_well_known(
        &self,
        included_classes: u32,
        chains: Vec<RecordId>,
    ) -> Option<RecordId> {
        let key = (included_classes, chains.clone());
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.well_known_by_key.get(&key) {
            return Some(*id);
        }
        let id = self.intern(
            &mut state,
            RecordPayload::WellKnownClasses { included_classes, chains },
        )?;
        state.well_known_by_key.insert(key, id);
        Some(id)
    }

    pub fn get_or_create_header(&self, header: &[u8]) -> Option<RecordId> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.headers_by_key.get(header) {
            return Some(*id);
        }
        let id = self.intern(&mut state, RecordPayload::AotHeader { header: header.to_vec() })?;
        state.headers_by_key.insert(header.to_vec(), id);
        Some(id)
    }

    pub fn record(&self, id: RecordId) -> Option<Arc<AotRecord>> {
        self.state.lock().unwrap().records.get(&id).cloned()
    }

    pub fn record_bypass(&self) {
        self.num_bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.num_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Lookup keyed by the class-chain record.
    pub fn find_method(
        &self,
        defining_chain: RecordId,
        method_index: u32,
        opt_level: OptLevel,
        header: RecordId,
    ) -> Option<Arc<CachedAotMethod>> {
        let key = MethodKey { chain: defining_chain, index: method_index, opt_level, header };
        let found = self.state.lock().unwrap().methods.get(&key).cloned();
        match &found {
            Some(_) => self.num_hits.fetch_add(1, Ordering::Relaxed),
            None => self.num_misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Publishes a freshly compiled method. The first store for a key wins;
    /// concurrent compilations of the same method are benign duplicates.
    pub fn store_method(
        &self,
        defining_chain: RecordId,
        method_index: u32,
        opt_level: OptLevel,
        header: RecordId,
        extra_deps: Vec<RecordId>,
        code: Vec<u8>,
        data: Vec<u8>,
        signature: String,
    ) -> Option<Arc<CachedAotMethod>> {
        let mut deps: Vec<RecordId> = vec![defining_chain, header];
        deps.extend(extra_deps);
        deps.dedup();

        let method = CachedAotMethod {
            defining_chain,
            method_index,
            opt_level,
            header,
            deps,
            code,
            data,
            signature,
        };
        if !self.reserve(method.approximate_size()) {
            return None;
        }

        let key = MethodKey { chain: defining_chain, index: method_index, opt_level, header };
        let mut state = self.state.lock().unwrap();
        let stored = state.methods.entry(key).or_insert_with(|| Arc::new(method)).clone();
        drop(state);

        self.num_stores.fetch_add(1, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
        debug!("[AotCache] {} stored method {}", self.name, stored.signature);
        Some(stored)
    }

    /// The record closure of `method` minus `known_ids`, dependencies first,
    /// so the client can resolve each record as it deserializes.
    pub fn serialization_records(
        &self,
        method: &CachedAotMethod,
        known_ids: &HashSet<RecordId>,
    ) -> Vec<Arc<AotRecord>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut visited = HashSet::new();

        fn visit(
            state: &CacheState,
            id: RecordId,
            known: &HashSet<RecordId>,
            visited: &mut HashSet<RecordId>,
            out: &mut Vec<Arc<AotRecord>>,
        ) {
            if known.contains(&id) || !visited.insert(id) {
                return;
            }
            let Some(record) = state.records.get(&id) else {
                return;
            };
            for dep in record.payload.deps() {
                visit(state, dep, known, visited, out);
            }
            out.push(record.clone());
        }

        for &dep in &method.deps {
            visit(&state, dep, known_ids, &mut visited, &mut out);
        }
        out
    }

    pub fn method_signatures(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .methods
            .values()
            .map(|m| m.signature.clone())
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> AotCacheFile {
        let state = self.state.lock().unwrap();
        AotCacheFile {
            name: self.name.clone(),
            records: state.records.values().map(|r| (**r).clone()).collect(),
            methods: state.methods.values().map(|m| (**m).clone()).collect(),
        }
    }

    fn restore(name: String, file: AotCacheFile, total: Arc<AtomicU64>, max: u64) -> Arc<Self> {
        let cache = AotCache::new(name, total, max);
        {
            let mut state = cache.state.lock().unwrap();
            for record in file.records {
                cache.reserve(record.payload.approximate_size());
                let id = record.id;
                let kind = id.kind;
                let next = state.next_ids.entry(kind).or_insert(0);
                *next = (*next).max(id.id + 1);
                match &record.payload {
                    RecordPayload::ClassLoader { name } => {
                        state.loaders_by_name.insert(name.clone(), id);
                    }
                    RecordPayload::Class { loader, signature, rom_digest } => {
                        state
                            .classes_by_key
                            .insert((*loader, signature.clone(), *rom_digest), id);
                    }
                    RecordPayload::Method { defining_class, index } => {
                        state.methods_by_key.insert((*defining_class, *index), id);
                    }
                    RecordPayload::ClassChain { classes } => {
                        state.chains_by_key.insert(classes.clone(), id);
                    }
                    RecordPayload::WellKnownClasses { included_classes, chains } => {
                        state
                            .well_known_by_key
                            .insert((*included_classes, chains.clone()), id);
                    }
                    RecordPayload::AotHeader { header } => {
                        state.headers_by_key.insert(header.clone(), id);
                    }
                }
                state.records.insert(id, Arc::new(record));
            }
            for method in file.methods {
                cache.reserve(method.approximate_size());
                let key = MethodKey {
                    chain: method.defining_chain,
                    index: method.method_index,
                    opt_level: method.opt_level,
                    header: method.header,
                };
                state.methods.insert(key, Arc::new(method));
            }
        }
        cache
    }
}

/// On-disk image of one cache: the serialized record set. The fixed header
/// (the AOT header record) travels inside `records` like everything else.
#[derive(Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
struct AotCacheFile {
    name: String,
    records: Vec<AotRecord>,
    methods: Vec<CachedAotMethod>,
}

enum Slot {
    Ready(Arc<AotCache>),
    Loading,
}

/// Process-wide `name -> AotCache` map. The first session
/// referencing a name binds to an existing cache or triggers an async
/// load-from-disk / create.
pub struct AotCacheMap {
    config: AotConfig,
    caches: Mutex<HashMap<String, Slot>>,
    total_bytes: Arc<AtomicU64>,
}

impl AotCacheMap {
    pub fn new(config: AotConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            caches: Mutex::new(HashMap::new()),
            total_bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn cache_has_space(&self) -> bool {
        self.total_bytes.load(Ordering::Acquire) < self.config.max_bytes
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.config
            .persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.aotcache", sanitize(name))))
    }

    /// Returns `(cache, loading)`. `(None, true)` means a disk load is in
    /// flight and the caller should retry on a later request; `(None,
    /// false)` means the cache cannot be created (size budget exhausted).
    pub fn get(self: Arc<Self>, name: &str, client: ClientId) -> (Option<Arc<AotCache>>, bool) {
        let mut caches = self.caches.lock().unwrap();
        match caches.get(name) {
            Some(Slot::Ready(cache)) => return (Some(cache.clone()), false),
            Some(Slot::Loading) => return (None, true),
            None => {}
        }

        if let Some(path) = self.file_path(name) {
            if path.exists() {
                info!(
                    "[AotCacheMap] client {} referenced cache '{}', loading from {:?}",
                    client, name, path
                );
                caches.insert(name.to_string(), Slot::Loading);
                let map = self.clone();
                let name = name.to_string();
                tokio::spawn(async move { map.load_from_file(name, path).await });
                return (None, true);
            }
        }

        if !self.cache_has_space() {
            return (None, false);
        }
        let cache = AotCache::new(name.to_string(), self.total_bytes.clone(), self.config.max_bytes);
        info!("[AotCacheMap] client {} created cache '{}'", client, name);
        caches.insert(name.to_string(), Slot::Ready(cache.clone()));
        (Some(cache), false)
    }

    /// Method list for the administrative `AotCacheMapRequest`. `None` when
    /// the cache is absent or still loading.
    pub fn method_signatures(&self, name: &str) -> Option<Vec<String>> {
        let caches = self.caches.lock().unwrap();
        match caches.get(name) {
            Some(Slot::Ready(cache)) => Some(cache.method_signatures()),
            _ => None,
        }
    }

    async fn load_from_file(self: Arc<Self>, name: String, path: PathBuf) {
        let outcome = async {
            let bytes = tokio::fs::read(&path).await?;
            let archived = rkyv::check_archived_root::<AotCacheFile>(&bytes)
                .map_err(|e| anyhow::anyhow!("validating {:?}: {:?}", path, e))?;
            let file: AotCacheFile = RkyvDeserialize::deserialize(
                archived,
                &mut rkyv::de::deserializers::SharedDeserializeMap::new(),
            )
            .map_err(|e| anyhow::anyhow!("decoding {:?}: {:?}", path, e))?;
            Ok::<_, anyhow::Error>(file)
        }
        .await;

        let mut caches = self.caches.lock().unwrap();
        match outcome {
            Ok(file) => {
                let cache = AotCache::restore(
                    name.clone(),
                    file,
                    self.total_bytes.clone(),
                    self.config.max_bytes,
                );
                info!(
                    "[AotCacheMap] cache '{}' loaded from disk ({} methods)",
                    name,
                    cache.state.lock().unwrap().methods.len()
                );
                caches.insert(name, Slot::Ready(cache));
            }
            Err(e) => {
                warn!("[AotCacheMap] failed to load cache '{}': {}", name, e);
                // Fall back to an empty cache rather than wedging on Loading.
                let cache = AotCache::new(name.clone(), self.total_bytes.clone(), self.config.max_bytes);
                caches.insert(name, Slot::Ready(cache));
            }
        }
    }

    /// Saves a dirty cache to its file. Called opportunistically after
    /// successful stores; failures are logged and retried next time.
    pub async fn persist(&self, cache: &Arc<AotCache>) {
        let Some(path) = self.file_path(cache.name()) else {
            return;
        };
        if !cache.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        let snapshot = cache.snapshot();
        let bytes = match rkyv::to_bytes::<_, 4096>(&snapshot) {
            Ok(bytes) => bytes.into_vec(),
            Err(e) => {
                warn!("[AotCacheMap] could not serialize cache '{}': {}", cache.name(), e);
                return;
            }
        };

        let tmp = path.with_extension("aotcache.tmp");
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        match result {
            Ok(()) => info!("[AotCacheMap] cache '{}' saved ({} bytes)", cache.name(), bytes.len()),
            Err(e) => {
                cache.dirty.store(true, Ordering::Release);
                warn!("[AotCacheMap] could not save cache '{}': {}", cache.name(), e);
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Arc<AotCache> {
        AotCache::new("test".into(), Arc::new(AtomicU64::new(0)), u64::MAX)
    }

    #[test]
    fn records_are_interned_by_identity() {
        let cache = cache();
        let loader_a = cache.get_or_create_loader("app").unwrap();
        let loader_b = cache.get_or_create_loader("app").unwrap();
        assert_eq!(loader_a, loader_b);

        let class_a = cache.get_or_create_class(loader_a, "Lfoo/Bar;", [1; 32]).unwrap();
        let class_b = cache.get_or_create_class(loader_a, "Lfoo/Bar;", [1; 32]).unwrap();
        let class_c = cache.get_or_create_class(loader_a, "Lfoo/Bar;", [2; 32]).unwrap();
        assert_eq!(class_a, class_b);
        assert_ne!(class_a, class_c);
        assert_eq!(class_a.kind, RecordKind::Class);
    }

    #[test]
    fn find_method_is_keyed_on_all_four_components() {
        let cache = cache();
        let loader = cache.get_or_create_loader("app").unwrap();
        let class = cache.get_or_create_class(loader, "LA;", [0; 32]).unwrap();
        let chain = cache.get_or_create_chain(vec![class]).unwrap();
        let header = cache.get_or_create_header(b"hdr").unwrap();

        cache
            .store_method(chain, 7, OptLevel::Warm, header, vec![], vec![1], vec![2], "A.m()V".into())
            .unwrap();

        assert!(cache.find_method(chain, 7, OptLevel::Warm, header).is_some());
        assert!(cache.find_method(chain, 7, OptLevel::Hot, header).is_none());
        assert!(cache.find_method(chain, 8, OptLevel::Warm, header).is_none());
    }

    #[test]
    fn serialization_records_are_dependency_ordered_and_subtract_known() {
        let cache = cache();
        let loader = cache.get_or_create_loader("app").unwrap();
        let class = cache.get_or_create_class(loader, "LA;", [0; 32]).unwrap();
        let chain = cache.get_or_create_chain(vec![class]).unwrap();
        let header = cache.get_or_create_header(b"hdr").unwrap();
        let method = cache
            .store_method(chain, 0, OptLevel::Cold, header, vec![], vec![], vec![], "A.m()V".into())
            .unwrap();

        let records = cache.serialization_records(&method, &HashSet::new());
        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![loader, class, chain, header]);

        // Once the chain (and transitively its deps) is known, only the
        // header remains.
        let known: HashSet<RecordId> = [loader, class, chain].into_iter().collect();
        let records = cache.serialization_records(&method, &known);
        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![header]);
    }

    #[test]
    fn size_budget_refuses_new_records() {
        let total = Arc::new(AtomicU64::new(0));
        let cache = AotCache::new("tiny".into(), total, 100);
        assert!(cache.get_or_create_loader("a").is_some());
        // The first loader consumed the budget; the next interning fails.
        assert!(cache.get_or_create_header(&[0u8; 400]).is_none());
    }
}
