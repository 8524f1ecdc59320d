// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::info;

/// One interned ROM class body. Sessions hold `Arc`s; identical bodies from
/// different clients share one allocation.
pub struct SharedRomClass {
    digest: [u8; 32],
    body: Vec<u8>,
}

impl SharedRomClass {
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Process-wide ROM class interning cache. Initialized by the registry when
/// the first session is created and shut down when the last one departs;
/// between those points `intern` deduplicates by content digest.
pub struct SharedRomClassCache {
    inner: Mutex<Option<HashMap<[u8; 32], Weak<SharedRomClass>>>>,
}

impl SharedRomClassCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(None) })
    }

    pub fn initialize(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_none() {
            *inner = Some(HashMap::new());
            info!("[RomCache] initialized");
        }
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.take().is_some() {
            info!("[RomCache] shut down");
        }
    }

    pub fn intern(&self, body: Vec<u8>) -> Arc<SharedRomClass> {
        let digest = *blake3::hash(&body).as_bytes();
        let mut inner = self.inner.lock().unwrap();
        let Some(map) = inner.as_mut() else {
            // Not initialized (single-session teardown race): hand out an
            // unshared body rather than fail the compilation.
            return Arc::new(SharedRomClass { digest, body });
        };

        if let Some(existing) = map.get(&digest).and_then(Weak::upgrade) {
            return existing;
        }

        map.retain(|_, weak| weak.strong_count() > 0);
        let fresh = Arc::new(SharedRomClass { digest, body });
        map.insert(digest, Arc::downgrade(&fresh));
        fresh
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bodies_share_one_allocation() {
        let cache = SharedRomClassCache::new();
        cache.initialize();

        let a = cache.intern(vec![1, 2, 3]);
        let b = cache.intern(vec![1, 2, 3]);
        let c = cache.intern(vec![4, 5, 6]);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn dead_entries_are_pruned() {
        let cache = SharedRomClassCache::new();
        cache.initialize();

        let a = cache.intern(vec![9; 16]);
        drop(a);
        let _b = cache.intern(vec![7; 16]);
        assert_eq!(cache.len(), 1);
    }
}
