// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use forge_transport::InterruptProbe;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Per-session reader/writer gate separating compilation readers from
/// cache-clearing writers.
///
/// `unload_attempted` is raised before a writer starts waiting and lowered
/// when it releases; readers about to send a non-terminal message check it
/// through the stream's interrupt probe so no new blocking I/O starts on a
/// session about to be reset.
pub struct ClassUnloadGate {
    lock: RwLock<()>,
    unload_attempted: AtomicBool,
}

impl ClassUnloadGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: RwLock::new(()),
            unload_attempted: AtomicBool::new(false),
        })
    }

    /// Reader side, held across the body of a compilation.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Writer side, taken only to clear caches. Raises the intent flag
    /// before waiting so in-flight readers stop issuing new fetches.
    pub async fn write(&self) -> UnloadWriteGuard<'_> {
        self.unload_attempted.store(true, Ordering::Release);
        let guard = self.lock.write().await;
        UnloadWriteGuard { _guard: guard, flag: &self.unload_attempted }
    }

    pub fn unload_attempted(&self) -> bool {
        self.unload_attempted.load(Ordering::Acquire)
    }

    /// Lowered explicitly when a full cache clear completes outside a
    /// writer guard (session teardown path).
    pub fn reset_unload_attempted(&self) {
        self.unload_attempted.store(false, Ordering::Release);
    }
}

pub struct UnloadWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    flag: &'a AtomicBool,
}

impl Drop for UnloadWriteGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Adapter installed on a stream while a compilation is bound to a session.
pub struct GateProbe(pub Arc<ClassUnloadGate>);

impl InterruptProbe for GateProbe {
    fn unload_pending(&self) -> bool {
        self.0.unload_attempted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_raises_and_lowers_intent_flag() {
        let gate = ClassUnloadGate::new();
        assert!(!gate.unload_attempted());
        {
            let _w = gate.write().await;
            assert!(gate.unload_attempted());
        }
        assert!(!gate.unload_attempted());
    }

    #[tokio::test]
    async fn readers_see_writer_intent_while_holding_read() {
        let gate = ClassUnloadGate::new();
        let read = gate.read().await;

        let gate2 = gate.clone();
        let writer = tokio::spawn(async move {
            let _w = gate2.write().await;
        });

        // Give the writer a chance to start waiting behind the read guard.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(gate.unload_attempted());

        drop(read);
        writer.await.unwrap();
        assert!(!gate.unload_attempted());
    }
}
