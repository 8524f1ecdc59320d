// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_model::ClientId;
use tracing::{debug, info};

use crate::health::HealthSampler;
use crate::session::ClientSession;
use crate::shared_rom::SharedRomClassCache;

/// Eviction tuning. The normal age must exceed the expected
/// client lifetime; the low-memory age reclaims idle sessions aggressively.
#[derive(Debug, Clone)]
pub struct PurgePolicy {
    pub time_between_purges: Duration,
    pub old_age: Duration,
    pub old_age_under_low_memory: Duration,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            time_between_purges: Duration::from_secs(60),
            old_age: Duration::from_secs(90 * 60),
            old_age_under_low_memory: Duration::from_secs(5 * 60),
        }
    }
}

struct RegistryInner {
    sessions: HashMap<ClientId, Arc<ClientSession>>,
    time_of_last_purge: Instant,
}

/// Process-wide map `ClientId -> ClientSession`. The lock here
/// is the "compilation monitor" of the lock hierarchy: always the outermost,
/// never held across await points.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    policy: PurgePolicy,
    shared_rom: Arc<SharedRomClassCache>,
    health: Arc<HealthSampler>,
}

impl SessionRegistry {
    pub fn new(
        policy: PurgePolicy,
        shared_rom: Arc<SharedRomClassCache>,
        health: Arc<HealthSampler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                time_of_last_purge: Instant::now(),
            }),
            policy,
            shared_rom,
            health,
        })
    }

    pub fn shared_rom(&self) -> &Arc<SharedRomClassCache> {
        &self.shared_rom
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Finds the session for `client_id` or creates one seeded with the
    /// request's critical sequence number. Increments `in_use` and refreshes
    /// the access time either way.
    pub fn find_or_create(
        &self,
        client_id: ClientId,
        initial_seq_no: u32,
    ) -> (Arc<ClientSession>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get(&client_id) {
            session.inc_in_use();
            session.update_last_access();
            return (session.clone(), false);
        }

        if inner.sessions.is_empty() {
            self.shared_rom.initialize();
        }
        let session = ClientSession::new(client_id, initial_seq_no, self.shared_rom.clone());
        session.inc_in_use();
        inner.sessions.insert(client_id, session.clone());
        info!("[Registry] new client {} connected, session created", client_id);
        (session, true)
    }

    pub fn find(&self, client_id: ClientId) -> Option<Arc<ClientSession>> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(&client_id).map(|session| {
            session.inc_in_use();
            session.update_last_access();
            session.clone()
        })
    }

    /// Marks and/or destroys the session. Destruction happens only once no
    /// worker holds it (`in_use == 0`); otherwise it is deferred to the last
    /// `release`.
    pub fn delete(&self, client_id: ClientId, for_deletion: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get(&client_id) else {
            return false;
        };
        if for_deletion {
            session.mark_for_deletion();
        }
        if session.in_use() == 0 && session.is_marked_for_deletion() {
            inner.sessions.remove(&client_id);
            self.shutdown_rom_cache_if_empty(&inner);
            info!("[Registry] client {} session deleted", client_id);
            return true;
        }
        false
    }

    /// Worker hand-back at the end of a request: drops the `in_use` hold and
    /// completes a deferred deletion if this was the last holder.
    pub fn release(&self, session: &Arc<ClientSession>) {
        let mut inner = self.inner.lock().unwrap();
        let left = session.dec_in_use();
        if left == 0 && session.is_marked_for_deletion() {
            let client_id = session.client_id();
            if inner.sessions.remove(&client_id).is_some() {
                self.shutdown_rom_cache_if_empty(&inner);
                info!("[Registry] client {} session deleted", client_id);
            }
        }
    }

    /// Opportunistic eviction of idle sessions. Uses the short
    /// age bound when free physical memory is low. Never touches an in-use
    /// session regardless of age.
    pub fn purge_old(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.time_of_last_purge.elapsed() < self.policy.time_between_purges {
            return;
        }
        inner.time_of_last_purge = Instant::now();

        let old_age = if self.health.memory_is_low() {
            self.policy.old_age_under_low_memory
        } else {
            self.policy.old_age
        };
        let old_age_ms = old_age.as_millis() as i64;

        let before = inner.sessions.len();
        inner.sessions.retain(|client_id, session| {
            let keep = session.in_use() > 0 || session.millis_since_last_access() <= old_age_ms;
            if !keep {
                debug!("[Registry] purging idle session for client {}", client_id);
            }
            keep
        });
        let purged = before - inner.sessions.len();
        if purged > 0 {
            info!("[Registry] purged {} idle sessions, {} remain", purged, inner.sessions.len());
            self.shutdown_rom_cache_if_empty(&inner);
        }
    }

    fn shutdown_rom_cache_if_empty(&self, inner: &RegistryInner) {
        if inner.sessions.is_empty() {
            self.shared_rom.shutdown();
        }
    }
}
