// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, info, warn};

use crate::session::ClientSession;

/// How long a parked request waits for its critical predecessor before
/// considering cache-clear recovery.
pub const PARK_TIMEOUT: Duration = Duration::from_secs(1);

/// One request waiting in the sequencer's ordered park list.
pub struct ParkedEntry {
    pub seq_no: u32,
    pub critical_seq_no: u32,
    notify: Notify,
    /// The "defer to neighbour" flag: set by a recovering head on the new
    /// head so a cohort of timed-out siblings does not all clear caches.
    wait_to_be_notified: AtomicBool,
}

impl ParkedEntry {
    pub fn new(seq_no: u32, critical_seq_no: u32) -> Arc<Self> {
        Arc::new(Self {
            seq_no,
            critical_seq_no,
            notify: Notify::new(),
            wait_to_be_notified: AtomicBool::new(false),
        })
    }
}

/// Per-session sequencing state, guarded by the session's sequencing lock.
/// `num_active_threads` lives here because the original protects it with the
/// same monitor: it must be read consistently with the park list during
/// timeout recovery.
pub struct SequencerState {
    pub max_received_seq_no: u32,
    pub last_processed_critical_seq_no: u32,
    pub num_active_threads: i32,
    park_list: Vec<Arc<ParkedEntry>>,
}

impl SequencerState {
    pub fn new(initial_seq_no: u32) -> Self {
        Self {
            max_received_seq_no: initial_seq_no,
            last_processed_critical_seq_no: initial_seq_no,
            num_active_threads: 0,
            park_list: Vec::new(),
        }
    }

    pub fn update_max_received(&mut self, seq_no: u32) {
        if seq_no > self.max_received_seq_no {
            self.max_received_seq_no = seq_no;
        }
    }

    fn insert_parked(&mut self, entry: Arc<ParkedEntry>) {
        let pos = self.park_list.partition_point(|e| e.seq_no < entry.seq_no);
        self.park_list.insert(pos, entry);
    }

    fn remove_parked(&mut self, entry: &Arc<ParkedEntry>) {
        self.park_list.retain(|e| !Arc::ptr_eq(e, entry));
    }

    fn head_is(&self, entry: &Arc<ParkedEntry>) -> bool {
        self.park_list.first().map(|e| Arc::ptr_eq(e, entry)).unwrap_or(false)
    }

    pub fn parked_len(&self) -> usize {
        self.park_list.len()
    }

    /// Wakes parked requests whose critical predecessor has now been
    /// processed, head first, stopping at the first still-blocked entry.
    pub fn notify_eligible(&mut self) {
        while let Some(head) = self.park_list.first() {
            if head.critical_seq_no <= self.last_processed_critical_seq_no {
                let head = self.park_list.remove(0);
                head.notify.notify_one();
            } else {
                break;
            }
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// The request may reconcile caches and compile.
    Proceed,
    /// Stale critical request: the session was reset past it. The client
    /// must retry with fresh dependencies.
    StaleCritical,
}

/// Runs the ordering protocol for one request. Called with no locks held; returns with
/// no locks held. On `Proceed` the caller owns one increment of
/// `num_active_threads`.
pub async fn admit(
    session: &Arc<ClientSession>,
    seq_no: u32,
    critical_seq_no: u32,
    is_critical: bool,
) -> Admission {
    let mut state = session.sequencing.lock().await;
    state.update_max_received(seq_no);

    if critical_seq_no > state.last_processed_critical_seq_no {
        debug!(
            "[Sequencer] client={} seqNo={} parked waiting for criticalSeqNo={} (last={})",
            session.client_id(),
            seq_no,
            critical_seq_no,
            state.last_processed_critical_seq_no
        );
        let entry = ParkedEntry::new(seq_no, critical_seq_no);
        state.insert_parked(entry.clone());
        state = wait_for_turn(session, state, &entry).await;
    }

    debug_assert!(
        critical_seq_no <= state.last_processed_critical_seq_no,
        "critical requests must be admitted in order"
    );

    if critical_seq_no < state.last_processed_critical_seq_no && is_critical {
        // The missing predecessor was declared lost and the session reset;
        // this late critical request must not be applied out of order.
        warn!(
            "[Sequencer] client={} discarding stale critical seqNo={} (criticalSeqNo={} < last={})",
            session.client_id(),
            seq_no,
            critical_seq_no,
            state.last_processed_critical_seq_no
        );
        return Admission::StaleCritical;
    }

    state.num_active_threads += 1;
    Admission::Proceed
}

/// The park/timeout loop. Enters with the sequencing lock held and the entry
/// already in the park list; returns with the lock re-held and the entry
/// detached.
async fn wait_for_turn<'a>(
    session: &'a Arc<ClientSession>,
    mut state: MutexGuard<'a, SequencerState>,
    entry: &Arc<ParkedEntry>,
) -> MutexGuard<'a, SequencerState> {
    loop {
        // Reset before every wait: if no notification arrives this request
        // times out and may clear the caches itself.
        entry.wait_to_be_notified.store(false, Ordering::Release);

        drop(state);
        let notified =
            tokio::time::timeout(PARK_TIMEOUT, entry.notify.notified()).await.is_ok();
        state = session.sequencing.lock().await;

        if entry.critical_seq_no <= state.last_processed_critical_seq_no {
            // Either we were notified or the condition became true while we
            // were reacquiring the lock. `notify_eligible` already detached
            // notified entries; a timed-out winner detaches itself here.
            state.remove_parked(entry);
            return state;
        }

        if notified {
            // Spurious wake relative to our condition: park again.
            continue;
        }

        debug!(
            "[Sequencer] client={} seqNo={} timed out waiting for criticalSeqNo={}",
            session.client_id(),
            entry.seq_no,
            entry.critical_seq_no
        );

        let can_recover = state.num_active_threads <= 0
            && state.head_is(entry)
            && !entry.wait_to_be_notified.load(Ordering::Acquire);
        if !can_recover {
            // Either active threads must drain first, or the head (not us)
            // is responsible for recovery, or the previous recoverer told
            // us to sleep again and wait for its notification.
            continue;
        }

        // Cache-clear recovery: the missing critical request is presumed
        // lost. Clear every per-session cache under the writer gate and
        // pretend the dependency was trivially satisfied.
        info!(
            "[Sequencer] client={} seqNo={} clearing session caches, presumed-lost criticalSeqNo={}",
            session.client_id(),
            entry.seq_no,
            entry.critical_seq_no
        );
        {
            let _write = session.gate().write().await;
            session.clear_caches();
        }
        state.last_processed_critical_seq_no = entry.critical_seq_no;
        state.remove_parked(entry);
        state.notify_eligible();
        // The new head must not start a second recovery while our wake-ups
        // propagate; it parks again until notified.
        if let Some(next_head) = state.park_list.first() {
            next_head.wait_to_be_notified.store(true, Ordering::Release);
        }
        return state;
    }
}

/// Marks a critical request's cache effects as applied and releases any
/// dependents.
pub async fn complete_critical(session: &Arc<ClientSession>, seq_no: u32) {
    let mut state = session.sequencing.lock().await;
    debug_assert!(seq_no >= state.last_processed_critical_seq_no);
    if seq_no > state.last_processed_critical_seq_no {
        state.last_processed_critical_seq_no = seq_no;
    }
    state.notify_eligible();
}

/// Abort path for a critical request that died before completing: its
/// dependents would otherwise park forever, so the sequence number still
/// advances.
pub async fn advance_on_abort(session: &Arc<ClientSession>, seq_no: u32) {
    let mut state = session.sequencing.lock().await;
    if seq_no > state.last_processed_critical_seq_no {
        state.last_processed_critical_seq_no = seq_no;
        state.notify_eligible();
    }
}
