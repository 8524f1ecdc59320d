// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use forge_model::{MemoryState, ThreadState};
use sysinfo::System;

/// Thresholds for the health tags attached to every reply.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub safe_reserve_bytes: u64,
    pub scratch_lower_bound_bytes: u64,
    pub high_thread_threshold: usize,
    pub very_high_thread_threshold: usize,
    /// Sample period while memory is comfortable. Tightens to 250 ms under
    /// LOW and 50 ms under VERY_LOW so pressure is noticed quickly.
    pub normal_sample_period: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            safe_reserve_bytes: 64 * 1024 * 1024,
            scratch_lower_bound_bytes: 32 * 1024 * 1024,
            high_thread_threshold: 12,
            very_high_thread_threshold: 16,
            normal_sample_period: Duration::from_millis(1000),
        }
    }
}

const LOW_SAMPLE_PERIOD: Duration = Duration::from_millis(250);
const VERY_LOW_SAMPLE_PERIOD: Duration = Duration::from_millis(50);

/// Source of the free-physical-memory reading, a seam so tests can dial in
/// pressure without touching the host.
pub trait MemoryProbe: Send {
    fn free_physical_memory(&mut self) -> Option<u64>;
}

struct SysinfoProbe {
    system: System,
}

impl MemoryProbe for SysinfoProbe {
    fn free_physical_memory(&mut self) -> Option<u64> {
        self.system.refresh_memory();
        Some(self.system.available_memory())
    }
}

struct MemorySample {
    free_bytes: Option<u64>,
    taken_at: Instant,
    period: Duration,
}

/// Computes the memory / active-thread pressure tags included in every
/// reply, with a short refresh window on the memory sample.
pub struct HealthSampler {
    config: HealthConfig,
    probe: Mutex<Box<dyn MemoryProbe>>,
    sample: Mutex<MemorySample>,
    active_workers: AtomicUsize,
}

impl HealthSampler {
    pub fn new(config: HealthConfig) -> Arc<Self> {
        Self::with_probe(config, Box::new(SysinfoProbe { system: System::new() }))
    }

    pub fn with_probe(config: HealthConfig, probe: Box<dyn MemoryProbe>) -> Arc<Self> {
        let normal = config.normal_sample_period;
        Arc::new(Self {
            config,
            probe: Mutex::new(probe),
            sample: Mutex::new(MemorySample {
                free_bytes: None,
                // Force the first query to actually sample.
                taken_at: Instant::now().checked_sub(normal).unwrap_or_else(Instant::now),
                period: normal,
            }),
            active_workers: AtomicUsize::new(0),
        })
    }

    #[cfg(test)]
    pub fn for_tests(config: HealthConfig) -> Arc<Self> {
        struct Plenty;
        impl MemoryProbe for Plenty {
            fn free_physical_memory(&mut self) -> Option<u64> {
                Some(u64::MAX)
            }
        }
        Self::with_probe(config, Box::new(Plenty))
    }

    pub fn inc_active_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_active_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    fn thresholds(&self, num_clients: usize) -> (u64, u64) {
        // The LOW threshold scales with the client count but caps at 16 so
        // clients that vanished without notice do not inflate the reserve.
        let clients = num_clients.min(16) as u64;
        let low = self.config.safe_reserve_bytes
            + (clients + 4) * self.config.scratch_lower_bound_bytes;
        let very_low =
            self.config.safe_reserve_bytes + 4 * self.config.scratch_lower_bound_bytes;
        (low, very_low)
    }

    /// Current memory bucket, refreshing the cached sample when it is older
    /// than the current period. A pressured reading tightens the period for
    /// the next sample.
    pub fn memory_state(&self, num_clients: usize) -> MemoryState {
        let (low, very_low) = self.thresholds(num_clients);
        let mut sample = self.sample.lock().unwrap();

        if sample.free_bytes.is_none() || sample.taken_at.elapsed() >= sample.period {
            sample.free_bytes = self.probe.lock().unwrap().free_physical_memory();
            sample.taken_at = Instant::now();
        }

        let state = match sample.free_bytes {
            // No reading available: report the default state.
            None => MemoryState::Normal,
            Some(free) if free <= very_low => MemoryState::VeryLow,
            Some(free) if free <= low => MemoryState::Low,
            Some(_) => MemoryState::Normal,
        };

        sample.period = match state {
            MemoryState::VeryLow => VERY_LOW_SAMPLE_PERIOD,
            MemoryState::Low => LOW_SAMPLE_PERIOD,
            MemoryState::Normal => self.config.normal_sample_period,
        };
        state
    }

    /// Cheap check for the registry's eviction policy.
    pub fn memory_is_low(&self) -> bool {
        self.memory_state(0) != MemoryState::Normal
    }

    pub fn thread_state(&self) -> ThreadState {
        let active = self.active_workers();
        if active > self.config.very_high_thread_threshold {
            ThreadState::VeryHigh
        } else if active > self.config.high_thread_threshold {
            ThreadState::High
        } else {
            ThreadState::Normal
        }
    }

    /// Exposed so tests can assert the refresh window tightened.
    pub fn current_sample_period(&self) -> Duration {
        self.sample.lock().unwrap().period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(u64);
    impl MemoryProbe for FixedProbe {
        fn free_physical_memory(&mut self) -> Option<u64> {
            Some(self.0)
        }
    }

    fn config() -> HealthConfig {
        HealthConfig {
            safe_reserve_bytes: 100,
            scratch_lower_bound_bytes: 10,
            high_thread_threshold: 2,
            very_high_thread_threshold: 4,
            normal_sample_period: Duration::from_millis(0),
        }
    }

    #[test]
    fn memory_buckets_follow_the_thresholds() {
        // very_low = 100 + 4*10 = 140; low(1 client) = 100 + 5*10 = 150
        let sampler = HealthSampler::with_probe(config(), Box::new(FixedProbe(139)));
        assert_eq!(sampler.memory_state(1), MemoryState::VeryLow);

        let sampler = HealthSampler::with_probe(config(), Box::new(FixedProbe(145)));
        assert_eq!(sampler.memory_state(1), MemoryState::Low);

        let sampler = HealthSampler::with_probe(config(), Box::new(FixedProbe(10_000)));
        assert_eq!(sampler.memory_state(1), MemoryState::Normal);
    }

    #[test]
    fn low_reading_tightens_the_sample_period() {
        let sampler = HealthSampler::with_probe(config(), Box::new(FixedProbe(139)));
        assert_eq!(sampler.memory_state(1), MemoryState::VeryLow);
        assert_eq!(sampler.current_sample_period(), VERY_LOW_SAMPLE_PERIOD);

        let sampler = HealthSampler::with_probe(config(), Box::new(FixedProbe(145)));
        assert_eq!(sampler.memory_state(1), MemoryState::Low);
        assert_eq!(sampler.current_sample_period(), LOW_SAMPLE_PERIOD);
    }

    #[test]
    fn low_threshold_caps_client_count_at_sixteen() {
        let sampler = HealthSampler::with_probe(config(), Box::new(FixedProbe(295)));
        // low(1000 clients) caps at 100 + 20*10 = 300.
        assert_eq!(sampler.memory_state(1000), MemoryState::Low);
    }

    #[test]
    fn thread_state_buckets() {
        let sampler = HealthSampler::for_tests(config());
        assert_eq!(sampler.thread_state(), ThreadState::Normal);
        for _ in 0..3 {
            sampler.inc_active_workers();
        }
        assert_eq!(sampler.thread_state(), ThreadState::High);
        for _ in 0..2 {
            sampler.inc_active_workers();
        }
        assert_eq!(sampler.thread_state(), ThreadState::VeryHigh);
    }
}
