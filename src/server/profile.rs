//! Per-plugin profiling table.
//!
//! Every plugin invocation is timed and recorded under the key
//! `layer::file::plugin::zN`. Recording is lock-free reads/writes on a
//! concurrent map and never affects the control flow or error semantics of
//! the stage being profiled. Profiling can be disabled wholesale through
//! [`crate::server::ServerOptions`].

use crate::address::TileAddress;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Accumulated statistics for one (layer, file, plugin, zoom) slot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginProfile {
    /// Failed invocations
    pub errors: u64,
    /// Total invocations
    pub samples: u64,
    /// Shortest invocation (microseconds)
    pub dur_min_us: u64,
    /// Longest invocation (microseconds)
    pub dur_max_us: u64,
    /// Sum of invocation durations (microseconds)
    pub dur_total_us: u64,
    /// Cache hits (caches only)
    pub hits: u64,
    /// Cache misses (caches only)
    pub misses: u64,
    /// Invocations that reported a payload size
    pub size_samples: u64,
    /// Smallest reported payload
    pub size_min: u64,
    /// Largest reported payload
    pub size_max: u64,
    /// Sum of reported payload sizes
    pub size_total: u64,
}

impl PluginProfile {
    /// Mean invocation duration in microseconds.
    pub fn dur_avg_us(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.dur_total_us / self.samples
        }
    }

    /// Mean reported payload size in bytes.
    pub fn size_avg(&self) -> u64 {
        if self.size_samples == 0 {
            0
        } else {
            self.size_total / self.size_samples
        }
    }

    fn record(&mut self, duration_us: u64, err: bool, hit: Option<bool>, size: Option<usize>) {
        if err {
            self.errors += 1;
        }
        if self.samples == 0 {
            self.dur_min_us = duration_us;
            self.dur_max_us = duration_us;
        } else {
            self.dur_min_us = self.dur_min_us.min(duration_us);
            self.dur_max_us = self.dur_max_us.max(duration_us);
        }
        self.samples += 1;
        self.dur_total_us += duration_us;

        match hit {
            Some(true) => self.hits += 1,
            Some(false) => self.misses += 1,
            None => {}
        }

        if let Some(size) = size {
            let size = size as u64;
            if self.size_samples == 0 {
                self.size_min = size;
                self.size_max = size;
            } else {
                self.size_min = self.size_min.min(size);
                self.size_max = self.size_max.max(size);
            }
            self.size_samples += 1;
            self.size_total += size;
        }
    }
}

/// Concurrent table of plugin profiles, keyed `layer::file::plugin::zN`.
#[derive(Debug)]
pub(crate) struct ProfileTable {
    enabled: bool,
    entries: DashMap<String, PluginProfile>,
}

impl ProfileTable {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: DashMap::new(),
        }
    }

    /// Starts a timer for one plugin invocation. When profiling is disabled
    /// the returned timer is a no-op.
    pub(crate) fn timer(
        self: &Arc<Self>,
        plugin_id: &str,
        address: &TileAddress,
    ) -> ProfileTimer {
        let key = self.enabled.then(|| {
            format!(
                "{}::{}::{}::z{}",
                address.layer, address.filename, plugin_id, address.z
            )
        });
        ProfileTimer {
            table: Arc::clone(self),
            key,
            start: Instant::now(),
        }
    }

    /// Snapshot of all recorded profiles.
    pub(crate) fn snapshot(&self) -> std::collections::HashMap<String, PluginProfile> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Drops all recorded samples.
    pub(crate) fn reset(&self) {
        self.entries.clear();
    }
}

/// Running timer for one plugin invocation.
///
/// Consumed by [`ProfileTimer::record`]; dropping it without recording
/// simply discards the sample.
pub(crate) struct ProfileTimer {
    table: Arc<ProfileTable>,
    key: Option<String>,
    start: Instant,
}

impl ProfileTimer {
    /// Records the sample. `hit` is meaningful for cache lookups; `size`
    /// for stages that produced or stored a payload.
    pub(crate) fn record(self, err: bool, hit: Option<bool>, size: Option<usize>) {
        let Some(key) = self.key else {
            return;
        };
        let duration_us = self.start.elapsed().as_micros() as u64;
        self.table
            .entries
            .entry(key)
            .or_default()
            .record(duration_us, err, hit, size);
    }
}
