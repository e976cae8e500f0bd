//! Request coalescing for the tile fetch pipeline.
//!
//! When several requests for the same tile arrive while a fetch is already
//! in flight, only one render runs; every caller receives the same result.
//!
//! # Implementation
//!
//! An in-flight map from [`FetchKey`] to a broadcast sender. The first
//! arrival for a key becomes the *lead* and is expected to run the fetch
//! and call [`FetchCoalescer::complete`]; later arrivals subscribe to the
//! broadcast channel and wait. Completion removes the key, so at most one
//! underlying fetch per key exists at any time.
//!
//! The key includes the raw skip-cache header value: a request that bypasses
//! caches must not be satisfied by a fetch that consulted them, and vice
//! versa.

use crate::address::TileAddress;
use crate::pipeline::SKIP_CACHE_HEADER;
use crate::plugin::TileResponse;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Identity of one coalescable fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchKey {
    layer: String,
    z: u8,
    x: u32,
    y: u32,
    filename: String,
    /// Raw skip-cache header value, if present
    skip_cache: Option<String>,
}

impl FetchKey {
    /// Builds the coalescing key for an address.
    pub(crate) fn from_address(address: &TileAddress) -> Self {
        Self {
            layer: address.layer.clone(),
            z: address.z,
            x: address.x,
            y: address.y,
            filename: address.filename.clone(),
            skip_cache: address.headers.get(SKIP_CACHE_HEADER).map(str::to_string),
        }
    }
}

/// Counters for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone)]
pub struct CoalescerStats {
    /// Total fetches requested
    pub total_requests: u64,
    /// Requests that joined an in-flight fetch
    pub coalesced_requests: u64,
    /// Requests that started a new fetch
    pub new_requests: u64,
}

/// Result of registering a fetch with the coalescer.
pub(crate) enum FetchTicket {
    /// First arrival: run the fetch, then call `complete`. The receiver
    /// yields the lead's own copy of the outcome.
    Lead(broadcast::Receiver<TileResponse>),
    /// A fetch is already in flight: wait on the receiver.
    Waiter(broadcast::Receiver<TileResponse>),
}

/// Tracks in-flight fetches so duplicate requests share one render.
pub(crate) struct FetchCoalescer {
    in_flight: Mutex<HashMap<FetchKey, broadcast::Sender<TileResponse>>>,
    stats: Mutex<CoalescerStats>,
}

impl FetchCoalescer {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CoalescerStats::default()),
        }
    }

    /// Registers a request for `key`.
    ///
    /// Exactly one concurrent caller per key receives `Lead`; everyone else
    /// gets a `Waiter` subscribed to the same channel.
    pub(crate) async fn register(&self, key: FetchKey) -> FetchTicket {
        let mut in_flight = self.in_flight.lock().await;
        let mut stats = self.stats.lock().await;
        stats.total_requests += 1;

        if let Some(tx) = in_flight.get(&key) {
            stats.coalesced_requests += 1;
            debug!(key = ?key, "coalescing request into in-flight fetch");
            FetchTicket::Waiter(tx.subscribe())
        } else {
            // Capacity 1 suffices: each channel carries a single outcome.
            let (tx, rx) = broadcast::channel(1);
            in_flight.insert(key, tx);
            stats.new_requests += 1;
            FetchTicket::Lead(rx)
        }
    }

    /// Completes the fetch for `key`, delivering `outcome` to the lead and
    /// every coalesced waiter, and clears the in-flight entry.
    pub(crate) async fn complete(&self, key: &FetchKey, outcome: TileResponse) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(tx) = in_flight.remove(key) {
            let waiters = tx.receiver_count();
            // Receivers may have been dropped; that's fine.
            let _ = tx.send(outcome);
            if waiters > 1 {
                debug!(key = ?key, waiters, "broadcast fetch outcome to coalesced waiters");
            }
        }
    }

    /// Snapshot of the coalescing counters.
    pub(crate) async fn stats(&self) -> CoalescerStats {
        self.stats.lock().await.clone()
    }

    /// Number of fetches currently in flight.
    pub(crate) async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
