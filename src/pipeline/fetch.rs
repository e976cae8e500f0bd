//! The cache/provider/transform fetch protocol.
//!
//! One protocol run serves every caller coalesced onto the same tile:
//!
//! 1. Cache lookup (unless skipped) — sequential or racing, first hit wins;
//!    lookup errors demote to a miss for that cache only.
//! 2. Provider render — absent provider is a fixed 404, a provider error
//!    ends the protocol with its declared status (default 500).
//! 3. Transforms in registration order — any failure aborts with a 500 and
//!    skips cache population.
//! 4. Delivery — immediate by default; deferred behind cache population
//!    when the request carries the cache-wait directive.
//! 5. Cache population — all caches stored in parallel; store failures are
//!    logged and dropped.
//!
//! A cache hit flagged `refresh` answers callers immediately and re-runs
//! steps 2–5 in the background against a derived address.

use crate::address::{Headers, TileAddress};
use crate::pipeline::{
    skip_cache_requested, FetchKey, FetchTicket, PluginSet, RouteHandler, CACHE_HIT_HEADER,
    CACHE_WAIT_HEADER, FetchMode,
};
use crate::plugin::{CacheFetch, TileData, TileResponse};
use crate::server::TileServer;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Body returned when a route has no provider to fall back to.
pub(crate) const NO_PROVIDER_BODY: &str = "No provider configured for layer";

/// Runs a GET through the route's pipeline, deduplicating against other
/// in-flight fetches for the same tile.
///
/// The protocol itself runs on a spawned task owned by the coalescer entry,
/// so an individual caller going away never strands the other waiters.
pub(crate) async fn execute(
    server: &TileServer,
    handler: &Arc<RouteHandler>,
    address: &TileAddress,
) -> TileResponse {
    let key = FetchKey::from_address(address);
    let mut rx = match handler.coalescer.register(key.clone()).await {
        FetchTicket::Waiter(rx) => rx,
        FetchTicket::Lead(rx) => {
            let server = server.clone();
            let handler = Arc::clone(handler);
            let address = address.clone();
            tokio::spawn(async move {
                let plugins = handler.snapshot();
                let outcome = run_protocol(server, plugins, address).await;
                handler.coalescer.complete(&key, outcome).await;
            });
            rx
        }
    };

    match rx.recv().await {
        Ok(outcome) => outcome,
        // The protocol task completes the channel before dropping the
        // sender; hitting this means the runtime is shutting down.
        Err(_) => TileResponse::new(500, "Tile fetch aborted", Headers::new()),
    }
}

/// One full protocol run for a single coalescing key.
async fn run_protocol(
    server: TileServer,
    plugins: PluginSet,
    address: TileAddress,
) -> TileResponse {
    if !plugins.caches.is_empty() && !skip_cache_requested(&address) {
        if let Some(fetch) = lookup_caches(&server, &plugins, &address).await {
            let mut headers = fetch.tile.headers;
            headers.insert(CACHE_HIT_HEADER, "1");

            if fetch.refresh {
                let refresh_address = address.derive_request();
                let server = server.clone();
                let plugins = plugins.clone();
                debug!(address = %refresh_address, "cache hit marked stale; refreshing in background");
                tokio::spawn(async move {
                    if let Ok(tile) = render(&server, &plugins, &refresh_address).await {
                        populate_caches(&server, &plugins, &refresh_address, &tile).await;
                    }
                });
            }

            return TileResponse::new(200, fetch.tile.payload, headers);
        }
    }

    let tile = match render(&server, &plugins, &address).await {
        Ok(tile) => tile,
        Err(response) => return response,
    };

    // The clones handed to delivery and population are independent
    // snapshots: response hooks mutating delivered headers cannot reach
    // what gets cached.
    let response = TileResponse::new(200, tile.payload.clone(), tile.headers.clone());

    if !plugins.caches.is_empty() {
        if address.headers.contains(CACHE_WAIT_HEADER) {
            populate_caches(&server, &plugins, &address, &tile).await;
        } else {
            let address = address.clone();
            tokio::spawn(async move {
                populate_caches(&server, &plugins, &address, &tile).await;
            });
        }
    }

    response
}

/// Consults the route's caches according to the fetch mode.
///
/// Returns the first hit, or `None` when every cache missed or failed.
async fn lookup_caches(
    server: &TileServer,
    plugins: &PluginSet,
    address: &TileAddress,
) -> Option<CacheFetch> {
    match plugins.fetch_mode {
        FetchMode::Sequential => {
            for cache in &plugins.caches {
                if let Some(fetch) = query_cache(server, &cache.id, &*cache.plugin, address).await {
                    return Some(fetch);
                }
            }
            None
        }
        FetchMode::Race => {
            let mut lookups: FuturesUnordered<_> = plugins
                .caches
                .iter()
                .map(|cache| query_cache(server, &cache.id, &*cache.plugin, address))
                .collect();
            while let Some(result) = lookups.next().await {
                if result.is_some() {
                    return result;
                }
            }
            None
        }
    }
}

/// Queries one cache, converting errors into misses.
async fn query_cache(
    server: &TileServer,
    cache_id: &str,
    cache: &dyn crate::plugin::Cache,
    address: &TileAddress,
) -> Option<CacheFetch> {
    let timer = server.profile(cache_id, address);
    match cache.get(server, address).await {
        Ok(Some(fetch)) => {
            timer.record(false, Some(true), Some(fetch.tile.payload.len()));
            debug!(address = %address, cache = cache_id, "cache hit");
            Some(fetch)
        }
        Ok(None) => {
            timer.record(false, Some(false), None);
            None
        }
        Err(err) => {
            timer.record(true, Some(false), None);
            warn!(address = %address, cache = cache_id, error = %err, "cache lookup failed; treating as miss");
            None
        }
    }
}

/// Runs the provider and transform stages.
///
/// On failure returns the HTTP-shaped response that ends the protocol:
/// provider errors carry their declared status (default 500), transform
/// errors are always 500, and both skip cache population.
async fn render(
    server: &TileServer,
    plugins: &PluginSet,
    address: &TileAddress,
) -> Result<TileData, TileResponse> {
    let Some(provider) = plugins.provider.as_ref() else {
        return Err(TileResponse::new(404, NO_PROVIDER_BODY, Headers::new()));
    };

    let timer = server.profile(&provider.id, address);
    let mut tile = match provider.plugin.serve(server, address).await {
        Ok(tile) => {
            timer.record(false, None, Some(tile.payload.len()));
            tile
        }
        Err(err) => {
            timer.record(true, None, None);
            warn!(address = %address, error = %err, "provider failed");
            return Err(TileResponse::new(
                err.status.unwrap_or(500),
                err.message,
                Headers::new(),
            ));
        }
    };

    for transform in &plugins.transforms {
        let timer = server.profile(&transform.id, address);
        match transform.plugin.transform(server, address, tile).await {
            Ok(next) => {
                timer.record(false, None, Some(next.payload.len()));
                tile = next;
            }
            Err(err) => {
                timer.record(true, None, None);
                warn!(address = %address, transform = %transform.id, error = %err, "transform failed");
                return Err(TileResponse::new(500, err.message, Headers::new()));
            }
        }
    }

    Ok(tile)
}

/// Stores the final tile in every cache in parallel.
///
/// One cache's failure never blocks or fails the others, and nothing here
/// can surface to the original caller.
async fn populate_caches(
    server: &TileServer,
    plugins: &PluginSet,
    address: &TileAddress,
    tile: &TileData,
) {
    let stores = plugins.caches.iter().map(|cache| async move {
        let timer = server.profile(&cache.id, address);
        match cache.plugin.set(server, address, tile).await {
            Ok(()) => timer.record(false, None, Some(tile.payload.len())),
            Err(err) => {
                timer.record(true, None, None);
                warn!(address = %address, cache = %cache.id, error = %err, "cache store failed; dropping");
            }
        }
    });
    futures::future::join_all(stores).await;
}
