//! Per-route tile pipeline.
//!
//! A [`RouteHandler`] owns the ordered plugins for one (layer, file) route
//! and executes the fetch protocol:
//!
//! ```text
//! request ──► coalescer ──► cache lookup ──► provider ──► transforms ──► deliver
//!                                 │                                        │
//!                                 └── hit ──► deliver        cache population
//! ```
//!
//! Duplicate concurrent requests for the same tile are merged by the
//! coalescer in [`coalesce`]; the protocol itself lives in [`fetch`].

mod coalesce;
mod fetch;

pub use coalesce::CoalescerStats;
pub(crate) use coalesce::{FetchCoalescer, FetchKey, FetchTicket};
pub(crate) use fetch::execute;

use crate::address::{Method, TileAddress};
use crate::plugin::{Cache, Plugin, Provider, RequestHook, ResponseHook, Transform};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;

/// Request header naming routes whose caches should be bypassed.
///
/// Value is `*` or a comma-separated list of `layer/file` tokens.
pub const SKIP_CACHE_HEADER: &str = "x-tileflow-skip-cache";

/// Request header whose presence defers delivery until cache population
/// has finished.
pub const CACHE_WAIT_HEADER: &str = "x-tileflow-cache-wait";

/// Response header marking a result that was served from cache.
pub const CACHE_HIT_HEADER: &str = "X-TileFlow-Cache-Hit";

/// Configuration-time registration errors. These are fatal and stop
/// startup; nothing here is reachable from the request path.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A second provider was registered on the same route
    #[error("a provider is already registered on this route")]
    DuplicateProvider,

    /// Unknown cache fetch mode string
    #[error("invalid cache fetch mode {0:?} (expected \"sequential\" or \"race\")")]
    InvalidFetchMode(String),
}

/// How registered caches are consulted on lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Query caches one at a time in registration order; first hit wins.
    #[default]
    Sequential,
    /// Query all caches concurrently; first hit wins, errors and misses
    /// drop a cache out of contention.
    Race,
}

impl FromStr for FetchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(FetchMode::Sequential),
            "race" => Ok(FetchMode::Race),
            other => Err(ConfigError::InvalidFetchMode(other.to_string())),
        }
    }
}

/// A plugin together with its stable id (`provider`, `cache#1`, ...),
/// used for profiling keys and log context.
pub(crate) struct Registered<T: ?Sized> {
    pub id: String,
    pub plugin: Arc<T>,
}

// Manual impl: a derive would require `T: Clone`, which trait objects
// never satisfy. Cloning only bumps the Arc.
impl<T: ?Sized> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            plugin: Arc::clone(&self.plugin),
        }
    }
}

/// The frozen plugin configuration of one route.
///
/// Cloning is cheap (Arc handles); the fetch protocol operates on a clone
/// so registration locks are never held across awaits.
#[derive(Clone, Default)]
pub(crate) struct PluginSet {
    pub provider: Option<Registered<dyn Provider>>,
    pub caches: Vec<Registered<dyn Cache>>,
    pub transforms: Vec<Registered<dyn Transform>>,
    pub request_hooks: Vec<Registered<dyn RequestHook>>,
    pub response_hooks: Vec<Registered<dyn ResponseHook>>,
    pub fetch_mode: FetchMode,
}

impl PluginSet {
    /// All plugins with their ids, for lifecycle dispatch.
    pub(crate) fn all(&self) -> Vec<(String, Plugin)> {
        let mut plugins = Vec::new();
        if let Some(p) = &self.provider {
            plugins.push((p.id.clone(), Plugin::Provider(Arc::clone(&p.plugin))));
        }
        for c in &self.caches {
            plugins.push((c.id.clone(), Plugin::Cache(Arc::clone(&c.plugin))));
        }
        for t in &self.transforms {
            plugins.push((t.id.clone(), Plugin::Transform(Arc::clone(&t.plugin))));
        }
        for h in &self.request_hooks {
            plugins.push((h.id.clone(), Plugin::RequestHook(Arc::clone(&h.plugin))));
        }
        for h in &self.response_hooks {
            plugins.push((h.id.clone(), Plugin::ResponseHook(Arc::clone(&h.plugin))));
        }
        plugins
    }
}

/// Pipeline for one (layer, file) route.
///
/// Plugins are registered at configuration time and read-only once the
/// server starts serving; the handler also owns the coalescing map for its
/// route.
pub struct RouteHandler {
    plugins: RwLock<PluginSet>,
    pub(crate) coalescer: FetchCoalescer,
}

impl RouteHandler {
    pub(crate) fn new() -> Self {
        Self {
            plugins: RwLock::new(PluginSet::default()),
            coalescer: FetchCoalescer::new(),
        }
    }

    /// Registers a plugin under its tagged role.
    ///
    /// Caches, transforms and hooks keep registration order. Registering a
    /// second provider is an error.
    pub fn register(&self, plugin: Plugin) -> Result<(), ConfigError> {
        let mut set = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        match plugin {
            Plugin::Provider(p) => {
                if set.provider.is_some() {
                    return Err(ConfigError::DuplicateProvider);
                }
                set.provider = Some(Registered {
                    id: "provider".to_string(),
                    plugin: p,
                });
            }
            Plugin::Cache(p) => {
                let id = format!("cache#{}", set.caches.len() + 1);
                set.caches.push(Registered { id, plugin: p });
            }
            Plugin::Transform(p) => {
                let id = format!("transform#{}", set.transforms.len() + 1);
                set.transforms.push(Registered { id, plugin: p });
            }
            Plugin::RequestHook(p) => {
                let id = format!("reqhook#{}", set.request_hooks.len() + 1);
                set.request_hooks.push(Registered { id, plugin: p });
            }
            Plugin::ResponseHook(p) => {
                let id = format!("reshook#{}", set.response_hooks.len() + 1);
                set.response_hooks.push(Registered { id, plugin: p });
            }
        }
        Ok(())
    }

    /// Sets the cache fetch mode for this route.
    pub fn set_fetch_mode(&self, mode: FetchMode) {
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .fetch_mode = mode;
    }

    /// Returns true if this route implements `method`.
    ///
    /// Only GET is implemented by the pipeline; HEAD is satisfied by the
    /// dispatcher as GET-then-truncate.
    pub fn supports(&self, method: &Method) -> bool {
        matches!(method, Method::Get | Method::Head)
    }

    /// Coalescing counters for this route.
    pub async fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer.stats().await
    }

    /// Number of fetches currently in flight on this route.
    pub async fn in_flight_fetches(&self) -> usize {
        self.coalescer.in_flight_count().await
    }

    /// Cheap clone of the current plugin configuration.
    pub(crate) fn snapshot(&self) -> PluginSet {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.snapshot();
        f.debug_struct("RouteHandler")
            .field("provider", &set.provider.is_some())
            .field("caches", &set.caches.len())
            .field("transforms", &set.transforms.len())
            .field("request_hooks", &set.request_hooks.len())
            .field("response_hooks", &set.response_hooks.len())
            .field("fetch_mode", &set.fetch_mode)
            .finish()
    }
}

/// Returns true if the request's skip-cache directive covers this route.
pub(crate) fn skip_cache_requested(address: &TileAddress) -> bool {
    let Some(value) = address.headers.get(SKIP_CACHE_HEADER) else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    value
        .split(',')
        .map(str::trim)
        .any(|token| token == format!("{}/{}", address.layer, address.filename))
}
