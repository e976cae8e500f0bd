//! Plugin contracts for the tile pipeline.
//!
//! A route is assembled from plugins in five roles:
//!
//! - [`Provider`] — renders a tile that no cache could supply (at most one
//!   per route)
//! - [`Cache`] — get/set storage consulted before the provider
//! - [`Transform`] — post-processes a rendered tile before delivery and
//!   cache population
//! - [`RequestHook`] / [`ResponseHook`] — observe or mutate the raw
//!   transport around pipeline execution
//!
//! Roles are a closed set: a plugin is registered explicitly under one role
//! via the [`Plugin`] enum rather than being sniffed structurally. All
//! contracts are object-safe async traits so routes can hold heterogeneous
//! plugin lists.

use crate::address::{Headers, TileAddress};
use crate::server::TileServer;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// A failure reported by a plugin stage.
///
/// The message becomes the plain-text response body when the failure
/// surfaces to a caller. A provider may declare the HTTP status to use;
/// otherwise stage failures are reported as 500.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginError {
    /// Human-readable failure description (becomes the response body)
    pub message: String,
    /// HTTP status to report, when the plugin declares one
    pub status: Option<u16>,
}

impl PluginError {
    /// Creates an error with the default (500) status.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Creates an error carrying an explicit HTTP status.
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        PluginError::new(message)
    }
}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        PluginError::new(message)
    }
}

/// A rendered tile: payload plus the headers describing it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileData {
    /// Tile bytes
    pub payload: Bytes,
    /// Headers produced alongside the payload (content type etc.)
    pub headers: Headers,
}

impl TileData {
    /// Creates tile data from any byte source.
    pub fn new(payload: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            payload: payload.into(),
            headers,
        }
    }
}

/// A successful cache lookup.
#[derive(Debug, Clone)]
pub struct CacheFetch {
    /// The cached tile
    pub tile: TileData,
    /// When true, the pipeline re-renders and re-populates caches in the
    /// background after answering the caller from this hit.
    pub refresh: bool,
}

impl CacheFetch {
    /// A plain hit with no background refresh.
    pub fn hit(tile: TileData) -> Self {
        Self {
            tile,
            refresh: false,
        }
    }

    /// A hit that additionally requests a background refresh.
    pub fn stale(tile: TileData) -> Self {
        Self {
            tile,
            refresh: true,
        }
    }
}

/// The final (status, body, headers) triple produced for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct TileResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Bytes,
    /// Response headers
    pub headers: Headers,
}

impl TileResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            status,
            body: body.into(),
            headers,
        }
    }
}

/// Externally-owned raw transport handles passed through to hooks.
///
/// The listener owns the concrete request/response types; hooks that know
/// the listener downcast via `Any`. The pipeline itself never inspects
/// these.
pub struct Transport<'a> {
    /// Raw inbound request object
    pub request: &'a mut (dyn Any + Send),
    /// Raw outbound response object
    pub response: &'a mut (dyn Any + Send),
}

impl<'a> Transport<'a> {
    /// Bundles raw request/response handles.
    pub fn new(request: &'a mut (dyn Any + Send), response: &'a mut (dyn Any + Send)) -> Self {
        Self { request, response }
    }
}

impl std::fmt::Debug for Transport<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Renders tiles that no cache could supply.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Produces the tile for `address`.
    async fn serve(
        &self,
        server: &TileServer,
        address: &TileAddress,
    ) -> Result<TileData, PluginError>;

    /// One-time setup before the server accepts traffic.
    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }

    /// Teardown on server close.
    async fn destroy(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Tile storage consulted before the provider.
///
/// Lookup errors are swallowed by the pipeline (treated as a miss for that
/// cache only) and store errors are logged and dropped, so implementations
/// should not rely on either propagating.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Looks up a tile. `Ok(None)` is a miss.
    async fn get(
        &self,
        server: &TileServer,
        address: &TileAddress,
    ) -> Result<Option<CacheFetch>, PluginError>;

    /// Stores a rendered tile.
    async fn set(
        &self,
        server: &TileServer,
        address: &TileAddress,
        tile: &TileData,
    ) -> Result<(), PluginError>;

    /// One-time setup before the server accepts traffic.
    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }

    /// Teardown on server close.
    async fn destroy(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Post-processes a rendered tile before delivery and cache population.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Consumes the tile and produces its replacement.
    async fn transform(
        &self,
        server: &TileServer,
        address: &TileAddress,
        tile: TileData,
    ) -> Result<TileData, PluginError>;

    /// One-time setup before the server accepts traffic.
    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }

    /// Teardown on server close.
    async fn destroy(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Runs before the pipeline, with access to the raw transport.
#[async_trait]
pub trait RequestHook: Send + Sync {
    /// Invoked before pipeline execution. An error aborts remaining hooks
    /// and fails the request with a 500.
    async fn on_request(
        &self,
        server: &TileServer,
        address: &TileAddress,
        transport: &mut Transport<'_>,
    ) -> Result<(), PluginError>;

    /// One-time setup before the server accepts traffic.
    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }

    /// Teardown on server close.
    async fn destroy(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Runs after the pipeline, with access to the in-progress result.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    /// Invoked after pipeline execution, before the response is finalized.
    /// May mutate `response`. An error aborts remaining hooks and fails the
    /// request with a 500.
    async fn on_response(
        &self,
        server: &TileServer,
        address: &TileAddress,
        transport: &mut Transport<'_>,
        response: &mut TileResponse,
    ) -> Result<(), PluginError>;

    /// One-time setup before the server accepts traffic.
    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }

    /// Teardown on server close.
    async fn destroy(&self, _server: &TileServer) -> Result<(), PluginError> {
        Ok(())
    }
}

/// A plugin tagged with its role, as accepted by route registration.
#[derive(Clone)]
pub enum Plugin {
    /// Tile renderer (at most one per route)
    Provider(Arc<dyn Provider>),
    /// Cache storage (ordered)
    Cache(Arc<dyn Cache>),
    /// Payload transform (ordered)
    Transform(Arc<dyn Transform>),
    /// Pre-pipeline hook (ordered)
    RequestHook(Arc<dyn RequestHook>),
    /// Post-pipeline hook (ordered)
    ResponseHook(Arc<dyn ResponseHook>),
}

impl Plugin {
    /// The role name used in plugin ids and profiling keys.
    pub fn role(&self) -> &'static str {
        match self {
            Plugin::Provider(_) => "provider",
            Plugin::Cache(_) => "cache",
            Plugin::Transform(_) => "transform",
            Plugin::RequestHook(_) => "reqhook",
            Plugin::ResponseHook(_) => "reshook",
        }
    }

    /// Dispatches `init` to the underlying plugin.
    pub async fn init(&self, server: &TileServer) -> Result<(), PluginError> {
        match self {
            Plugin::Provider(p) => p.init(server).await,
            Plugin::Cache(p) => p.init(server).await,
            Plugin::Transform(p) => p.init(server).await,
            Plugin::RequestHook(p) => p.init(server).await,
            Plugin::ResponseHook(p) => p.init(server).await,
        }
    }

    /// Dispatches `destroy` to the underlying plugin.
    pub async fn destroy(&self, server: &TileServer) -> Result<(), PluginError> {
        match self {
            Plugin::Provider(p) => p.destroy(server).await,
            Plugin::Cache(p) => p.destroy(server).await,
            Plugin::Transform(p) => p.destroy(server).await,
            Plugin::RequestHook(p) => p.destroy(server).await,
            Plugin::ResponseHook(p) => p.destroy(server).await,
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Plugin").field(&self.role()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_display_is_message() {
        let err = PluginError::new("render failed");
        assert_eq!(err.to_string(), "render failed");
        assert_eq!(err.status, None);
    }

    #[test]
    fn test_plugin_error_with_status() {
        let err = PluginError::with_status("upstream gone", 502);
        assert_eq!(err.status, Some(502));
        assert_eq!(err.to_string(), "upstream gone");
    }

    #[test]
    fn test_tile_data_from_static_bytes() {
        let tile = TileData::new(&b"tile"[..], Headers::new());
        assert_eq!(tile.payload.as_ref(), b"tile");
    }

    #[test]
    fn test_cache_fetch_constructors() {
        let tile = TileData::new(&b"t"[..], Headers::new());
        assert!(!CacheFetch::hit(tile.clone()).refresh);
        assert!(CacheFetch::stale(tile).refresh);
    }

    #[test]
    fn test_plugin_role_names() {
        struct Nop;

        #[async_trait]
        impl Transform for Nop {
            async fn transform(
                &self,
                _server: &TileServer,
                _address: &TileAddress,
                tile: TileData,
            ) -> Result<TileData, PluginError> {
                Ok(tile)
            }
        }

        let plugin = Plugin::Transform(Arc::new(Nop));
        assert_eq!(plugin.role(), "transform");
    }
}
