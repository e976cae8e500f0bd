//! Integration tests for the tile server dispatch path.
//!
//! These tests verify the complete request workflow including:
//! - End-to-end serving through caches, provider and transforms
//! - Layer admission (zoom bounds, bounding boxes)
//! - Response finalization (powered-by, Cache-Control, Content-Length,
//!   ETag and conditional GET, HEAD truncation)
//! - Request/response hooks with raw transport handles
//! - Cache bypass and cache-wait request directives
//! - Plugin lifecycle (initialize and close)

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tileflow::address::{Headers, Method, TileAddress};
use tileflow::coord::GeoBounds;
use tileflow::layer::LayerOptions;
use tileflow::pipeline::{CACHE_HIT_HEADER, CACHE_WAIT_HEADER, SKIP_CACHE_HEADER};
use tileflow::plugin::{
    Cache, CacheFetch, Plugin, PluginError, Provider, RequestHook, ResponseHook, TileData,
    TileResponse, Transform, Transport,
};
use tileflow::server::{ServerOptions, TileServer};

// =============================================================================
// Test Helpers
// =============================================================================

/// Provider that serves a fixed payload and counts renders.
struct CountingProvider {
    payload: &'static [u8],
    renders: AtomicUsize,
    inits: AtomicUsize,
    destroys: AtomicUsize,
}

impl CountingProvider {
    fn new(payload: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            payload,
            renders: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Provider for CountingProvider {
    async fn serve(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
    ) -> Result<TileData, PluginError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let mut headers = Headers::new();
        headers.insert("X-Test", "1");
        headers.insert("Content-Type", "image/png");
        Ok(TileData::new(self.payload, headers))
    }

    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, _server: &TileServer) -> Result<(), PluginError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider whose init fails, for startup error propagation.
struct BrokenInitProvider;

#[async_trait]
impl Provider for BrokenInitProvider {
    async fn serve(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
    ) -> Result<TileData, PluginError> {
        Err(PluginError::new("unreachable"))
    }

    async fn init(&self, _server: &TileServer) -> Result<(), PluginError> {
        Err(PluginError::new("connection refused"))
    }
}

/// In-memory cache keyed by tile coordinates.
struct MemoryCache {
    store: Mutex<HashMap<String, TileData>>,
}

impl MemoryCache {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(HashMap::new()),
        })
    }

    fn key(address: &TileAddress) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            address.layer, address.z, address.x, address.y, address.filename
        )
    }

    fn seed(&self, address: &TileAddress, payload: &'static [u8]) {
        self.store
            .lock()
            .unwrap()
            .insert(Self::key(address), TileData::new(payload, Headers::new()));
    }

    fn stored(&self, address: &TileAddress) -> Option<TileData> {
        self.store.lock().unwrap().get(&Self::key(address)).cloned()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(
        &self,
        _server: &TileServer,
        address: &TileAddress,
    ) -> Result<Option<CacheFetch>, PluginError> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .get(&Self::key(address))
            .cloned()
            .map(CacheFetch::hit))
    }

    async fn set(
        &self,
        _server: &TileServer,
        address: &TileAddress,
        tile: &TileData,
    ) -> Result<(), PluginError> {
        self.store
            .lock()
            .unwrap()
            .insert(Self::key(address), tile.clone());
        Ok(())
    }
}

/// Transform that uppercases the payload.
struct UppercaseTransform;

#[async_trait]
impl Transform for UppercaseTransform {
    async fn transform(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
        tile: TileData,
    ) -> Result<TileData, PluginError> {
        Ok(TileData::new(
            tile.payload.to_ascii_uppercase(),
            tile.headers,
        ))
    }
}

/// Request hook that tags the raw request object (a `String` in tests).
struct TaggingRequestHook;

#[async_trait]
impl RequestHook for TaggingRequestHook {
    async fn on_request(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
        transport: &mut Transport<'_>,
    ) -> Result<(), PluginError> {
        if let Some(request) = transport.request.downcast_mut::<String>() {
            request.push_str(":seen");
        }
        Ok(())
    }
}

/// Response hook that stamps an extra header on every response.
struct StampingResponseHook;

#[async_trait]
impl ResponseHook for StampingResponseHook {
    async fn on_response(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
        _transport: &mut Transport<'_>,
        response: &mut TileResponse,
    ) -> Result<(), PluginError> {
        response.headers.insert("X-Stamped", "yes");
        Ok(())
    }
}

/// Response hook that rewrites a header the provider set.
struct HeaderRewritingResponseHook;

#[async_trait]
impl ResponseHook for HeaderRewritingResponseHook {
    async fn on_response(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
        _transport: &mut Transport<'_>,
        response: &mut TileResponse,
    ) -> Result<(), PluginError> {
        response.headers.insert("X-Test", "mutated");
        Ok(())
    }
}

/// Request hook that always fails.
struct RejectingRequestHook;

#[async_trait]
impl RequestHook for RejectingRequestHook {
    async fn on_request(
        &self,
        _server: &TileServer,
        _address: &TileAddress,
        _transport: &mut Transport<'_>,
    ) -> Result<(), PluginError> {
        Err(PluginError::new("request rejected"))
    }
}

fn get(path: &str) -> Option<TileAddress> {
    TileAddress::parse(path, Headers::new(), Method::Get)
}

fn get_with_headers(path: &str, headers: Headers) -> Option<TileAddress> {
    TileAddress::parse(path, headers, Method::Get)
}

// =============================================================================
// End-to-end serving
// =============================================================================

#[tokio::test]
async fn render_path_produces_full_response() {
    let server = TileServer::new(ServerOptions::default());
    let provider = CountingProvider::new(b"tile");
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(provider.clone()))
        .unwrap();

    let response = server.serve(get("/basemap/3/2/1/tile.png"), None).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"tile");
    assert_eq!(response.headers.get("X-Test"), Some("1"));
    assert_eq!(response.headers.get("Content-Type"), Some("image/png"));
    assert_eq!(response.headers.get("Content-Length"), Some("4"));
    assert_eq!(response.headers.get("Cache-Control"), Some("max-age=60"));
    assert_eq!(
        response.headers.get("X-Powered-By"),
        Some(TileServer::powered_by().as_str())
    );
    assert!(response.headers.get("ETag").is_some());
    assert_eq!(provider.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn compact_address_form_reaches_same_route() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    let response = server.serve(get("/basemap/3/2/1.tile.png"), None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"tile");
}

#[tokio::test]
async fn miss_populates_cache_and_second_request_hits() {
    let server = TileServer::new(ServerOptions::default());
    let provider = CountingProvider::new(b"tile");
    let cache = MemoryCache::new();
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route.register(Plugin::Cache(cache.clone())).unwrap();
    route.register(Plugin::Provider(provider.clone())).unwrap();

    // First request renders and populates in the background; force the
    // population to complete before delivery so the assertion is stable.
    let mut headers = Headers::new();
    headers.insert(CACHE_WAIT_HEADER, "1");
    let first = server
        .serve(get_with_headers("/basemap/3/2/1/tile.png", headers), None)
        .await;
    assert_eq!(first.status, 200);
    assert!(first.headers.get(CACHE_HIT_HEADER).is_none());

    let address = TileAddress::new("basemap", 3, 2, 1, "tile.png");
    assert!(cache.stored(&address).is_some());

    let second = server.serve(get("/basemap/3/2/1/tile.png"), None).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body.as_ref(), b"tile");
    assert_eq!(second.headers.get(CACHE_HIT_HEADER), Some("1"));
    assert_eq!(provider.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn skip_cache_header_bypasses_lookup_but_still_populates() {
    let server = TileServer::new(ServerOptions::default());
    let provider = CountingProvider::new(b"fresh");
    let cache = MemoryCache::new();
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route.register(Plugin::Cache(cache.clone())).unwrap();
    route.register(Plugin::Provider(provider.clone())).unwrap();

    let address = TileAddress::new("basemap", 3, 2, 1, "tile.png");
    cache.seed(&address, b"stale");

    let mut headers = Headers::new();
    headers.insert(SKIP_CACHE_HEADER, "*");
    headers.insert(CACHE_WAIT_HEADER, "1");
    let response = server
        .serve(get_with_headers("/basemap/3/2/1/tile.png", headers), None)
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"fresh");
    assert_eq!(provider.renders.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stored(&address).unwrap().payload.as_ref(), b"fresh");
}

#[tokio::test]
async fn transforms_apply_before_delivery_and_population() {
    let server = TileServer::new(ServerOptions::default());
    let cache = MemoryCache::new();
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route.register(Plugin::Cache(cache.clone())).unwrap();
    route
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();
    route
        .register(Plugin::Transform(Arc::new(UppercaseTransform)))
        .unwrap();

    let mut headers = Headers::new();
    headers.insert(CACHE_WAIT_HEADER, "1");
    let response = server
        .serve(get_with_headers("/basemap/3/2/1/tile.png", headers), None)
        .await;

    assert_eq!(response.body.as_ref(), b"TILE");
    let address = TileAddress::new("basemap", 3, 2, 1, "tile.png");
    assert_eq!(cache.stored(&address).unwrap().payload.as_ref(), b"TILE");
}

// =============================================================================
// Routing and admission
// =============================================================================

#[tokio::test]
async fn unknown_layer_and_file_are_404() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    for path in ["/ghost/1/2/3/tile.png", "/basemap/1/2/3/other.png"] {
        let response = server.serve(get(path), None).await;
        assert_eq!(response.status, 404, "path {path}");
        assert_eq!(response.body.as_ref(), b"Not found");
        assert_eq!(
            response.headers.get("X-Powered-By"),
            Some(TileServer::powered_by().as_str())
        );
        assert_eq!(response.headers.get("Content-Length"), Some("9"));
    }
}

#[tokio::test]
async fn zoom_bounds_reject_outside_requests() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server
        .layer(
            "basemap",
            Some(LayerOptions {
                min_zoom: Some(4),
                max_zoom: Some(8),
                bbox: Vec::new(),
            }),
        )
        .unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    assert_eq!(server.serve(get("/basemap/3/2/1/tile.png"), None).await.status, 404);
    assert_eq!(server.serve(get("/basemap/4/2/1/tile.png"), None).await.status, 200);
    assert_eq!(server.serve(get("/basemap/8/2/1/tile.png"), None).await.status, 200);
    assert_eq!(server.serve(get("/basemap/9/2/1/tile.png"), None).await.status, 404);
}

#[tokio::test]
async fn bbox_rejects_tiles_outside_coverage() {
    let server = TileServer::new(ServerOptions::default());
    // Eastern hemisphere only
    let layer = server
        .layer(
            "basemap",
            Some(LayerOptions {
                min_zoom: None,
                max_zoom: None,
                bbox: vec![GeoBounds::new(0.0, -85.0, 180.0, 85.0)],
            }),
        )
        .unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    // Zoom 2: x=3 is fully east, x=0 fully west
    assert_eq!(server.serve(get("/basemap/2/3/1/tile.png"), None).await.status, 200);
    assert_eq!(server.serve(get("/basemap/2/0/1/tile.png"), None).await.status, 404);
}

#[tokio::test]
async fn unsupported_methods_are_501() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    for method in [Method::Delete, Method::Post, Method::Put] {
        let address = TileAddress::parse("/basemap/3/2/1/tile.png", Headers::new(), method);
        let response = server.serve(address, None).await;
        assert_eq!(response.status, 501);
        assert_eq!(response.body.as_ref(), b"Not implemented");
    }
}

#[tokio::test]
async fn no_provider_is_404() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Cache(MemoryCache::new()))
        .unwrap();

    let response = server.serve(get("/basemap/3/2/1/tile.png"), None).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.body.as_ref(), b"No provider configured for layer");
}

// =============================================================================
// Finalization: ETag, conditional GET, HEAD
// =============================================================================

#[tokio::test]
async fn etag_is_stable_across_requests() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    let first = server.serve(get("/basemap/3/2/1/tile.png"), None).await;
    let second = server.serve(get("/basemap/3/2/1/tile.png"), None).await;
    assert_eq!(first.headers.get("ETag"), second.headers.get("ETag"));
}

#[tokio::test]
async fn matching_if_none_match_returns_304() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    let first = server.serve(get("/basemap/3/2/1/tile.png"), None).await;
    let etag = first.headers.get("ETag").unwrap().to_string();

    let mut headers = Headers::new();
    headers.insert("If-None-Match", etag);
    let second = server
        .serve(get_with_headers("/basemap/3/2/1/tile.png", headers), None)
        .await;
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());
}

#[tokio::test]
async fn head_request_truncates_body_after_finalization() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    let address = TileAddress::parse("/basemap/3/2/1/tile.png", Headers::new(), Method::Head);
    let response = server.serve(address, None).await;
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
    assert_eq!(response.headers.get("Content-Length"), Some("4"));
    assert!(response.headers.get("ETag").is_some());
}

#[tokio::test]
async fn error_responses_carry_no_cache_headers() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();
    route
        .register(Plugin::RequestHook(Arc::new(RejectingRequestHook)))
        .unwrap();

    let mut request = String::from("req");
    let mut raw_response = String::from("res");
    let transport = Transport::new(&mut request, &mut raw_response);
    let response = server.serve(get("/basemap/3/2/1/tile.png"), Some(transport)).await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body.as_ref(), b"request rejected");
    assert_eq!(
        response.headers.get("Cache-Control"),
        Some("no-cache, no-store, must-revalidate")
    );
    assert_eq!(response.headers.get("Pragma"), Some("no-cache"));
    assert_eq!(response.headers.get("Expires"), Some("0"));
}

// =============================================================================
// Hooks and transport
// =============================================================================

#[tokio::test]
async fn hooks_run_with_transport_and_see_raw_objects() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();
    route
        .register(Plugin::RequestHook(Arc::new(TaggingRequestHook)))
        .unwrap();
    route
        .register(Plugin::ResponseHook(Arc::new(StampingResponseHook)))
        .unwrap();

    let mut request = String::from("req");
    let mut raw_response = String::from("res");
    let transport = Transport::new(&mut request, &mut raw_response);
    let response = server.serve(get("/basemap/3/2/1/tile.png"), Some(transport)).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("X-Stamped"), Some("yes"));
    assert_eq!(request, "req:seen");
}

#[tokio::test]
async fn response_hook_mutation_does_not_reach_cached_headers() {
    let server = TileServer::new(ServerOptions::default());
    let cache = MemoryCache::new();
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route.register(Plugin::Cache(cache.clone())).unwrap();
    route
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();
    route
        .register(Plugin::ResponseHook(Arc::new(HeaderRewritingResponseHook)))
        .unwrap();

    let mut request = String::from("req");
    let mut raw_response = String::from("res");
    let transport = Transport::new(&mut request, &mut raw_response);
    let mut headers = Headers::new();
    headers.insert(CACHE_WAIT_HEADER, "1");
    let response = server
        .serve(
            get_with_headers("/basemap/3/2/1/tile.png", headers),
            Some(transport),
        )
        .await;

    // The hook's rewrite reaches the delivered response only
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("X-Test"), Some("mutated"));

    let address = TileAddress::new("basemap", 3, 2, 1, "tile.png");
    let stored = cache.stored(&address).unwrap();
    assert_eq!(stored.headers.get("X-Test"), Some("1"));
}

#[tokio::test]
async fn hooks_skipped_without_transport() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();
    route
        .register(Plugin::RequestHook(Arc::new(RejectingRequestHook)))
        .unwrap();

    // The rejecting hook would fail the request, but without transport
    // handles no hooks run.
    let response = server.serve(get("/basemap/3/2/1/tile.png"), None).await;
    assert_eq!(response.status, 200);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn initialize_and_close_dispatch_to_all_plugins() {
    let server = TileServer::new(ServerOptions::default());
    let provider_a = CountingProvider::new(b"a");
    let provider_b = CountingProvider::new(b"b");
    let basemap = server.layer("basemap", None).unwrap();
    basemap
        .route("tile.png")
        .register(Plugin::Provider(provider_a.clone()))
        .unwrap();
    let overlay = server.layer("overlay", None).unwrap();
    overlay
        .route("tile.png")
        .register(Plugin::Provider(provider_b.clone()))
        .unwrap();

    server.initialize().await.unwrap();
    assert_eq!(provider_a.inits.load(Ordering::SeqCst), 1);
    assert_eq!(provider_b.inits.load(Ordering::SeqCst), 1);

    server.close().await.unwrap();
    assert_eq!(provider_a.destroys.load(Ordering::SeqCst), 1);
    assert_eq!(provider_b.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_init_names_the_layer() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("broken-layer", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(Arc::new(BrokenInitProvider)))
        .unwrap();

    let err = server.initialize().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("broken-layer"), "got: {message}");
    assert!(message.contains("connection refused"), "got: {message}");
}

#[tokio::test]
async fn get_tile_round_trip() {
    let server = TileServer::new(ServerOptions::default());
    let layer = server.layer("basemap", None).unwrap();
    layer
        .route("tile.png")
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    let tile = server.get_tile("basemap", "tile.png", 2, 1, 3).await.unwrap();
    assert_eq!(tile.payload.as_ref(), b"tile");
    assert_eq!(tile.headers.get("X-Test"), Some("1"));

    let err = server.get_tile("ghost", "tile.png", 2, 1, 3).await.unwrap_err();
    assert!(err.to_string().contains("Not found"));
}

// =============================================================================
// Profiling
// =============================================================================

#[tokio::test]
async fn profiling_covers_cache_and_provider_stages() {
    let server = TileServer::new(ServerOptions::default());
    let cache = MemoryCache::new();
    let layer = server.layer("basemap", None).unwrap();
    let route = layer.route("tile.png");
    route.register(Plugin::Cache(cache)).unwrap();
    route
        .register(Plugin::Provider(CountingProvider::new(b"tile")))
        .unwrap();

    let mut headers = Headers::new();
    headers.insert(CACHE_WAIT_HEADER, "1");
    server
        .serve(get_with_headers("/basemap/3/2/1/tile.png", headers), None)
        .await;

    let data = server.profile_data();
    let cache_profile = data.get("basemap::tile.png::cache#1::z3").unwrap();
    assert_eq!(cache_profile.misses, 1);
    let provider_profile = data.get("basemap::tile.png::provider::z3").unwrap();
    assert_eq!(provider_profile.samples, 1);
    assert_eq!(provider_profile.errors, 0);

    server.reset_profile_data();
    assert!(server.profile_data().is_empty());
}
