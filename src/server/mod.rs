//! Tile server dispatcher.
//!
//! [`TileServer`] owns the layer registry and turns parsed addresses into
//! responses: it applies layer admission, gates by method, runs request and
//! response hooks around the route pipeline, finalizes headers (powered-by,
//! Cache-Control, Content-Length, ETag) and performs conditional GET. Every
//! failure inside the dispatch path is converted into an HTTP-shaped 500;
//! nothing escapes uncaught.
//!
//! The server is a cheap clone-able handle over shared state, so plugins
//! and background tasks (cache population, balancer client) can hold their
//! own copies.

mod profile;

pub use profile::PluginProfile;
pub(crate) use profile::{ProfileTable, ProfileTimer};

use crate::address::{Headers, Method, TileAddress};
use crate::balancer::{BalancerClient, BalancerConfig, LayerDescriptor};
use crate::layer::{Layer, LayerError, LayerOptions};
use crate::pipeline::{self, RouteHandler};
use crate::plugin::{PluginError, TileData, TileResponse, Transport};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Crate version, advertised in `X-Powered-By` and balancer registration.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const BODY_NOT_FOUND: &str = "Not found";
const BODY_NOT_IMPLEMENTED: &str = "Not implemented";

/// Pluggable health probe invoked by [`TileServer::check_health`].
pub type HealthCheck = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Server-wide options, fixed at construction.
#[derive(Clone)]
pub struct ServerOptions {
    /// Listen port advertised to the balancer
    pub port: u16,
    /// Record per-plugin profiling samples
    pub profiling: bool,
    /// Balancer registration config; `None` disables the balancer client
    pub balancer: Option<BalancerConfig>,
    /// Optional health probe for the health endpoint
    pub healthy: Option<HealthCheck>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            profiling: true,
            balancer: None,
            healthy: None,
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("port", &self.port)
            .field("profiling", &self.profiling)
            .field("balancer", &self.balancer)
            .field("healthy", &self.healthy.is_some())
            .finish()
    }
}

/// Dispatcher-level errors.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// A concurrent `initialize` call is already running
    #[error("the server is already initializing")]
    AlreadyInitializing,

    /// A plugin failed its init; startup stops
    #[error("unable to initialize layer {layer:?}: {message}")]
    InitFailed {
        /// Layer whose route failed
        layer: String,
        /// Failing plugin id and its error
        message: String,
    },

    /// `get_tile` received a non-200 response
    #[error("{message}")]
    TileUnavailable {
        /// Status the pipeline produced
        status: u16,
        /// Response body (or a placeholder when oversized)
        message: String,
    },
}

struct ServerInner {
    options: ServerOptions,
    layers: RwLock<HashMap<String, Arc<Layer>>>,
    profiles: Arc<ProfileTable>,
    initialized: AtomicBool,
    initializing: AtomicBool,
    start_time: RwLock<Option<Instant>>,
    balancer: Mutex<Option<BalancerClient>>,
    close_result: tokio::sync::Mutex<Option<Result<(), ServerError>>>,
}

/// The tile server: registry, dispatcher and lifecycle.
#[derive(Clone)]
pub struct TileServer {
    inner: Arc<ServerInner>,
}

impl TileServer {
    /// Creates a server. Layers and routes are registered afterwards and
    /// frozen by [`TileServer::initialize`].
    pub fn new(options: ServerOptions) -> Self {
        let profiling = options.profiling;
        Self {
            inner: Arc::new(ServerInner {
                options,
                layers: RwLock::new(HashMap::new()),
                profiles: Arc::new(ProfileTable::new(profiling)),
                initialized: AtomicBool::new(false),
                initializing: AtomicBool::new(false),
                start_time: RwLock::new(None),
                balancer: Mutex::new(None),
                close_result: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// The `X-Powered-By` value for this build.
    pub fn powered_by() -> String {
        format!("TileFlow/{}", VERSION)
    }

    /// Registers (or retrieves) a layer.
    ///
    /// Registering an existing name with `None` options returns the
    /// existing layer; supplying options again for a registered name is an
    /// error.
    pub fn layer(
        &self,
        name: &str,
        options: Option<LayerOptions>,
    ) -> Result<Arc<Layer>, LayerError> {
        let mut layers = self.inner.layers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = layers.get(name) {
            return if options.is_some() {
                Err(LayerError::OptionsAlreadySet(name.to_string()))
            } else {
                Ok(Arc::clone(existing))
            };
        }
        let layer = Layer::new(name, options.unwrap_or_default())?;
        layers.insert(name.to_string(), Arc::clone(&layer));
        Ok(layer)
    }

    /// All registered layers, sorted by name.
    pub fn layers(&self) -> Vec<Arc<Layer>> {
        let layers = self.inner.layers.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Arc<Layer>> = layers.values().map(Arc::clone).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Serializable summaries of all layers, as sent to the balancer.
    pub fn layer_descriptors(&self) -> Vec<LayerDescriptor> {
        self.layers()
            .iter()
            .map(|layer| LayerDescriptor {
                name: layer.name().to_string(),
                options: layer.options().clone(),
                routes: layer.route_files(),
            })
            .collect()
    }

    /// Resolves an address to its route pipeline.
    ///
    /// `None` when the layer is unregistered, the admission policy rejects
    /// the tile, or no route exists for the file variant. Pure and safe
    /// under unlimited concurrent calls.
    pub fn resolve(&self, address: &TileAddress) -> Option<Arc<RouteHandler>> {
        let layer = {
            let layers = self.inner.layers.read().unwrap_or_else(|e| e.into_inner());
            layers.get(&address.layer).map(Arc::clone)?
        };
        if !layer.admits(address) {
            return None;
        }
        layer.resolve_route(&address.filename)
    }

    /// Serves a tile request end to end.
    ///
    /// `address` is the output of [`TileAddress::parse`]; `None` (an
    /// unparseable path) is answered with a 404 so listeners can fall
    /// through to their own routes. Transport handles, when supplied, are
    /// passed to the route's request/response hooks.
    pub async fn serve(
        &self,
        address: Option<TileAddress>,
        mut transport: Option<Transport<'_>>,
    ) -> TileResponse {
        let Some(address) = address else {
            return Self::fixed_response(404, BODY_NOT_FOUND);
        };

        let Some(handler) = self.resolve(&address) else {
            return Self::fixed_response(404, BODY_NOT_FOUND);
        };

        if !handler.supports(&address.method) {
            return Self::fixed_response(501, BODY_NOT_IMPLEMENTED);
        }

        match self.serve_resolved(&address, &handler, transport.as_mut()).await {
            Ok(response) => Self::finalize(&address, response),
            Err(err) => {
                error!(
                    address = %address,
                    error = %err,
                    "failed to serve tile; converting to 500"
                );
                Self::internal_error(err.message)
            }
        }
    }

    /// Hooks + pipeline for a resolved route. Any `Err` becomes a 500 at
    /// the dispatcher boundary.
    async fn serve_resolved(
        &self,
        address: &TileAddress,
        handler: &Arc<RouteHandler>,
        mut transport: Option<&mut Transport<'_>>,
    ) -> Result<TileResponse, PluginError> {
        let plugins = handler.snapshot();

        if let Some(transport) = transport.as_deref_mut() {
            for hook in &plugins.request_hooks {
                let timer = self.profile(&hook.id, address);
                let result = hook.plugin.on_request(self, address, transport).await;
                timer.record(result.is_err(), None, None);
                result?;
            }
        }

        let mut response = pipeline::execute(self, handler, address).await;

        response.headers.insert("X-Powered-By", Self::powered_by());
        if response.status == 200 {
            response.headers.insert("Cache-Control", "max-age=60");
        }

        if let Some(transport) = transport.as_deref_mut() {
            for hook in &plugins.response_hooks {
                let timer = self.profile(&hook.id, address);
                let result = hook
                    .plugin
                    .on_response(self, address, transport, &mut response)
                    .await;
                timer.record(result.is_err(), None, None);
                result?;
            }
        }

        Ok(response)
    }

    /// Applies Content-Length, ETag/conditional-GET and HEAD truncation.
    fn finalize(address: &TileAddress, mut response: TileResponse) -> TileResponse {
        response
            .headers
            .insert("Content-Length", response.body.len().to_string());

        if response.status == 200 {
            let etag = etag_for(&response.body);
            response.headers.insert("ETag", etag.clone());
            if address.headers.get("If-None-Match") == Some(etag.as_str()) {
                response.status = 304;
                response.body = Bytes::new();
                return response;
            }
        }

        if address.method == Method::Head {
            response.body = Bytes::new();
        }
        response
    }

    fn fixed_response(status: u16, body: &'static str) -> TileResponse {
        let mut headers = Headers::new();
        headers.insert("X-Powered-By", Self::powered_by());
        headers.insert("Content-Length", body.len().to_string());
        TileResponse::new(status, body, headers)
    }

    fn internal_error(message: String) -> TileResponse {
        let mut headers = Headers::new();
        headers.insert("X-Powered-By", Self::powered_by());
        headers.insert("Cache-Control", "no-cache, no-store, must-revalidate");
        headers.insert("Pragma", "no-cache");
        headers.insert("Expires", "0");
        headers.insert("Content-Length", message.len().to_string());
        TileResponse::new(500, message, headers)
    }

    /// Fetches a tile programmatically, without transport handles.
    ///
    /// # Errors
    ///
    /// Any non-200 outcome is returned as
    /// [`ServerError::TileUnavailable`] carrying the response body when it
    /// is reasonably small.
    pub async fn get_tile(
        &self,
        layer: &str,
        filename: &str,
        x: u32,
        y: u32,
        z: u8,
    ) -> Result<TileData, ServerError> {
        let address = TileAddress::new(layer, z, x, y, filename);
        let response = self.serve(Some(address), None).await;
        if response.status == 200 {
            Ok(TileData {
                payload: response.body,
                headers: response.headers,
            })
        } else {
            let message = if response.body.len() < 1024 {
                String::from_utf8_lossy(&response.body).into_owned()
            } else {
                format!("Tile unavailable (status {})", response.status)
            };
            Err(ServerError::TileUnavailable {
                status: response.status,
                message,
            })
        }
    }

    /// Initializes every plugin of every route, in parallel across routes.
    ///
    /// Idempotent once successful. A concurrent call while another
    /// `initialize` is running is rejected. The first plugin error wins
    /// (all routes are still awaited) and stops startup; on success the
    /// balancer client is started when configured.
    pub async fn initialize(&self) -> Result<(), ServerError> {
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.initializing.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyInitializing);
        }

        let mut route_inits = Vec::new();
        for layer in self.layers() {
            for (file, handler) in layer.routes() {
                let server = self.clone();
                let layer_name = layer.name().to_string();
                route_inits.push(async move {
                    for (id, plugin) in handler.snapshot().all() {
                        plugin.init(&server).await.map_err(|err| {
                            ServerError::InitFailed {
                                layer: layer_name.clone(),
                                message: format!("{} ({}/{})", err.message, file, id),
                            }
                        })?;
                    }
                    Ok::<(), ServerError>(())
                });
            }
        }

        let results = futures::future::join_all(route_inits).await;
        if let Some(err) = results.into_iter().find_map(Result::err) {
            self.inner.initializing.store(false, Ordering::Release);
            return Err(err);
        }

        *self
            .inner
            .start_time
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.inner.initialized.store(true, Ordering::Release);
        self.inner.initializing.store(false, Ordering::Release);
        info!(layers = self.layers().len(), "tile server initialized");

        if let Some(config) = self.inner.options.balancer.clone() {
            let client = BalancerClient::spawn(self.clone(), config);
            *self.inner.balancer.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        }

        Ok(())
    }

    /// Tears the server down: stops the balancer client, then runs every
    /// plugin's `destroy`, in parallel across routes.
    ///
    /// Idempotent: repeat calls return the first outcome. Individual
    /// teardown failures are logged and never abort the rest.
    pub async fn close(&self) -> Result<(), ServerError> {
        let mut guard = self.inner.close_result.lock().await;
        if let Some(result) = guard.as_ref() {
            return result.clone();
        }

        let balancer = self
            .inner
            .balancer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(client) = balancer {
            client.shutdown().await;
        }

        let mut route_teardowns = Vec::new();
        for layer in self.layers() {
            for (file, handler) in layer.routes() {
                let server = self.clone();
                let layer_name = layer.name().to_string();
                route_teardowns.push(async move {
                    for (id, plugin) in handler.snapshot().all() {
                        if let Err(err) = plugin.destroy(&server).await {
                            warn!(
                                layer = %layer_name,
                                route = %file,
                                plugin = %id,
                                error = %err,
                                "plugin teardown failed"
                            );
                        }
                    }
                });
            }
        }
        futures::future::join_all(route_teardowns).await;

        self.inner.initialized.store(false, Ordering::Release);
        let result = Ok(());
        *guard = Some(result.clone());
        info!("tile server closed");
        result
    }

    /// Forwards a balancer heartbeat received by the health endpoint.
    ///
    /// Returns true when the token matched the current registration and
    /// re-armed the heartbeat window.
    pub fn handle_heartbeat(&self, token: &str) -> bool {
        let balancer = self.inner.balancer.lock().unwrap_or_else(|e| e.into_inner());
        match balancer.as_ref() {
            Some(client) => client.handle_heartbeat(token),
            None => false,
        }
    }

    /// Invokes the configured health probe; no probe means healthy.
    pub fn check_health(&self) -> Result<(), String> {
        match &self.inner.options.healthy {
            Some(probe) => probe(),
            None => Ok(()),
        }
    }

    /// How long the server has been serving, if initialized.
    pub fn uptime(&self) -> Option<Duration> {
        self.inner
            .start_time
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .map(|start| start.elapsed())
    }

    /// Listen port advertised to the balancer.
    pub fn port(&self) -> u16 {
        self.inner.options.port
    }

    /// Snapshot of the profiling table, keyed `layer::file::plugin::zN`.
    pub fn profile_data(&self) -> HashMap<String, PluginProfile> {
        self.inner.profiles.snapshot()
    }

    /// Clears all profiling samples.
    pub fn reset_profile_data(&self) {
        self.inner.profiles.reset();
    }

    /// Starts a profiling timer for one plugin invocation.
    pub(crate) fn profile(&self, plugin_id: &str, address: &TileAddress) -> ProfileTimer {
        self.inner.profiles.timer(plugin_id, address)
    }
}

impl std::fmt::Debug for TileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileServer")
            .field("layers", &self.layers().len())
            .field("initialized", &self.inner.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

/// Content hash used for ETag / If-None-Match handling: quoted first half
/// of the body's SHA-256 hex digest.
fn etag_for(body: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(body));
    format!("\"{}\"", &digest[..32])
}
