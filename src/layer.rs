//! Layer registry entries.
//!
//! A [`Layer`] is a named map source owning one [`RouteHandler`] per file
//! variant, plus the admission policy (zoom bounds, bounding boxes) the
//! dispatcher applies before routing a request to it. Layers are
//! registered before the server starts serving and are static for the
//! process lifetime.

use crate::address::TileAddress;
use crate::coord::{tile_bounds, GeoBounds};
use crate::pipeline::RouteHandler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Layer registration errors. Fatal at configuration time.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LayerError {
    /// Name contains characters outside `[A-Za-z0-9_-]`
    #[error("invalid layer name {0:?} (must match [A-Za-z0-9_-]+)")]
    InvalidName(String),

    /// Options were passed for a name that is already registered
    #[error("layer {0:?} is already registered; options may only be supplied once")]
    OptionsAlreadySet(String),
}

/// Admission policy for a layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerOptions {
    /// Reject requests below this zoom
    pub min_zoom: Option<u8>,
    /// Reject requests above this zoom
    pub max_zoom: Option<u8>,
    /// When non-empty, the tile footprint must intersect at least one box
    pub bbox: Vec<GeoBounds>,
}

/// A named map source owning its file-variant routes.
pub struct Layer {
    name: String,
    options: LayerOptions,
    routes: RwLock<HashMap<String, Arc<RouteHandler>>>,
}

impl Layer {
    /// Validates the name and creates the layer.
    pub(crate) fn new(name: &str, options: LayerOptions) -> Result<Arc<Layer>, LayerError> {
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(LayerError::InvalidName(name.to_string()));
        }
        Ok(Arc::new(Layer {
            name: name.to_string(),
            options,
            routes: RwLock::new(HashMap::new()),
        }))
    }

    /// The layer's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The layer's admission policy.
    pub fn options(&self) -> &LayerOptions {
        &self.options
    }

    /// Returns the route for `filename`, creating it on first use.
    ///
    /// Exactly one handler exists per (layer, file); repeated calls return
    /// the same instance.
    pub fn route(&self, filename: &str) -> Arc<RouteHandler> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            routes
                .entry(filename.to_string())
                .or_insert_with(|| Arc::new(RouteHandler::new())),
        )
    }

    /// Looks up an existing route without creating one.
    pub(crate) fn resolve_route(&self, filename: &str) -> Option<Arc<RouteHandler>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(filename)
            .map(Arc::clone)
    }

    /// Registered file variants, sorted for stable output.
    pub fn route_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        files.sort();
        files
    }

    /// All routes, for lifecycle dispatch.
    pub(crate) fn routes(&self) -> Vec<(String, Arc<RouteHandler>)> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(file, handler)| (file.clone(), Arc::clone(handler)))
            .collect()
    }

    /// Applies the admission policy to an address.
    ///
    /// Pure and safe under unlimited concurrent calls: zoom must lie within
    /// the configured bounds and, when boxes are configured, the tile
    /// footprint must intersect at least one of them.
    pub fn admits(&self, address: &TileAddress) -> bool {
        if let Some(min) = self.options.min_zoom {
            if address.z < min {
                return false;
            }
        }
        if let Some(max) = self.options.max_zoom {
            if address.z > max {
                return false;
            }
        }
        if !self.options.bbox.is_empty() {
            let footprint = tile_bounds(address.z, address.x, address.y);
            if !self
                .options
                .bbox
                .iter()
                .any(|bbox| bbox.intersects(&footprint))
            {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("routes", &self.route_files())
            .finish()
    }
}
