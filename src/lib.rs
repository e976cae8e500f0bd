//! TileFlow - a pluggable map tile serving pipeline
//!
//! This library turns tile requests (`/{layer}/{z}/{x}/{y}/{file}`) into
//! responses through per-route plugin pipelines: caches are consulted
//! first, a provider renders on miss, transforms post-process the result,
//! and caches are repopulated in the background. Duplicate concurrent
//! requests for the same tile are coalesced into a single render.
//!
//! # High-Level API
//!
//! A server is configured by registering layers and routes, then
//! initialized before serving:
//!
//! ```ignore
//! use tileflow::server::{ServerOptions, TileServer};
//! use tileflow::plugin::Plugin;
//!
//! let server = TileServer::new(ServerOptions::default());
//! let layer = server.layer("basemap", None)?;
//! layer.route("tile.png").register(Plugin::Provider(my_provider))?;
//!
//! server.initialize().await?;
//! let response = server.serve(address, None).await;
//! ```
//!
//! Transport integration (hooking the pipeline into an HTTP listener) is
//! left to the embedding application; [`server::TileServer::serve`] accepts
//! opaque transport handles that are passed through to request/response
//! hook plugins.

pub mod address;
pub mod balancer;
pub mod coord;
pub mod layer;
pub mod logging;
pub mod pipeline;
pub mod plugin;
pub mod server;

pub use server::VERSION;
