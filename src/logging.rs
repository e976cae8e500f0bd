//! Logging infrastructure.
//!
//! Structured console logging on top of `tracing`:
//! - Compact single-line format suitable for service logs
//! - Configurable via the `RUST_LOG` environment variable
//! - Defaults to INFO when `RUST_LOG` is unset
//!
//! The library itself only emits `tracing` events; embedding applications
//! that already install a subscriber should skip [`init_logging`] and keep
//! their own.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_logging() -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()
}
