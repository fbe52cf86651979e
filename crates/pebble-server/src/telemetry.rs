//! Logging setup.
//!
//! `RUST_LOG` selects what is logged; without it the server logs `info`
//! globally and `debug` for its own crates.

use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,pebble_server=debug,pebble_xmpp=debug";

/// Install the global tracing subscriber.
pub fn init(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // Log lines go to stderr; stdout is reserved for the wire log.
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    }
    .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::debug!(json, "Telemetry initialized");
    Ok(())
}
