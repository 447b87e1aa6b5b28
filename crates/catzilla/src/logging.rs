// src/logging.rs
//! Logging initialization.
//!
//! Structured records are emitted through `tracing` under the targets
//! `catzilla::router`, `catzilla::server`, `catzilla::middleware`,
//! `catzilla::cache`, `catzilla::static`, and `catzilla::tasks`.
//!
//! `RUST_LOG` always wins. Without it the default filter is derived from
//! the runtime mode: production is silent except errors, development
//! shows info, and `APP_DEBUG` (any non-empty value) turns everything on.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, Mode};

fn default_filter(config: &Config) -> &'static str {
    if config.debug {
        "debug"
    } else if config.mode == Mode::Production {
        "error"
    } else {
        "info"
    }
}

/// Initialize logging with mode-derived defaults. Call once, before the
/// server starts; a second call panics inside the subscriber registry.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// JSON-formatted logging for production log aggregation.
pub fn init_logging_json(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Per-request development log line.
pub fn log_request(method: &str, path: &str, status: u16, micros: u64) {
    tracing::debug!(
        target: "catzilla::server",
        %method,
        %path,
        status,
        micros,
        "request"
    );
}
