// src/config.rs
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CatzillaError, CatzillaResult};
use crate::http::parser::Limits;

/// Runtime mode. Production keeps error bodies minimal and the banner
/// compact; development enables diagnostics and request logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Mode {
    Development,
    Production,
}

/// Which allocator backend the facade should prefer. `Auto` takes the
/// thread-caching backend when the build carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AllocatorPref {
    Auto,
    ThreadCaching,
    System,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server host (default: 127.0.0.1)
    pub host: String,

    /// Server port (default: 8000)
    pub port: u16,

    /// Reactor worker count (default: one per core)
    pub workers: usize,

    pub mode: Mode,

    pub allocator: AllocatorPref,

    /// L2 cache root; None disables the disk tier.
    pub cache_dir: Option<PathBuf>,

    /// Verbose structured logging (APP_DEBUG).
    pub debug: bool,

    /// Parser limits; body cap is overridable via APP_MAX_BODY.
    #[serde(skip, default)]
    pub limits: Limits,

    /// Keep-alive budget: seconds of idle time and requests per connection.
    pub keep_alive_timeout_secs: u32,
    pub keep_alive_max_requests: u32,

    /// Per-request deadline; on expiry the loop answers 503 instead of
    /// starting the response write.
    pub request_deadline_ms: u64,

    /// Grace period for draining in-flight responses at shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workers: num_cpus::get(),
            mode: Mode::Development,
            allocator: AllocatorPref::Auto,
            cache_dir: None,
            debug: false,
            limits: Limits::default(),
            keep_alive_timeout_secs: 30,
            keep_alive_max_requests: 10_000,
            request_deadline_ms: 30_000,
            shutdown_grace_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset. Only an unrecognized APP_ALLOCATOR
    /// value is a hard error, so a typo cannot silently change backends.
    pub fn from_env() -> CatzillaResult<Self> {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            config.port = port.parse().unwrap_or(config.port);
        }
        if let Ok(workers) = std::env::var("SERVER_WORKERS") {
            config.workers = workers.parse().unwrap_or(config.workers).max(1);
        }

        config.debug = std::env::var("APP_DEBUG").is_ok_and(|v| !v.is_empty());

        if let Ok(env) = std::env::var("ENVIRONMENT") {
            config.mode = match env.as_str() {
                "production" => Mode::Production,
                _ => Mode::Development,
            };
        }

        if let Ok(pref) = std::env::var("APP_ALLOCATOR") {
            config.allocator = match pref.as_str() {
                "auto" => AllocatorPref::Auto,
                "thread-caching" | "mimalloc" => AllocatorPref::ThreadCaching,
                "system" => AllocatorPref::System,
                other => {
                    return Err(CatzillaError::Config(format!(
                        "APP_ALLOCATOR must be auto|thread-caching|system, got '{other}'"
                    )));
                }
            };
        }

        if let Ok(dir) = std::env::var("APP_CACHE_DIR")
            && !dir.is_empty()
        {
            config.cache_dir = Some(PathBuf::from(dir));
        }

        if let Ok(max_body) = std::env::var("APP_MAX_BODY") {
            config.limits.max_body = max_body
                .parse()
                .map_err(|_| CatzillaError::Config("APP_MAX_BODY must be a byte count".into()))?;
        }

        Ok(config)
    }

    pub fn is_dev(&self) -> bool {
        self.mode == Mode::Development
    }

    /// Full bind address, `host:port`.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_contract() {
        let config = Config::default();
        assert_eq!(config.limits.max_request_line, 8 * 1024);
        assert_eq!(config.limits.max_header_bytes, 32 * 1024);
        assert_eq!(config.limits.max_body, 16 * 1024 * 1024);
        assert_eq!(config.port, 8000);
        assert!(config.is_dev());
        assert_eq!(config.server_addr(), "127.0.0.1:8000");
    }

    #[test]
    fn allocator_pref_parses_aliases() {
        // Exercised through from_env in integration tests; here we only
        // pin the enum default.
        assert_eq!(Config::default().allocator, AllocatorPref::Auto);
    }
}
