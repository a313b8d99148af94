use std::str::FromStr;
use std::time::Duration;

use laminar_core::config::{EngineConfig, DEFAULT_CACHE_MAX_COST};
use laminar_core::error::CoreError;

/// Settings for the gateway's outer cache and coalescing tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Lifetime of a response in the gateway cache (default: 5 s).
    pub cache_ttl: Duration,
    /// Cost budget of the gateway cache.
    pub cache_max_cost: u64,
    /// Deadline for one engine call (default: 3 s).
    pub engine_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(5000),
            cache_max_cost: DEFAULT_CACHE_MAX_COST,
            engine_timeout: Duration::from_millis(3000),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8081`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on waiting for shard workers to drain at shutdown.
    pub shutdown_timeout_secs: u64,
    pub engine: EngineConfig,
    pub gateway: GatewayConfig,
    /// Sleep per executed query in the built-in executor (default: `0`).
    pub simulated_service_ms: u64,
    /// How often expired cache entries are reclaimed (default: `30`).
    pub cache_janitor_interval_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                    |
    /// |-------------------------------|----------------------------|
    /// | `HOST`                        | `0.0.0.0`                  |
    /// | `PORT`                        | `8081`                     |
    /// | `CORS_ORIGINS`                | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS`        | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`       | `30`                       |
    /// | `LAMINAR_SHARDS`              | available parallelism      |
    /// | `LAMINAR_QUEUE_CAPACITY`      | `100`                      |
    /// | `LAMINAR_HIGH_WATER_MARK`     | `10`                       |
    /// | `LAMINAR_LOW_WATER_MARK`      | `5`                        |
    /// | `LAMINAR_CACHE_MAX_COST`      | `1048576`                  |
    /// | `LAMINAR_CACHE_TTL_MS`        | `5000`                     |
    /// | `LAMINAR_REROUTE_CEILING`     | unset (rerouting disabled) |
    /// | `GATEWAY_CACHE_TTL_MS`        | `5000`                     |
    /// | `GATEWAY_CACHE_MAX_COST`      | `1048576`                  |
    /// | `GATEWAY_ENGINE_TIMEOUT_MS`   | `3000`                     |
    /// | `SIMULATED_SERVICE_MS`        | `0`                        |
    /// | `CACHE_JANITOR_INTERVAL_SECS` | `30`                       |
    ///
    /// Panics if the resulting configuration fails [`ServerConfig::validate`].
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = env_or("PORT", 8081);

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECS", 30);
        let shutdown_timeout_secs: u64 = env_or("SHUTDOWN_TIMEOUT_SECS", 30);

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            shard_count: env_or("LAMINAR_SHARDS", defaults.shard_count),
            queue_capacity: env_or("LAMINAR_QUEUE_CAPACITY", defaults.queue_capacity),
            high_water_mark: env_or("LAMINAR_HIGH_WATER_MARK", defaults.high_water_mark),
            low_water_mark: env_or("LAMINAR_LOW_WATER_MARK", defaults.low_water_mark),
            cache_max_cost: env_or("LAMINAR_CACHE_MAX_COST", defaults.cache_max_cost),
            cache_ttl: Duration::from_millis(env_or(
                "LAMINAR_CACHE_TTL_MS",
                defaults.cache_ttl.as_millis() as u64,
            )),
            reroute_ceiling: env_opt("LAMINAR_REROUTE_CEILING"),
        };

        let gateway_defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            cache_ttl: Duration::from_millis(env_or(
                "GATEWAY_CACHE_TTL_MS",
                gateway_defaults.cache_ttl.as_millis() as u64,
            )),
            cache_max_cost: env_or("GATEWAY_CACHE_MAX_COST", gateway_defaults.cache_max_cost),
            engine_timeout: Duration::from_millis(env_or(
                "GATEWAY_ENGINE_TIMEOUT_MS",
                gateway_defaults.engine_timeout.as_millis() as u64,
            )),
        };

        let simulated_service_ms: u64 = env_or("SIMULATED_SERVICE_MS", 0);
        let cache_janitor_interval_secs: u64 = env_or("CACHE_JANITOR_INTERVAL_SECS", 30);

        let config = Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            engine,
            gateway,
            simulated_service_ms,
            cache_janitor_interval_secs,
        };
        if let Err(e) = config.validate() {
            panic!("Invalid server configuration: {e}");
        }
        config
    }

    /// Reject settings that would stall or disable part of the server.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.engine.validate()?;
        if self.request_timeout_secs == 0 {
            return Err(CoreError::Validation(
                "REQUEST_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        if self.gateway.engine_timeout.is_zero() {
            return Err(CoreError::Validation(
                "GATEWAY_ENGINE_TIMEOUT_MS must be at least 1".to_string(),
            ));
        }
        if self.cache_janitor_interval_secs == 0 {
            return Err(CoreError::Validation(
                "CACHE_JANITOR_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `name` from the environment, falling back to `default` when unset.
///
/// Panics on an unparsable value so misconfiguration fails at startup.
fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_opt(name).unwrap_or(default)
}

fn env_opt<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => panic!("{name} must be a valid {}: {e}", std::any::type_name::<T>()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
