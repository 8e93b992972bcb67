//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Gate Configuration
//!
//! - `IP_FILTER_ENABLED`: Toggle the IP filter gate (default: true)
//! - `BLOCKED_IPS`: Comma-separated IPs/CIDR ranges blocked at startup
//! - `RATE_LIMIT_ENABLED`: Toggle the rate limit gate (default: true)
//! - `RATE_LIMIT_WINDOW_SECS`: Fixed window length (default: 60)
//! - `RATE_LIMIT_AUTH` / `RATE_LIMIT_PAYMENT` / `RATE_LIMIT_API` / `RATE_LIMIT_DEFAULT`:
//!   Requests per window for each route class (default: 10 / 20 / 100 / 200)
//! - `GATE_FAIL_MODE`: `open` or `closed` when a backing store fails (default: open)
//! - `GATE_STORE_TIMEOUT_MS`: Upper bound for a single store query (default: 250)
//!
//! # Security Configuration
//!
//! - `ADMIN_API_KEY`: Enables the `/admin` API when set
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarded headers are honoured
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated list of allowed origins (default: `*`)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::route_class::RouteClass;

/// What a gate does when its backing store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Admit the request and log a warning.
    #[default]
    Open,
    /// Reject the request with 503.
    Closed,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(format!("expected 'open' or 'closed', got '{other}'")),
        }
    }
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::Open => "open",
            FailMode::Closed => "closed",
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-route-class request limits for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLimits {
    pub auth: u32,
    pub payment: u32,
    pub api: u32,
    pub default: u32,
}

impl RouteLimits {
    /// Limit configured for a route class.
    pub fn for_class(&self, class: RouteClass) -> u32 {
        match class {
            RouteClass::Auth => self.auth,
            RouteClass::Payment => self.payment,
            RouteClass::Api => self.api,
            RouteClass::Default => self.default,
        }
    }
}

impl Default for RouteLimits {
    fn default() -> Self {
        Self {
            auth: 10,
            payment: 20,
            api: 100,
            default: 200,
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Platform backend that admitted requests are forwarded to.
    /// `None` disables forwarding; unmatched routes answer 404.
    pub upstream_url: Option<String>,

    /// Timeout for a forwarded request (default: 30 seconds)
    pub upstream_timeout: Duration,

    /// Maximum request body size in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // IP Filter Configuration
    // =========================================================================
    /// Whether the IP filter gate runs at all
    pub ip_filter_enabled: bool,

    /// Addresses or CIDR ranges blocked at startup
    pub blocked_ips: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Whether the rate limit gate runs at all
    pub rate_limit_enabled: bool,

    /// Fixed window length shared by every route class
    pub rate_limit_window: Duration,

    /// Requests allowed per window, by route class
    pub route_limits: RouteLimits,

    // =========================================================================
    // Gate Resilience Configuration
    // =========================================================================
    /// Behaviour when the block-list or quota store fails
    pub gate_fail_mode: FailMode,

    /// Upper bound for one block-list or quota query
    pub gate_store_timeout: Duration,

    /// Interval of the background purge of expired windows and blocks
    pub cleanup_interval: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// API key for the `/admin` routes (None = admin API disabled)
    pub admin_api_key: Option<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges.
    ///
    /// `X-Forwarded-For` / `X-Real-IP` are only honoured when the peer
    /// address falls inside one of these ranges. Empty trusts every peer.
    ///
    /// Common values:
    /// - Private networks: "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16"
    /// - Kubernetes: "10.0.0.0/8" (pod network)
    /// - Localhost: "127.0.0.0/8,::1/128"
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Emit JSON logs instead of the human-readable format
    pub log_json: bool,

    /// Number of security events kept in memory for the admin API
    pub security_event_capacity: usize,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// combination is inconsistent (e.g. a zero route limit).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = RouteLimits::default();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            upstream_url: env::var("UPSTREAM_URL")
                .ok()
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            upstream_timeout: Duration::from_secs(Self::parse_env("UPSTREAM_TIMEOUT_SECS", 30)?),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?, // 10MB

            // IP filter
            ip_filter_enabled: Self::parse_env("IP_FILTER_ENABLED", true)?,
            blocked_ips: Self::parse_list("BLOCKED_IPS"),

            // Rate limiting
            rate_limit_enabled: Self::parse_env("RATE_LIMIT_ENABLED", true)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            route_limits: RouteLimits {
                auth: Self::parse_env("RATE_LIMIT_AUTH", defaults.auth)?,
                payment: Self::parse_env("RATE_LIMIT_PAYMENT", defaults.payment)?,
                api: Self::parse_env("RATE_LIMIT_API", defaults.api)?,
                default: Self::parse_env("RATE_LIMIT_DEFAULT", defaults.default)?,
            },

            // Gate resilience
            gate_fail_mode: Self::parse_env("GATE_FAIL_MODE", FailMode::Open)?,
            gate_store_timeout: Duration::from_millis(Self::parse_env(
                "GATE_STORE_TIMEOUT_MS",
                250,
            )?),
            cleanup_interval: Duration::from_secs(Self::parse_env("CLEANUP_INTERVAL_SECS", 60)?),

            // Security
            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            cors_allowed_origins: Self::parse_cors_origins(),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES"),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),
            security_event_capacity: Self::parse_env("SECURITY_EVENT_CAPACITY", 1000)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.rate_limit_enabled {
            if self.rate_limit_window.is_zero() {
                return Err(AppError::ConfigError(
                    "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
                ));
            }

            for class in RouteClass::ALL {
                if self.route_limits.for_class(class) == 0 {
                    return Err(AppError::ConfigError(format!(
                        "{} must be greater than 0; use RATE_LIMIT_ENABLED=false to disable",
                        class.limit_env_var()
                    )));
                }
            }
        }

        if self.gate_store_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "GATE_STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(AppError::ConfigError(
                "CLEANUP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.upstream_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(AppError::ConfigError(format!(
                "UPSTREAM_URL must start with http:// or https://, got '{url}'"
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the admin API is enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Check if admitted requests are forwarded to the platform backend.
    pub fn forwarding_enabled(&self) -> bool {
        self.upstream_url.is_some()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        split_list(&env::var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()))
    }

    /// Parse a comma-separated list variable; unset means empty.
    fn parse_list(name: &str) -> Vec<String> {
        env::var(name).map(|s| split_list(&s)).unwrap_or_default()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            upstream_url: None,
            upstream_timeout: Duration::from_secs(30),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // IP filter
            ip_filter_enabled: true,
            blocked_ips: vec![],
            // Rate limiting
            rate_limit_enabled: true,
            rate_limit_window: Duration::from_secs(60),
            route_limits: RouteLimits::default(),
            // Gate resilience
            gate_fail_mode: FailMode::Open,
            gate_store_timeout: Duration::from_millis(250),
            cleanup_interval: Duration::from_secs(60),
            // Security
            admin_api_key: None,
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Observability
            log_level: "info".to_string(),
            log_json: false,
            security_event_capacity: 1000,
            metrics_port: 9090,
        }
    }
}
