//! Configuration types for Toolvault

use crate::sandbox::CapabilityPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default wall-clock budget for guest computation, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default interpreter heap ceiling, in bytes
pub const DEFAULT_MAX_MEMORY: usize = 10_000_000;

/// Default nesting depth for values crossing the sandbox boundary
pub const DEFAULT_MARSHAL_STACK_DEPTH: usize = 20;

/// Default number of HTTP requests a single session may make
pub const DEFAULT_MAX_HTTP_REQUESTS: u32 = 20;

/// Hard ceiling on fragments returned by `index.search`
pub const DEFAULT_MAX_FRAGMENTS: usize = 200;

/// Sandbox configuration shared by every session built from it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Budget for guest computation (capability calls excluded)
    pub timeout_ms: u64,

    /// Interpreter heap ceiling in bytes
    pub max_memory: usize,

    /// Interpreter native stack ceiling in bytes
    pub max_stack_size: usize,

    /// Maximum nesting of values marshalled across the boundary
    pub marshal_stack_depth: usize,

    /// HTTP requests allowed per session
    pub max_http_requests: u32,

    /// Upper bound for `index.search` limits
    pub max_fragments: usize,

    /// Limit used by `index.search` when the guest gives none
    pub default_search_limit: i64,

    /// Maximum depth of persona-to-persona `respondTo` chains
    pub max_nesting_depth: u32,

    /// How often the watchdog samples the session
    #[serde(with = "humantime_serde")]
    pub watchdog_tick: Duration,

    /// Transport-level timeout for outbound HTTP requests
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Which bridge capabilities guest scripts may use
    pub policy: CapabilityPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_memory: DEFAULT_MAX_MEMORY,
            max_stack_size: 1024 * 1024,
            marshal_stack_depth: DEFAULT_MARSHAL_STACK_DEPTH,
            max_http_requests: DEFAULT_MAX_HTTP_REQUESTS,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            default_search_limit: 10,
            max_nesting_depth: 3,
            watchdog_tick: Duration::from_millis(1),
            http_timeout: Duration::from_secs(30),
            policy: CapabilityPolicy::allow_all(),
        }
    }
}

impl SandboxConfig {
    /// Create a config with the default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guest computation budget
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the per-session HTTP request cap
    pub fn with_max_http_requests(mut self, max: u32) -> Self {
        self.max_http_requests = max;
        self
    }

    /// Set the interpreter heap ceiling
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the persona nesting cap
    pub fn with_max_nesting_depth(mut self, depth: u32) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Replace the capability policy
    pub fn with_policy(mut self, policy: CapabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (toolvault.toml)
    /// 3. File named by TOOLVAULT_CONFIG_PATH
    /// 4. `TOOLVAULT_` environment variables (e.g. `TOOLVAULT_TIMEOUT_MS`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(SandboxConfig::default()))
            .merge(Toml::file("toolvault.toml"));

        if let Ok(path) = std::env::var("TOOLVAULT_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: SandboxConfig = figment
            .merge(Env::prefixed("TOOLVAULT_").ignore(&["config_path"]))
            .extract()
            .map_err(|e| {
                crate::error::ToolvaultError::Configuration(format!(
                    "Failed to load configuration: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: SandboxConfig = Figment::from(Serialized::defaults(SandboxConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                crate::error::ToolvaultError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero where a positive value is required.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |field: &str| {
            Err(crate::error::ToolvaultError::Configuration(format!(
                "{} must be greater than zero",
                field
            )))
        };

        if self.timeout_ms == 0 {
            return invalid("timeout_ms");
        }
        if self.max_memory == 0 {
            return invalid("max_memory");
        }
        if self.max_stack_size == 0 {
            return invalid("max_stack_size");
        }
        if self.marshal_stack_depth == 0 {
            return invalid("marshal_stack_depth");
        }
        if self.watchdog_tick.is_zero() {
            return invalid("watchdog_tick");
        }
        Ok(())
    }
}
