//! Configuration management for the warden server.
//!
//! Configuration is layered: hardcoded defaults, then an optional YAML
//! file, then environment variables with the `WARDEN_` prefix and `__` as
//! the nested-key separator (e.g. `WARDEN_LIMITS__RESOLVE_NODE_LIMIT=40`).
//! Environment variables win over the file, which wins over defaults.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Experimental feature flags.
pub const EXPERIMENTAL_ENABLE_CONSISTENCY_PARAMS: &str = "enable-consistency-params";
pub const EXPERIMENTAL_ENABLE_FGA_ON_FGA: &str = "enable-fga-on-fga";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Query evaluation limits
    #[serde(default)]
    pub limits: LimitsSettings,

    /// Deadlines and horizons
    #[serde(default)]
    pub deadlines: DeadlineSettings,

    /// Check result cache settings
    #[serde(default)]
    pub check_cache: CheckCacheSettings,

    /// Dispatch throttling, independently per query family
    #[serde(default)]
    pub throttling: ThrottlingSettings,

    /// Experimental feature flags
    #[serde(default)]
    pub experimentals: Vec<String>,

    /// Self-authorization (FGA-on-FGA) settings
    #[serde(default)]
    pub fga_on_fga: FgaOnFgaSettings,

    /// Check tracker (terminal observation layer)
    #[serde(default = "default_true")]
    pub check_tracker_enabled: bool,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: LimitsSettings::default(),
            deadlines: DeadlineSettings::default(),
            check_cache: CheckCacheSettings::default(),
            throttling: ThrottlingSettings::default(),
            experimentals: Vec::new(),
            fga_on_fga: FgaOnFgaSettings::default(),
            check_tracker_enabled: true,
            logging: LoggingSettings::default(),
        }
    }
}

/// Query evaluation limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LimitsSettings {
    /// Maximum recursion depth of one Check, ListObjects, or ListUsers
    /// evaluation. Thinking of a request as a tree of evaluations, this
    /// bounds how many levels are evaluated before the model is declared
    /// too complex.
    #[serde(default = "default_resolve_node_limit")]
    pub resolve_node_limit: u32,

    /// Maximum concurrent sub-evaluations on one level of the tree.
    #[serde(default = "default_resolve_node_breadth_limit")]
    pub resolve_node_breadth_limit: u32,

    /// How many usersets are collected before a fan-out starts.
    #[serde(default = "default_userset_batch_size")]
    pub userset_batch_size: u32,

    /// Maximum in-flight datastore reads per Check request.
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads_for_check: u32,

    /// Maximum in-flight datastore reads per ListObjects request.
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads_for_list_objects: u32,

    /// Maximum in-flight datastore reads per ListUsers request.
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads_for_list_users: u32,

    /// Maximum serialized authorization model size in bytes.
    #[serde(default = "default_max_model_size_bytes")]
    pub max_authorization_model_size_bytes: usize,

    /// Entries in the memoized type-system cache.
    #[serde(default = "default_model_cache_size")]
    pub max_authorization_model_cache_size: u64,

    /// Maximum objects returned by ListObjects; 0 means unbounded.
    #[serde(default = "default_list_max_results")]
    pub list_objects_max_results: u32,

    /// Maximum users returned by ListUsers; 0 means unbounded.
    #[serde(default = "default_list_max_results")]
    pub list_users_max_results: u32,

    /// Wall-clock budget for a single Check request, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub check_request_timeout_ms: u64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            resolve_node_limit: default_resolve_node_limit(),
            resolve_node_breadth_limit: default_resolve_node_breadth_limit(),
            userset_batch_size: default_userset_batch_size(),
            max_concurrent_reads_for_check: default_max_concurrent_reads(),
            max_concurrent_reads_for_list_objects: default_max_concurrent_reads(),
            max_concurrent_reads_for_list_users: default_max_concurrent_reads(),
            max_authorization_model_size_bytes: default_max_model_size_bytes(),
            max_authorization_model_cache_size: default_model_cache_size(),
            list_objects_max_results: default_list_max_results(),
            list_users_max_results: default_list_max_results(),
            check_request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_resolve_node_limit() -> u32 {
    25
}

fn default_resolve_node_breadth_limit() -> u32 {
    100
}

fn default_userset_batch_size() -> u32 {
    100
}

fn default_max_concurrent_reads() -> u32 {
    1000
}

fn default_max_model_size_bytes() -> usize {
    262_144
}

fn default_model_cache_size() -> u64 {
    100_000
}

fn default_list_max_results() -> u32 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Deadlines and horizons.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DeadlineSettings {
    /// Maximum time spent gathering ListObjects results, in milliseconds.
    #[serde(default = "default_list_deadline_ms")]
    pub list_objects_deadline_ms: u64,

    /// Maximum time spent gathering ListUsers results, in milliseconds.
    #[serde(default = "default_list_deadline_ms")]
    pub list_users_deadline_ms: u64,

    /// Offset (in minutes) from now; newer changelog entries are withheld
    /// from ReadChanges so replicas can catch up.
    #[serde(default)]
    pub changelog_horizon_offset_minutes: i64,
}

impl Default for DeadlineSettings {
    fn default() -> Self {
        Self {
            list_objects_deadline_ms: default_list_deadline_ms(),
            list_users_deadline_ms: default_list_deadline_ms(),
            changelog_horizon_offset_minutes: 0,
        }
    }
}

fn default_list_deadline_ms() -> u64 {
    3_000
}

/// Check result cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CheckCacheSettings {
    /// Whether the check result cache layer is assembled at all.
    #[serde(default)]
    pub enabled: bool,

    /// Cache size limit in entries.
    #[serde(default = "default_check_cache_limit")]
    pub limit: u64,

    /// TTL of a cached check result, in milliseconds.
    #[serde(default = "default_check_cache_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CheckCacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_check_cache_limit(),
            ttl_ms: default_check_cache_ttl_ms(),
        }
    }
}

fn default_check_cache_limit() -> u64 {
    10_000
}

fn default_check_cache_ttl_ms() -> u64 {
    10_000
}

/// Dispatch throttling settings per query family.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ThrottlingSettings {
    #[serde(default)]
    pub check: DispatchThrottlingSettings,
    #[serde(default)]
    pub list_objects: DispatchThrottlingSettings,
    #[serde(default)]
    pub list_users: DispatchThrottlingSettings,
}

/// One query family's dispatch throttling settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DispatchThrottlingSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Ticket frequency in microseconds. Values in the nanosecond range
    /// defeat the point of throttling; keep this at micro/millisecond
    /// granularity.
    #[serde(default = "default_throttling_frequency_us")]
    pub frequency_us: u64,

    /// Dispatch count past which requests are throttled.
    #[serde(default = "default_throttling_threshold")]
    pub default_threshold: u32,

    /// Upper bound for per-request threshold overrides; 0 means unbounded.
    #[serde(default)]
    pub max_threshold: u32,
}

impl Default for DispatchThrottlingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency_us: default_throttling_frequency_us(),
            default_threshold: default_throttling_threshold(),
            max_threshold: 0,
        }
    }
}

impl DispatchThrottlingSettings {
    pub fn frequency(&self) -> Duration {
        Duration::from_micros(self.frequency_us)
    }
}

fn default_throttling_frequency_us() -> u64 {
    10_000
}

fn default_throttling_threshold() -> u32 {
    100
}

/// Self-authorization settings. Both ids are required when enabled.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct FgaOnFgaSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store_id: String,
    #[serde(default)]
    pub model_id: String,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Loads configuration from a YAML file with environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let config: ServerConfig = Config::builder()
            .add_source(File::new(
                path.as_ref().to_str().unwrap_or_default(),
                FileFormat::Yaml,
            ))
            .add_source(Environment::with_prefix("WARDEN").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config: ServerConfig = Config::builder()
            .add_source(Environment::with_prefix("WARDEN").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Whether an experimental flag is enabled.
    pub fn is_experimentally_enabled(&self, flag: &str) -> bool {
        self.experimentals.iter().any(|f| f == flag)
    }

    /// Whether the self-authorization gate is active.
    pub fn fga_on_fga_enabled(&self) -> bool {
        self.fga_on_fga.enabled && self.is_experimentally_enabled(EXPERIMENTAL_ENABLE_FGA_ON_FGA)
    }

    pub fn list_objects_deadline(&self) -> Duration {
        Duration::from_millis(self.deadlines.list_objects_deadline_ms)
    }

    pub fn list_users_deadline(&self) -> Duration {
        Duration::from_millis(self.deadlines.list_users_deadline_ms)
    }

    pub fn check_request_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.check_request_timeout_ms)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        for (name, settings) in [
            ("check", &self.throttling.check),
            ("list_objects", &self.throttling.list_objects),
            ("list_users", &self.throttling.list_users),
        ] {
            if settings.max_threshold != 0 && settings.default_threshold > settings.max_threshold {
                return Err(ConfigLoadError::Invalid(format!(
                    "{} default dispatch throttling threshold must be equal or smaller than max threshold",
                    name
                )));
            }
        }

        if self.fga_on_fga.enabled
            && (self.fga_on_fga.store_id.is_empty() || self.fga_on_fga.model_id.is_empty())
        {
            return Err(ConfigLoadError::Invalid(
                "fga_on_fga requires both store_id and model_id when enabled".to_string(),
            ));
        }

        Ok(())
    }
}
