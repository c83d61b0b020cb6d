//! Runtime configuration.
//!
//! Recognized keys are a contract (see the repository spec): they are read
//! from a YAML file, a `.env` file, and process environment variables, in
//! that order of increasing priority. `.env` never overwrites variables
//! already present in the environment.
//!
//! ```ignore
//! let config = GatiConfig::load(Some(Path::new("gati.yaml")))?;
//! assert_eq!(config.queue_max_depth, 10_000);
//! ```

use std::collections::HashMap;
use std::path::Path;

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// The value could not be converted to the expected type.
    TypeMismatch { key: String, expected: &'static str },
    /// An I/O or YAML parsing error occurred while loading config files.
    Load(String),
    /// A value failed range or consistency validation.
    Invalid { key: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::TypeMismatch { key, expected } => {
                write!(f, "config type mismatch for '{key}': expected {expected}")
            }
            ConfigError::Load(msg) => write!(f, "config load error: {msg}"),
            ConfigError::Invalid { key, reason } => {
                write!(f, "invalid config '{key}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Closed configuration record for the runtime. Every limit in the
/// concurrency and resource model is a field here; components receive the
/// record (or a clone) at construction and never read the environment
/// themselves.
#[derive(Debug, Clone)]
pub struct GatiConfig {
    /// Size of the fabric's subscriber worker pool.
    pub runtime_workers: usize,
    /// Maximum accepted request body, bytes.
    pub ingress_body_max_bytes: usize,
    /// Maximum accepted header count.
    pub ingress_header_max_count: usize,
    /// Total budget for one request, admission to response write.
    pub request_timeout_ms: u64,
    /// Per-topic queue depth limit.
    pub queue_max_depth: usize,
    /// Fraction of max depth below which backpressure clears.
    pub queue_backpressure_low_watermark: f64,
    /// Per-subscriber exactly-once dedup ring size.
    pub queue_dedup_ring: usize,
    /// Delivery attempt ceiling before dead-lettering (at-least-once).
    pub queue_max_attempts: u32,
    pub handler_timeout_ms: u64,
    pub hook_timeout_ms: u64,
    pub cleanup_timeout_ms: u64,
    pub module_rpc_timeout_ms: u64,
    pub module_rpc_max_retries: u32,
    pub module_rpc_backoff_initial_ms: u64,
    pub module_rpc_backoff_mult: f64,
    pub module_rpc_backoff_max_ms: u64,
    /// Whether RPC deadline expiry is retried like a transport error.
    pub module_rpc_retry_on_timeout: bool,
    pub module_pool_max: usize,
    pub module_pool_min: usize,
    /// Idle connections are closed after this long.
    pub module_pool_idle_ms: u64,
    /// Connections are recycled once this old, in use or not.
    pub module_pool_lifetime_ms: u64,
    pub transformer_chain_max: usize,
    /// Per-request snapshot stack cap (LIFO eviction beyond it).
    pub snapshot_max: usize,
    /// Canary versions whose windowed success ratio falls below this are
    /// excluded from traffic selection.
    pub canary_health_threshold: f64,
    pub log_level: String,
    pub metrics_enabled: bool,
    /// Admission method: `none`, `api_key`, or `bearer`.
    pub auth_method: String,
    /// Header carrying the shared-secret API key.
    pub auth_api_key_header: String,
    /// Shared secret for the `api_key` method.
    pub auth_api_key: Option<String>,
    /// Address the launcher binds.
    pub listen_addr: String,
    /// Directory of manifest artifacts ingested at startup.
    pub manifest_dir: Option<String>,
}

impl Default for GatiConfig {
    fn default() -> Self {
        GatiConfig {
            runtime_workers: default_workers(),
            ingress_body_max_bytes: 1_048_576,
            ingress_header_max_count: 128,
            request_timeout_ms: 60_000,
            queue_max_depth: 10_000,
            queue_backpressure_low_watermark: 0.8,
            queue_dedup_ring: 1024,
            queue_max_attempts: 3,
            handler_timeout_ms: 30_000,
            hook_timeout_ms: 5_000,
            cleanup_timeout_ms: 1_000,
            module_rpc_timeout_ms: 10_000,
            module_rpc_max_retries: 3,
            module_rpc_backoff_initial_ms: 100,
            module_rpc_backoff_mult: 2.0,
            module_rpc_backoff_max_ms: 10_000,
            module_rpc_retry_on_timeout: false,
            module_pool_max: 10,
            module_pool_min: 1,
            module_pool_idle_ms: 30_000,
            module_pool_lifetime_ms: 300_000,
            transformer_chain_max: 10,
            snapshot_max: 32,
            canary_health_threshold: 0.5,
            log_level: "info".to_string(),
            metrics_enabled: true,
            auth_method: "none".to_string(),
            auth_api_key_header: "x-gati-api-key".to_string(),
            auth_api_key: None,
            listen_addr: "127.0.0.1:8080".to_string(),
            manifest_dir: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl GatiConfig {
    /// Load configuration: defaults, overlaid by the YAML file (if given),
    /// `.env`, then process environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut values: HashMap<String, String> = HashMap::new();

        if let Some(path) = file {
            load_yaml_file(path, &mut values)?;
        }

        // .env does NOT overwrite already-set environment variables.
        let _ = dotenvy::dotenv();

        for (key, value) in std::env::vars() {
            values.insert(key, value);
        }

        Self::from_values(&values)
    }

    /// Build from the process environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = std::env::vars().collect();
        Self::from_values(&values)
    }

    /// Build from an explicit key/value map (useful for testing).
    pub fn from_values(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = GatiConfig::default();
        let config = GatiConfig {
            runtime_workers: get_parsed(values, "RUNTIME_WORKERS", defaults.runtime_workers)?,
            ingress_body_max_bytes: get_parsed(
                values,
                "INGRESS_BODY_MAX_BYTES",
                defaults.ingress_body_max_bytes,
            )?,
            ingress_header_max_count: get_parsed(
                values,
                "INGRESS_HEADER_MAX_COUNT",
                defaults.ingress_header_max_count,
            )?,
            request_timeout_ms: get_parsed(values, "REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            queue_max_depth: get_parsed(values, "QUEUE_MAX_DEPTH", defaults.queue_max_depth)?,
            queue_backpressure_low_watermark: get_parsed(
                values,
                "QUEUE_BACKPRESSURE_LOW_WATERMARK",
                defaults.queue_backpressure_low_watermark,
            )?,
            queue_dedup_ring: get_parsed(values, "QUEUE_DEDUP_RING", defaults.queue_dedup_ring)?,
            queue_max_attempts: get_parsed(values, "QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts)?,
            handler_timeout_ms: get_parsed(values, "HANDLER_TIMEOUT_MS", defaults.handler_timeout_ms)?,
            hook_timeout_ms: get_parsed(values, "HOOK_TIMEOUT_MS", defaults.hook_timeout_ms)?,
            cleanup_timeout_ms: get_parsed(values, "CLEANUP_TIMEOUT_MS", defaults.cleanup_timeout_ms)?,
            module_rpc_timeout_ms: get_parsed(
                values,
                "MODULE_RPC_TIMEOUT_MS",
                defaults.module_rpc_timeout_ms,
            )?,
            module_rpc_max_retries: get_parsed(
                values,
                "MODULE_RPC_MAX_RETRIES",
                defaults.module_rpc_max_retries,
            )?,
            module_rpc_backoff_initial_ms: get_parsed(
                values,
                "MODULE_RPC_BACKOFF_INITIAL_MS",
                defaults.module_rpc_backoff_initial_ms,
            )?,
            module_rpc_backoff_mult: get_parsed(
                values,
                "MODULE_RPC_BACKOFF_MULT",
                defaults.module_rpc_backoff_mult,
            )?,
            module_rpc_backoff_max_ms: get_parsed(
                values,
                "MODULE_RPC_BACKOFF_MAX_MS",
                defaults.module_rpc_backoff_max_ms,
            )?,
            module_rpc_retry_on_timeout: get_parsed(
                values,
                "MODULE_RPC_RETRY_ON_TIMEOUT",
                defaults.module_rpc_retry_on_timeout,
            )?,
            module_pool_max: get_parsed(values, "MODULE_POOL_MAX", defaults.module_pool_max)?,
            module_pool_min: get_parsed(values, "MODULE_POOL_MIN", defaults.module_pool_min)?,
            module_pool_idle_ms: get_parsed(values, "MODULE_POOL_IDLE_MS", defaults.module_pool_idle_ms)?,
            module_pool_lifetime_ms: get_parsed(
                values,
                "MODULE_POOL_LIFETIME_MS",
                defaults.module_pool_lifetime_ms,
            )?,
            transformer_chain_max: get_parsed(
                values,
                "TRANSFORMER_CHAIN_MAX",
                defaults.transformer_chain_max,
            )?,
            snapshot_max: get_parsed(values, "SNAPSHOT_MAX", defaults.snapshot_max)?,
            canary_health_threshold: get_parsed(
                values,
                "CANARY_HEALTH_THRESHOLD",
                defaults.canary_health_threshold,
            )?,
            log_level: values
                .get("LOG_LEVEL")
                .cloned()
                .unwrap_or(defaults.log_level),
            metrics_enabled: get_parsed(values, "METRICS_ENABLED", defaults.metrics_enabled)?,
            auth_method: values
                .get("AUTH_METHOD")
                .cloned()
                .unwrap_or(defaults.auth_method),
            auth_api_key_header: values
                .get("AUTH_API_KEY_HEADER")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.auth_api_key_header),
            auth_api_key: values.get("AUTH_API_KEY").cloned(),
            listen_addr: values
                .get("LISTEN_ADDR")
                .cloned()
                .unwrap_or(defaults.listen_addr),
            manifest_dir: values.get("MANIFEST_DIR").cloned(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Backpressure clears once topic depth drops below this.
    pub fn queue_low_watermark(&self) -> usize {
        ((self.queue_max_depth as f64) * self.queue_backpressure_low_watermark).floor() as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }
        positive("RUNTIME_WORKERS", self.runtime_workers)?;
        positive("INGRESS_BODY_MAX_BYTES", self.ingress_body_max_bytes)?;
        positive("QUEUE_MAX_DEPTH", self.queue_max_depth)?;
        positive("QUEUE_DEDUP_RING", self.queue_dedup_ring)?;
        positive("HANDLER_TIMEOUT_MS", self.handler_timeout_ms as usize)?;
        positive("HOOK_TIMEOUT_MS", self.hook_timeout_ms as usize)?;
        positive("MODULE_POOL_MAX", self.module_pool_max)?;
        if !(0.0..=1.0).contains(&self.queue_backpressure_low_watermark) {
            return Err(ConfigError::Invalid {
                key: "QUEUE_BACKPRESSURE_LOW_WATERMARK".to_string(),
                reason: "must be within (0, 1]".to_string(),
            });
        }
        if self.module_pool_min > self.module_pool_max {
            return Err(ConfigError::Invalid {
                key: "MODULE_POOL_MIN".to_string(),
                reason: "must not exceed MODULE_POOL_MAX".to_string(),
            });
        }
        if self.module_rpc_backoff_mult < 1.0 {
            return Err(ConfigError::Invalid {
                key: "MODULE_RPC_BACKOFF_MULT".to_string(),
                reason: "must be at least 1.0".to_string(),
            });
        }
        match self.auth_method.as_str() {
            "none" | "api_key" | "bearer" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "AUTH_METHOD".to_string(),
                    reason: format!("unknown method '{other}'"),
                });
            }
        }
        if self.auth_method == "api_key" && self.auth_api_key.is_none() {
            return Err(ConfigError::Invalid {
                key: "AUTH_API_KEY".to_string(),
                reason: "required when AUTH_METHOD=api_key".to_string(),
            });
        }
        Ok(())
    }
}

fn get_parsed<T: std::str::FromStr>(
    values: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match values.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        }),
    }
}

/// Load a flat YAML mapping of `KEY: value` pairs into the value map.
/// A missing file is not an error (the defaults apply).
fn load_yaml_file(path: &Path, values: &mut HashMap<String, String>) -> Result<(), ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(ConfigError::Load(format!("{}: {err}", path.display()))),
    };
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|err| ConfigError::Load(err.to_string()))?;
    let mapping = match doc {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Ok(()),
        _ => {
            return Err(ConfigError::Load(format!(
                "{}: expected a top-level mapping",
                path.display()
            )));
        }
    };
    for (key, value) in mapping {
        let key = match key {
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(ConfigError::Load(format!("non-string config key: {other:?}")));
            }
        };
        let value = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            other => {
                return Err(ConfigError::Load(format!(
                    "config key '{key}' has non-scalar value: {other:?}"
                )));
            }
        };
        values.insert(key, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_contract() {
        let config = GatiConfig::default();
        assert_eq!(config.ingress_body_max_bytes, 1_048_576);
        assert_eq!(config.queue_max_depth, 10_000);
        assert_eq!(config.handler_timeout_ms, 30_000);
        assert_eq!(config.hook_timeout_ms, 5_000);
        assert_eq!(config.cleanup_timeout_ms, 1_000);
        assert_eq!(config.module_rpc_timeout_ms, 10_000);
        assert_eq!(config.module_rpc_max_retries, 3);
        assert_eq!(config.module_rpc_backoff_initial_ms, 100);
        assert_eq!(config.module_rpc_backoff_mult, 2.0);
        assert_eq!(config.module_rpc_backoff_max_ms, 10_000);
        assert_eq!(config.module_pool_max, 10);
        assert_eq!(config.module_pool_min, 1);
        assert_eq!(config.transformer_chain_max, 10);
        assert_eq!(config.log_level, "info");
        assert!(config.metrics_enabled);
        assert_eq!(config.queue_low_watermark(), 8_000);
    }

    #[test]
    fn from_values_overrides_and_parses() {
        let mut values = HashMap::new();
        values.insert("QUEUE_MAX_DEPTH".to_string(), "50".to_string());
        values.insert("MODULE_RPC_BACKOFF_MULT".to_string(), "3.5".to_string());
        values.insert("METRICS_ENABLED".to_string(), "false".to_string());
        let config = GatiConfig::from_values(&values).unwrap();
        assert_eq!(config.queue_max_depth, 50);
        assert_eq!(config.module_rpc_backoff_mult, 3.5);
        assert!(!config.metrics_enabled);
        assert_eq!(config.queue_low_watermark(), 40);
    }

    #[test]
    fn bad_numeric_value_is_a_type_mismatch() {
        let mut values = HashMap::new();
        values.insert("QUEUE_MAX_DEPTH".to_string(), "lots".to_string());
        match GatiConfig::from_values(&values) {
            Err(ConfigError::TypeMismatch { key, .. }) => assert_eq!(key, "QUEUE_MAX_DEPTH"),
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_inverted_pool_bounds() {
        let mut values = HashMap::new();
        values.insert("MODULE_POOL_MIN".to_string(), "20".to_string());
        values.insert("MODULE_POOL_MAX".to_string(), "10".to_string());
        assert!(GatiConfig::from_values(&values).is_err());
    }

    #[test]
    fn validation_requires_api_key_secret() {
        let mut values = HashMap::new();
        values.insert("AUTH_METHOD".to_string(), "api_key".to_string());
        assert!(GatiConfig::from_values(&values).is_err());
        values.insert("AUTH_API_KEY".to_string(), "s3cret".to_string());
        let config = GatiConfig::from_values(&values).unwrap();
        assert_eq!(config.auth_api_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn yaml_file_feeds_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "QUEUE_MAX_DEPTH: 77").unwrap();
        writeln!(file, "LOG_LEVEL: debug").unwrap();
        let mut values = HashMap::new();
        load_yaml_file(file.path(), &mut values).unwrap();
        let config = GatiConfig::from_values(&values).unwrap();
        assert_eq!(config.queue_max_depth, 77);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn missing_yaml_file_falls_back_to_defaults() {
        let mut values = HashMap::new();
        load_yaml_file(Path::new("/nonexistent/gati.yaml"), &mut values).unwrap();
        assert!(values.is_empty());
    }
}
