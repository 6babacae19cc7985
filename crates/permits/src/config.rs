//! Dispatcher configuration
//!
//! Read-type and write-type workloads each get their own dispatcher with
//! independent limits. Settings can be built in code or loaded from
//! `PERMITS_<KIND>_<OPTION>` environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::limiter::RateLimitSpec;
use crate::tenant::LimitedApi;

/// Largest buffer the underlying channel can allocate
pub const MAX_BUFFER_CAPACITY: usize = usize::MAX >> 3;

/// Workload category a dispatcher serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Read,
    Write,
}

impl WorkloadKind {
    /// Rate-limited API category for this workload
    pub fn limited_api(&self) -> LimitedApi {
        match self {
            Self::Read => LimitedApi::ReadQueries,
            Self::Write => LimitedApi::WriteQueries,
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            Self::Read => "PERMITS_READ_",
            Self::Write => "PERMITS_WRITE_",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

impl FromStr for WorkloadKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(ConfigError::Invalid {
                field: "kind",
                reason: format!("expected read or write, got {other:?}"),
            }),
        }
    }
}

/// Per-tenant rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Whether tenant submissions are checked at all
    pub enabled: bool,

    /// Limit applied to each tenant
    pub spec: RateLimitSpec,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spec: RateLimitSpec::default(),
        }
    }
}

/// Dispatcher configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use permits::{DispatcherConfig, WorkloadKind};
///
/// let config = DispatcherConfig::new(WorkloadKind::Write)
///     .with_buffer_capacity(10_000)
///     .with_concurrency_limit(64)
///     .with_max_wait_time(Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Workload category
    pub kind: WorkloadKind,

    /// Maximum number of buffered items
    pub buffer_capacity: usize,

    /// Maximum number of executions in flight (soft limit)
    pub concurrency_limit: usize,

    /// Budget from admission to completion
    #[serde(with = "duration_millis")]
    pub max_wait_time: Duration,

    /// Number of dispatch workers pulling from the buffer
    pub dispatch_workers: usize,

    /// Number of workers resolving completed items
    pub callback_workers: usize,

    /// Sleep between concurrency checks while throttled
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Stats snapshot interval
    #[serde(with = "duration_millis")]
    pub stats_interval: Duration,

    /// Resolve tenant names when reporting rate-limited tenants
    pub print_tenant_names: bool,

    /// How long `stop` waits for in-flight executions
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Per-tenant rate limits
    pub rate_limits: RateLimitConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            kind: WorkloadKind::Read,
            buffer_capacity: 200_000,
            concurrency_limit: 1000,
            max_wait_time: Duration::from_secs(120),
            dispatch_workers: 2,
            callback_workers: 4,
            poll_interval: Duration::from_millis(50),
            stats_interval: Duration::from_secs(10),
            print_tenant_names: false,
            shutdown_timeout: Duration::from_secs(30),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration with defaults for `kind`
    pub fn new(kind: WorkloadKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Load configuration for `kind` from the environment
    ///
    /// Environment variables (shown for `read`; `write` uses `PERMITS_WRITE_`):
    /// - `PERMITS_READ_BUFFER_CAPACITY`
    /// - `PERMITS_READ_CONCURRENCY_LIMIT`
    /// - `PERMITS_READ_MAX_WAIT_TIME_MS`
    /// - `PERMITS_READ_DISPATCH_WORKERS`
    /// - `PERMITS_READ_CALLBACK_WORKERS`
    /// - `PERMITS_READ_POLL_INTERVAL_MS`
    /// - `PERMITS_READ_STATS_INTERVAL_MS`
    /// - `PERMITS_READ_PRINT_TENANT_NAMES`
    /// - `PERMITS_READ_SHUTDOWN_TIMEOUT_MS`
    /// - `PERMITS_READ_RATE_LIMITS_ENABLED`
    /// - `PERMITS_READ_RATE_LIMITS_SPEC` (e.g. `1000:1,30000:60`)
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env(kind: WorkloadKind) -> Result<Self, ConfigError> {
        Self::from_lookup(kind, |key| env::var(key).ok())
    }

    fn from_lookup(
        kind: WorkloadKind,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let prefix = kind.env_prefix();
        let get = |name: &str| -> Option<(String, String)> {
            let var = format!("{prefix}{name}");
            lookup(var.as_str()).map(|value| (var, value))
        };
        let mut config = Self::new(kind);

        if let Some(v) = get("BUFFER_CAPACITY") {
            config.buffer_capacity = parse_var(v)?;
        }
        if let Some(v) = get("CONCURRENCY_LIMIT") {
            config.concurrency_limit = parse_var(v)?;
        }
        if let Some(v) = get("MAX_WAIT_TIME_MS") {
            config.max_wait_time = Duration::from_millis(parse_var(v)?);
        }
        if let Some(v) = get("DISPATCH_WORKERS") {
            config.dispatch_workers = parse_var(v)?;
        }
        if let Some(v) = get("CALLBACK_WORKERS") {
            config.callback_workers = parse_var(v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_var(v)?);
        }
        if let Some(v) = get("STATS_INTERVAL_MS") {
            config.stats_interval = Duration::from_millis(parse_var(v)?);
        }
        if let Some(v) = get("PRINT_TENANT_NAMES") {
            config.print_tenant_names = parse_bool(v)?;
        }
        if let Some(v) = get("SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = Duration::from_millis(parse_var(v)?);
        }
        if let Some(v) = get("RATE_LIMITS_ENABLED") {
            config.rate_limits.enabled = parse_bool(v)?;
        }
        if let Some((_, spec)) = get("RATE_LIMITS_SPEC") {
            config.rate_limits.spec = spec.parse()?;
        }

        Ok(config)
    }

    /// Set the buffer capacity
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the concurrency limit
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the admission-to-completion budget
    pub fn with_max_wait_time(mut self, budget: Duration) -> Self {
        self.max_wait_time = budget;
        self
    }

    /// Set the number of dispatch workers
    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    /// Set the number of callback workers
    pub fn with_callback_workers(mut self, workers: usize) -> Self {
        self.callback_workers = workers;
        self
    }

    /// Set the throttled poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the stats snapshot interval
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Resolve tenant names in stats output
    pub fn with_print_tenant_names(mut self, enabled: bool) -> Self {
        self.print_tenant_names = enabled;
        self
    }

    /// Set the graceful shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable per-tenant rate limiting with `spec`
    pub fn with_rate_limits(mut self, spec: RateLimitSpec) -> Self {
        self.rate_limits = RateLimitConfig {
            enabled: true,
            spec,
        };
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                })
            } else {
                Ok(())
            }
        };
        positive("buffer_capacity", self.buffer_capacity)?;
        if self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "buffer_capacity",
                reason: format!("must be at most {MAX_BUFFER_CAPACITY}"),
            });
        }
        positive("concurrency_limit", self.concurrency_limit)?;
        positive("dispatch_workers", self.dispatch_workers)?;
        positive("callback_workers", self.callback_workers)?;

        for (field, value) in [
            ("max_wait_time", self.max_wait_time),
            ("poll_interval", self.poll_interval),
            ("stats_interval", self.stats_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a positive duration".into(),
                });
            }
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>((var, value): (String, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn parse_bool((var, value): (String, String)) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Env { var, value }),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.kind, WorkloadKind::Read);
        assert_eq!(config.buffer_capacity, 200_000);
        assert_eq!(config.concurrency_limit, 1000);
        assert_eq!(config.max_wait_time, Duration::from_secs(120));
        assert_eq!(config.dispatch_workers, 2);
        assert_eq!(config.callback_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert!(!config.rate_limits.enabled);
        assert_eq!(config.rate_limits.spec.to_string(), "1000:1,30000:60");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::new(WorkloadKind::Write)
            .with_buffer_capacity(10)
            .with_concurrency_limit(3)
            .with_max_wait_time(Duration::from_secs(5))
            .with_dispatch_workers(4)
            .with_callback_workers(1)
            .with_poll_interval(Duration::from_millis(5))
            .with_rate_limits("10:1".parse().unwrap());

        assert_eq!(config.kind, WorkloadKind::Write);
        assert_eq!(config.buffer_capacity, 10);
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.dispatch_workers, 4);
        assert!(config.rate_limits.enabled);
        assert_eq!(config.kind.limited_api(), LimitedApi::WriteQueries);
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            DispatcherConfig::default().with_buffer_capacity(0).validate(),
            Err(ConfigError::Invalid {
                field: "buffer_capacity",
                ..
            })
        ));
        assert!(matches!(
            DispatcherConfig::default()
                .with_buffer_capacity(usize::MAX)
                .validate(),
            Err(ConfigError::Invalid {
                field: "buffer_capacity",
                ..
            })
        ));
        assert!(DispatcherConfig::default()
            .with_buffer_capacity(MAX_BUFFER_CAPACITY)
            .validate()
            .is_ok());
        assert!(DispatcherConfig::default()
            .with_dispatch_workers(0)
            .validate()
            .is_err());
        assert!(DispatcherConfig::default()
            .with_max_wait_time(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        let config = DispatcherConfig::from_lookup(
            WorkloadKind::Write,
            lookup(&[
                ("PERMITS_WRITE_BUFFER_CAPACITY", "500"),
                ("PERMITS_WRITE_CONCURRENCY_LIMIT", "8"),
                ("PERMITS_WRITE_MAX_WAIT_TIME_MS", "2500"),
                ("PERMITS_WRITE_RATE_LIMITS_ENABLED", "true"),
                ("PERMITS_WRITE_RATE_LIMITS_SPEC", "20:1"),
                // Different kind, ignored
                ("PERMITS_READ_BUFFER_CAPACITY", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.kind, WorkloadKind::Write);
        assert_eq!(config.buffer_capacity, 500);
        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.max_wait_time, Duration::from_millis(2500));
        assert!(config.rate_limits.enabled);
        assert_eq!(config.rate_limits.spec.to_string(), "20:1");
        assert_eq!(config.dispatch_workers, 2);
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let err = DispatcherConfig::from_lookup(
            WorkloadKind::Read,
            lookup(&[("PERMITS_READ_DISPATCH_WORKERS", "many")]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Env {
                var: "PERMITS_READ_DISPATCH_WORKERS".into(),
                value: "many".into()
            }
        );

        assert!(DispatcherConfig::from_lookup(
            WorkloadKind::Read,
            lookup(&[("PERMITS_READ_PRINT_TENANT_NAMES", "maybe")]),
        )
        .is_err());
    }

    #[test]
    fn test_workload_kind_parse() {
        assert_eq!("READ".parse::<WorkloadKind>().unwrap(), WorkloadKind::Read);
        assert_eq!("write".parse::<WorkloadKind>().unwrap(), WorkloadKind::Write);
        assert!("delete".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = DispatcherConfig::new(WorkloadKind::Write).with_buffer_capacity(42);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "write");
        assert_eq!(json["max_wait_time"], 120_000);
        assert_eq!(json["rate_limits"]["spec"], "1000:1,30000:60");

        let parsed: DispatcherConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
