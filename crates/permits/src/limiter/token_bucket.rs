//! Token bucket rate limiter
//!
//! A limit is a list of bandwidths written as `capacity:seconds`, comma
//! separated, e.g. `1000:1,30000:60` allows bursts of 1000 per second but no
//! more than 30000 per minute. Each bandwidth refills greedily at
//! `capacity / seconds` tokens per second.

use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use super::RateLimiter;
use crate::error::ConfigError;
use crate::tenant::{LimitedApi, TenantId};

/// One `capacity:seconds` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    /// Maximum tokens (burst size)
    pub capacity: u64,
    /// Time to refill a full bucket
    #[serde(with = "crate::config::duration_millis")]
    pub period: Duration,
}

impl Bandwidth {
    /// Create a bandwidth of `capacity` units per `period`
    pub fn new(capacity: u64, period: Duration) -> Self {
        Self { capacity, period }
    }

    fn refill_per_sec(&self) -> f64 {
        self.capacity as f64 / self.period.as_secs_f64()
    }
}

/// Parsed rate limit definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimitSpec {
    bandwidths: Vec<Bandwidth>,
}

impl RateLimitSpec {
    /// Build a spec from bandwidths
    pub fn new(bandwidths: Vec<Bandwidth>) -> Result<Self, ConfigError> {
        let spec = Self { bandwidths };
        if spec.bandwidths.is_empty() {
            return Err(spec.error("at least one capacity:seconds pair is required"));
        }
        if let Some(bw) = spec
            .bandwidths
            .iter()
            .find(|bw| bw.capacity == 0 || bw.period.is_zero())
        {
            let reason = format!(
                "capacity and period must be positive, got {}:{}",
                bw.capacity,
                bw.period.as_secs()
            );
            return Err(spec.error(&reason));
        }
        Ok(spec)
    }

    /// Configured bandwidths
    pub fn bandwidths(&self) -> &[Bandwidth] {
        &self.bandwidths
    }

    fn error(&self, reason: &str) -> ConfigError {
        ConfigError::RateLimitSpec {
            spec: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Default for RateLimitSpec {
    /// 1000 per second, 30000 per minute
    fn default() -> Self {
        Self {
            bandwidths: vec![
                Bandwidth::new(1000, Duration::from_secs(1)),
                Bandwidth::new(30000, Duration::from_secs(60)),
            ],
        }
    }
}

impl FromStr for RateLimitSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::RateLimitSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let mut bandwidths = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (capacity, seconds) = part
                .split_once(':')
                .ok_or_else(|| invalid("expected capacity:seconds"))?;
            let capacity: u64 = capacity
                .trim()
                .parse()
                .map_err(|_| invalid("capacity is not a number"))?;
            let seconds: u64 = seconds
                .trim()
                .parse()
                .map_err(|_| invalid("seconds is not a number"))?;
            bandwidths.push(Bandwidth::new(capacity, Duration::from_secs(seconds)));
        }

        Self::new(bandwidths).map_err(|e| match e {
            ConfigError::RateLimitSpec { reason, .. } => invalid(&reason),
            other => other,
        })
    }
}

impl std::fmt::Display for RateLimitSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .bandwidths
            .iter()
            .map(|bw| format!("{}:{}", bw.capacity, bw.period.as_secs()))
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl TryFrom<String> for RateLimitSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RateLimitSpec> for String {
    fn from(spec: RateLimitSpec) -> Self {
        spec.to_string()
    }
}

/// Token state for every bandwidth of one (api, tenant) key
struct Bucket {
    tokens: Vec<f64>,
    last_refill: Instant,
}

impl Bucket {
    fn full(spec: &RateLimitSpec) -> Self {
        Self {
            tokens: spec.bandwidths.iter().map(|bw| bw.capacity as f64).collect(),
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, spec: &RateLimitSpec) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        for (tokens, bw) in self.tokens.iter_mut().zip(&spec.bandwidths) {
            *tokens = (*tokens + elapsed * bw.refill_per_sec()).min(bw.capacity as f64);
        }

        // All-or-nothing: a denial consumes nothing
        if self.tokens.iter().all(|t| *t >= 1.0) {
            for tokens in &mut self.tokens {
                *tokens -= 1.0;
            }
            true
        } else {
            false
        }
    }
}

/// Token bucket limiter keyed by API and tenant
///
/// Buckets are created on first use and live as long as the limiter.
///
/// # Example
///
/// ```
/// use permits::limiter::{RateLimiter, TenantRateLimiter};
/// use permits::{LimitedApi, TenantId};
///
/// let limiter = TenantRateLimiter::new("2:60".parse().unwrap());
/// let tenant = TenantId::random();
///
/// assert!(limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
/// assert!(limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
/// assert!(!limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
/// ```
pub struct TenantRateLimiter {
    default_spec: RateLimitSpec,
    overrides: DashMap<TenantId, RateLimitSpec>,
    buckets: DashMap<(LimitedApi, TenantId), Mutex<Bucket>>,
}

impl TenantRateLimiter {
    /// Create a limiter applying `spec` to every tenant
    pub fn new(spec: RateLimitSpec) -> Self {
        Self {
            default_spec: spec,
            overrides: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Apply a different limit to one tenant
    ///
    /// Resets that tenant's buckets so the new limit starts full.
    pub fn set_tenant_spec(&self, tenant: TenantId, spec: RateLimitSpec) {
        self.overrides.insert(tenant, spec);
        self.buckets.retain(|(_, t), _| *t != tenant);
    }

    /// Number of (api, tenant) buckets allocated so far
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    fn spec_for(&self, tenant: TenantId) -> RateLimitSpec {
        self.overrides
            .get(&tenant)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| self.default_spec.clone())
    }
}

impl RateLimiter for TenantRateLimiter {
    fn check_and_consume(&self, api: LimitedApi, tenant: TenantId) -> bool {
        let spec = self.spec_for(tenant);
        let bucket = self
            .buckets
            .entry((api, tenant))
            .or_insert_with(|| Mutex::new(Bucket::full(&spec)));
        let allowed = bucket.lock().try_consume(&spec);
        if !allowed {
            trace!(%tenant, %api, "tenant quota exhausted");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        let spec: RateLimitSpec = "1000:1, 30000:60".parse().unwrap();
        assert_eq!(
            spec.bandwidths(),
            &[
                Bandwidth::new(1000, Duration::from_secs(1)),
                Bandwidth::new(30000, Duration::from_secs(60)),
            ]
        );
        assert_eq!(spec.to_string(), "1000:1,30000:60");
    }

    #[test]
    fn test_parse_rejects_malformed_specs() {
        for bad in ["", "100", "abc:1", "10:x", "0:1", "10:0", ","] {
            assert!(
                matches!(
                    bad.parse::<RateLimitSpec>(),
                    Err(ConfigError::RateLimitSpec { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_spec_serde_as_string() {
        let spec: RateLimitSpec = "5:1,100:60".parse().unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"5:1,100:60\"");
        let parsed: RateLimitSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
        assert!(serde_json::from_str::<RateLimitSpec>("\"nope\"").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_exhausts_and_refills() {
        let limiter = TenantRateLimiter::new("3:1".parse().unwrap());
        let tenant = TenantId::random();

        for _ in 0..3 {
            assert!(limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
        }
        assert!(!limiter.check_and_consume(LimitedApi::ReadQueries, tenant));

        // One token every 333ms
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
        assert!(!limiter.check_and_consume(LimitedApi::ReadQueries, tenant));

        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..3 {
            assert!(limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
        }
        assert!(!limiter.check_and_consume(LimitedApi::ReadQueries, tenant));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_bandwidths_must_admit() {
        // Burst of 5 per second, but only 6 per minute
        let limiter = TenantRateLimiter::new("5:1,6:60".parse().unwrap());
        let tenant = TenantId::random();

        let first: usize = (0..10)
            .filter(|_| limiter.check_and_consume(LimitedApi::WriteQueries, tenant))
            .count();
        assert_eq!(first, 5);

        tokio::time::advance(Duration::from_secs(2)).await;
        let second: usize = (0..10)
            .filter(|_| limiter.check_and_consume(LimitedApi::WriteQueries, tenant))
            .count();
        // Minute bucket only had ~1.2 tokens left
        assert_eq!(second, 1);
    }

    #[test]
    fn test_tenants_and_apis_are_isolated() {
        let limiter = TenantRateLimiter::new("1:60".parse().unwrap());
        let a = TenantId::random();
        let b = TenantId::random();

        assert!(limiter.check_and_consume(LimitedApi::ReadQueries, a));
        assert!(!limiter.check_and_consume(LimitedApi::ReadQueries, a));
        assert!(limiter.check_and_consume(LimitedApi::WriteQueries, a));
        assert!(limiter.check_and_consume(LimitedApi::ReadQueries, b));
        assert_eq!(limiter.tracked_keys(), 3);
    }

    #[test]
    fn test_tenant_override() {
        let limiter = TenantRateLimiter::new("1:60".parse().unwrap());
        let vip = TenantId::random();
        assert!(limiter.check_and_consume(LimitedApi::ReadQueries, vip));
        assert!(!limiter.check_and_consume(LimitedApi::ReadQueries, vip));

        limiter.set_tenant_spec(vip, "3:60".parse().unwrap());
        let admitted = (0..5)
            .filter(|_| limiter.check_and_consume(LimitedApi::ReadQueries, vip))
            .count();
        assert_eq!(admitted, 3);
    }
}
