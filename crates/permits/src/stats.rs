//! Dispatcher telemetry
//!
//! Counters come in two flavours: interval counters, which are reset every
//! time a snapshot is emitted, and lifetime totals, which never reset. The
//! concurrency and buffer gauges are sampled at snapshot time and are never
//! reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::WorkloadKind;
use crate::error::BoxError;
use crate::tenant::TenantId;

/// Placeholder used when a tenant name cannot be resolved
pub const UNKNOWN_TENANT_NAME: &str = "N/A";

/// A dispatcher state transition worth counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Submitted,
    Launched,
    Released,
    Failed,
    Expired,
    Rejected,
}

/// Counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterValues {
    /// Items admitted into the buffer
    pub submitted: u64,
    /// Items handed to the execution wrapper
    pub launched: u64,
    /// Executions completed successfully
    pub released: u64,
    /// Executions that errored, panicked or timed out
    pub failed: u64,
    /// Items whose budget ran out while buffered
    pub expired: u64,
    /// Submissions refused because the buffer was full
    pub rejected: u64,
    /// Submissions refused by the tenant rate limiter
    pub rate_limited: u64,
}

impl CounterValues {
    /// Check whether every counter is zero
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    launched: AtomicU64,
    released: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
    rate_limited: AtomicU64,
}

impl Counters {
    fn counter(&self, event: Event) -> &AtomicU64 {
        match event {
            Event::Submitted => &self.submitted,
            Event::Launched => &self.launched,
            Event::Released => &self.released,
            Event::Failed => &self.failed,
            Event::Expired => &self.expired,
            Event::Rejected => &self.rejected,
        }
    }

    fn read(&self) -> CounterValues {
        self.collect(|c| c.load(Ordering::Relaxed))
    }

    fn take(&self) -> CounterValues {
        self.collect(|c| c.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, f: impl Fn(&AtomicU64) -> u64) -> CounterValues {
        CounterValues {
            submitted: f(&self.submitted),
            launched: f(&self.launched),
            released: f(&self.released),
            failed: f(&self.failed),
            expired: f(&self.expired),
            rejected: f(&self.rejected),
            rate_limited: f(&self.rate_limited),
        }
    }
}

#[derive(Default)]
struct TenantCounter {
    interval: AtomicU64,
    lifetime: AtomicU64,
}

/// Counters shared by the submission gate, dispatch workers and executions
///
/// Per-tenant rate-limited counters are created on first use and are never
/// removed, so memory grows with the number of distinct tenants that ever
/// hit their limit.
#[derive(Default)]
pub struct DispatchStats {
    interval: Counters,
    lifetime: Counters,
    tenants: DashMap<TenantId, TenantCounter>,
}

impl DispatchStats {
    /// Create empty stats
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: Event) {
        self.interval.counter(event).fetch_add(1, Ordering::Relaxed);
        self.lifetime.counter(event).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self, tenant: TenantId) {
        self.interval.rate_limited.fetch_add(1, Ordering::Relaxed);
        self.lifetime.rate_limited.fetch_add(1, Ordering::Relaxed);
        let counter = self.tenants.entry(tenant).or_default();
        counter.interval.fetch_add(1, Ordering::Relaxed);
        counter.lifetime.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters accumulated since the dispatcher was created
    pub fn totals(&self) -> CounterValues {
        self.lifetime.read()
    }

    /// Counters accumulated since the last snapshot
    pub fn current(&self) -> CounterValues {
        self.interval.read()
    }

    /// Lifetime rate-limited count for one tenant
    pub fn tenant_rate_limited(&self, tenant: TenantId) -> u64 {
        self.tenants
            .get(&tenant)
            .map(|c| c.lifetime.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Take a snapshot, resetting the interval counters
    ///
    /// `concurrency` and `buffered` are the current gauge readings.
    pub fn snapshot_and_reset(
        &self,
        kind: WorkloadKind,
        concurrency: usize,
        buffered: usize,
    ) -> StatsSnapshot {
        let counters = self.interval.take();
        let mut rate_limited_tenants: Vec<TenantRateLimited> = self
            .tenants
            .iter()
            .filter_map(|entry| {
                let count = entry.value().interval.swap(0, Ordering::Relaxed);
                (count > 0).then(|| TenantRateLimited {
                    tenant: *entry.key(),
                    name: None,
                    count,
                })
            })
            .collect();
        rate_limited_tenants.sort_by(|a, b| b.count.cmp(&a.count));

        StatsSnapshot {
            kind,
            taken_at: Utc::now(),
            counters,
            concurrency,
            buffered,
            rate_limited_tenants,
        }
    }
}

/// Rate-limited submissions for one tenant within a snapshot interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRateLimited {
    pub tenant: TenantId,
    /// Display name, if resolution is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub count: u64,
}

/// Telemetry for one snapshot interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub kind: WorkloadKind,
    pub taken_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: CounterValues,
    /// Executions in flight
    pub concurrency: usize,
    /// Items waiting in the buffer
    pub buffered: usize,
    pub rate_limited_tenants: Vec<TenantRateLimited>,
}

impl StatsSnapshot {
    /// Check whether there is nothing to report
    pub fn is_idle(&self) -> bool {
        self.counters.is_zero() && self.concurrency == 0 && self.buffered == 0
    }
}

/// Looks up display names for tenants in stats output
#[async_trait]
pub trait TenantNameResolver: Send + Sync {
    /// Name of `tenant`, or `None` if it is unknown
    async fn tenant_name(&self, tenant: TenantId) -> Result<Option<String>, BoxError>;
}

/// Emits snapshots to the log
pub(crate) struct StatsReporter {
    resolver: Option<Arc<dyn TenantNameResolver>>,
    names: DashMap<TenantId, String>,
}

impl StatsReporter {
    pub(crate) fn new(resolver: Option<Arc<dyn TenantNameResolver>>) -> Self {
        Self {
            resolver,
            names: DashMap::new(),
        }
    }

    /// Take a snapshot and log it unless it is idle
    pub(crate) async fn report(
        &self,
        stats: &DispatchStats,
        kind: WorkloadKind,
        concurrency: usize,
        buffered: usize,
    ) -> Option<StatsSnapshot> {
        let mut snapshot = stats.snapshot_and_reset(kind, concurrency, buffered);
        if snapshot.is_idle() {
            return None;
        }

        if self.resolver.is_some() {
            for entry in &mut snapshot.rate_limited_tenants {
                entry.name = Some(self.resolve(entry.tenant).await);
            }
        }

        let c = &snapshot.counters;
        info!(
            kind = %kind,
            submitted = c.submitted,
            launched = c.launched,
            released = c.released,
            failed = c.failed,
            expired = c.expired,
            rejected = c.rejected,
            rate_limited = c.rate_limited,
            concurrency = snapshot.concurrency,
            buffered = snapshot.buffered,
            "permits stats"
        );
        for entry in &snapshot.rate_limited_tenants {
            info!(
                kind = %kind,
                tenant = %entry.tenant,
                name = entry.name.as_deref().unwrap_or(UNKNOWN_TENANT_NAME),
                count = entry.count,
                "tenant rate limited"
            );
        }

        Some(snapshot)
    }

    async fn resolve(&self, tenant: TenantId) -> String {
        if let Some(name) = self.names.get(&tenant) {
            return name.clone();
        }
        let Some(resolver) = &self.resolver else {
            return UNKNOWN_TENANT_NAME.to_string();
        };
        match resolver.tenant_name(tenant).await {
            Ok(Some(name)) => {
                self.names.insert(tenant, name.clone());
                name
            }
            Ok(None) => UNKNOWN_TENANT_NAME.to_string(),
            Err(e) => {
                debug!(%tenant, error = %e, "failed to resolve tenant name");
                UNKNOWN_TENANT_NAME.to_string()
            }
        }
    }
}
