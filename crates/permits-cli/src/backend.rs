// Simulated backend calls
//
// Latency and failures are drawn at submission time so every call is
// reproducible from its parameters alone.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use permits::{BoxError, DispatchTask, TenantId, TenantNameResolver};
use rand::Rng;

/// Shape of the simulated load
#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub latency: Duration,
    pub jitter: Duration,
    pub failure_rate: f64,
    pub system_rate: f64,
}

/// One query against the simulated backend
pub struct BackendCall {
    tenant: Option<TenantId>,
    latency: Duration,
    fail: bool,
}

impl BackendCall {
    /// Draw a call for `tenant` from `profile`
    pub fn sample(tenant: TenantId, profile: &LoadProfile) -> Self {
        let mut rng = rand::thread_rng();
        let jitter_ms = profile.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        let tenant = if rng.gen_bool(profile.system_rate) {
            None
        } else {
            Some(tenant)
        };

        Self {
            tenant,
            latency: profile.latency + jitter,
            fail: rng.gen_bool(profile.failure_rate),
        }
    }
}

#[async_trait]
impl DispatchTask for BackendCall {
    type Output = Duration;

    fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    async fn execute(self) -> Result<Duration, BoxError> {
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err("backend rejected query".into());
        }
        Ok(self.latency)
    }
}

/// Fixed set of tenants with readable names
pub struct TenantDirectory {
    names: HashMap<TenantId, String>,
}

impl TenantDirectory {
    pub fn generate(count: usize) -> Self {
        let names = (0..count)
            .map(|i| (TenantId::random(), format!("tenant-{i}")))
            .collect();
        Self { names }
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<_> = self.names.keys().copied().collect();
        tenants.sort_by_key(|t| self.names[t].clone());
        tenants
    }
}

#[async_trait]
impl TenantNameResolver for TenantDirectory {
    async fn tenant_name(&self, tenant: TenantId) -> Result<Option<String>, BoxError> {
        Ok(self.names.get(&tenant).cloned())
    }
}
