//! Per-tenant admission quotas
//!
//! The dispatcher consults a [`RateLimiter`] synchronously for every
//! tenant-bearing submission. The limiter owns and synchronizes its own
//! per-tenant state.
//!
//! - [`AllowAll`] - admits everything (rate limiting disabled)
//! - [`TenantRateLimiter`] - token buckets keyed by API and tenant

mod token_bucket;

pub use token_bucket::{Bandwidth, RateLimitSpec, TenantRateLimiter};

use crate::tenant::{LimitedApi, TenantId};

/// Yes/no quota check for one unit of tenant work
pub trait RateLimiter: Send + Sync {
    /// Consume one unit of `tenant`'s quota for `api`, returning whether it
    /// was available
    fn check_and_consume(&self, api: LimitedApi, tenant: TenantId) -> bool;
}

/// Limiter that never denies
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RateLimiter for AllowAll {
    fn check_and_consume(&self, _api: LimitedApi, _tenant: TenantId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let limiter = AllowAll;
        for _ in 0..1000 {
            assert!(limiter.check_and_consume(LimitedApi::WriteQueries, TenantId::random()));
        }
    }
}
