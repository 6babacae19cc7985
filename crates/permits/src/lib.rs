//! # Permits
//!
//! Admission control and bounded dispatch in front of a backend that must
//! not be overwhelmed by bursts of asynchronous work from many tenants.
//!
//! ## Features
//!
//! - **Per-tenant rate limiting**: submissions are checked against a tenant quota before admission
//! - **Bounded buffer**: admitted work waits in a fixed-capacity FIFO; a full buffer rejects immediately
//! - **Soft concurrency limit**: dispatch workers release work only while in-flight executions are below the limit
//! - **End-to-end budgets**: each item must finish within `max_wait_time` of admission, buffer wait included
//! - **Telemetry**: periodic snapshots of counters and gauges through `tracing`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Submission gate                          │
//! │  (tenant rate check, non-blocking buffer insert)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BoundedBuffer                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Dispatch workers (N)                         │
//! │  (concurrency check, budget check, launch with timeout)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use permits::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatcherConfig::new(WorkloadKind::Read).with_concurrency_limit(8);
//! let dispatcher = BufferedDispatcher::from_config(config)?;
//! dispatcher.start()?;
//!
//! let tenant = TenantId::random();
//! let handle = dispatcher.submit(FnTask::new(Some(tenant), || async {
//!     Ok::<_, BoxError>("row")
//! }));
//! assert_eq!(handle.await?, "row");
//!
//! dispatcher.stop().await?;
//! # Ok(())
//! # }
//! ```

mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod stats;
pub mod task;
pub mod tenant;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{DispatcherConfig, RateLimitConfig, WorkloadKind};
    pub use crate::dispatcher::{BufferedDispatcher, DispatcherStatus};
    pub use crate::error::{BoxError, ConfigError, DispatchError, DispatcherError};
    pub use crate::limiter::{AllowAll, RateLimitSpec, RateLimiter, TenantRateLimiter};
    pub use crate::stats::{StatsSnapshot, TenantNameResolver};
    pub use crate::task::{DispatchTask, FnTask, ResultHandle};
    pub use crate::tenant::{LimitedApi, TenantId};
}

// Re-export key types at crate root
pub use config::{DispatcherConfig, RateLimitConfig, WorkloadKind};
pub use dispatcher::{BufferedDispatcher, DispatcherStatus};
pub use error::{BoxError, ConfigError, DispatchError, DispatcherError};
pub use limiter::{AllowAll, RateLimitSpec, RateLimiter, TenantRateLimiter};
pub use stats::{CounterValues, DispatchStats, StatsSnapshot, TenantNameResolver, TenantRateLimited};
pub use task::{DispatchResult, DispatchTask, FnTask, ResultHandle};
pub use tenant::{LimitedApi, TenantId};
