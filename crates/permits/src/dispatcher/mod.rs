//! Buffered, rate-limited dispatcher
//!
//! # Architecture
//!
//! ```text
//! submit(task)
//!     │  tenant rate check ──────────────► RateLimited
//!     ▼
//! ┌──────────────────────────────┐
//! │        BoundedBuffer         │ ──────► BufferFull
//! └──────────────────────────────┘
//!     │  N dispatch workers (read counter, maybe consume)
//!     │  budget left? ───────────────────► Expired
//!     ▼
//! ┌──────────────────────────────┐
//! │  execution (timeout-wrapped) │ ──────► Timeout / ExecutionFailed
//! └──────────────────────────────┘
//!     │  completion message
//!     ▼
//! ┌──────────────────────────────┐
//! │       callback workers       │ ──────► ResultHandle resolved
//! └──────────────────────────────┘
//! ```
//!
//! The concurrency limit is soft. Each worker reads the in-flight counter
//! and only then waits for an item, so with `N` workers the counter can
//! reach `concurrency_limit + N - 1`.

mod execution;
mod worker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use self::execution::Completion;
use crate::buffer::BoundedBuffer;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatcherError};
use crate::limiter::{AllowAll, RateLimiter, TenantRateLimiter};
use crate::stats::{DispatchStats, Event, StatsReporter, StatsSnapshot, TenantNameResolver};
use crate::task::{self, DispatchTask, Envelope, ResultHandle};

/// Dispatcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherStatus {
    /// Created but not started; submissions are buffered
    Created,
    /// Workers are dispatching
    Running,
    /// `stop` is waiting for in-flight executions
    Draining,
    /// Stopped for good
    Stopped,
}

/// Number of dispatched but not yet completed executions
///
/// Incremented right before an execution is launched and decremented as soon
/// as it completes, fails or times out.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyCounter(AtomicUsize);

impl ConcurrencyCounter {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "concurrency counter underflow");
    }
}

/// State shared by the submission gate, workers and executions
pub(crate) struct Inner<T: DispatchTask> {
    config: DispatcherConfig,
    buffer: BoundedBuffer<Envelope<T>>,
    limiter: Arc<dyn RateLimiter>,
    stats: Arc<DispatchStats>,
    concurrency: ConcurrencyCounter,
    executions: TaskTracker,
    completions: RwLock<Option<mpsc::UnboundedSender<Completion<T::Output>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: DispatchTask> Inner<T> {
    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Expire or launch an envelope taken from the buffer
    fn dispatch(self: &Arc<Self>, envelope: Envelope<T>) {
        let waited = envelope.admitted_at.elapsed();
        let remaining = self
            .config
            .max_wait_time
            .checked_sub(waited)
            .filter(|r| !r.is_zero());

        let Some(remaining) = remaining else {
            self.stats.record(Event::Expired);
            debug!(id = %envelope.id, ?waited, "task expired before dispatch");
            envelope
                .promise
                .resolve(Err(DispatchError::Expired { waited }));
            return;
        };

        self.concurrency.increment();
        self.stats.record(Event::Launched);
        self.executions
            .spawn(execution::run(Arc::clone(self), envelope, remaining));
    }

    /// Hand a finished result to the callback workers
    ///
    /// Once the callback pool has shut down, results are delivered inline.
    fn complete(&self, completion: Completion<T::Output>) {
        let completion = match self.completions.read().as_ref() {
            Some(tx) => match tx.send(completion) {
                Ok(()) => return,
                Err(mpsc::error::SendError(completion)) => completion,
            },
            None => completion,
        };
        completion.deliver();
    }
}

#[derive(Default)]
struct Workers {
    dispatch: Vec<JoinHandle<()>>,
    callbacks: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

/// Admission-controlled dispatcher for one workload kind
///
/// # Example
///
/// ```ignore
/// use permits::prelude::*;
///
/// let config = DispatcherConfig::new(WorkloadKind::Read)
///     .with_concurrency_limit(32)
///     .with_rate_limits("100:1".parse()?);
/// let dispatcher = BufferedDispatcher::from_config(config)?;
/// dispatcher.start()?;
///
/// let handle = dispatcher.submit(FnTask::new(Some(tenant), move || async move {
///     backend.query(sql).await.map_err(Into::into)
/// }));
/// let rows = handle.await?;
///
/// dispatcher.stop().await?;
/// ```
pub struct BufferedDispatcher<T: DispatchTask> {
    inner: Arc<Inner<T>>,
    reporter: Arc<StatsReporter>,
    status: RwLock<DispatcherStatus>,
    drained: watch::Sender<bool>,
    callback_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Completion<T::Output>>>>,
    workers: Mutex<Workers>,
}

impl<T: DispatchTask> BufferedDispatcher<T> {
    /// Create a dispatcher that consults `limiter` for tenant submissions
    pub fn new(
        config: DispatcherConfig,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self, DispatcherError> {
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            buffer: BoundedBuffer::new(config.buffer_capacity),
            limiter,
            stats: Arc::new(DispatchStats::new()),
            concurrency: ConcurrencyCounter::default(),
            executions: TaskTracker::new(),
            completions: RwLock::new(Some(completions_tx)),
            shutdown_tx,
            config,
        });

        Ok(Self {
            inner,
            reporter: Arc::new(StatsReporter::new(None)),
            status: RwLock::new(DispatcherStatus::Created),
            drained: watch::channel(false).0,
            callback_rx: Arc::new(tokio::sync::Mutex::new(completions_rx)),
            workers: Mutex::new(Workers::default()),
        })
    }

    /// Create a dispatcher whose limiter follows `config.rate_limits`
    pub fn from_config(config: DispatcherConfig) -> Result<Self, DispatcherError> {
        let limiter: Arc<dyn RateLimiter> = if config.rate_limits.enabled {
            Arc::new(TenantRateLimiter::new(config.rate_limits.spec.clone()))
        } else {
            Arc::new(AllowAll)
        };
        Self::new(config, limiter)
    }

    /// Resolve tenant names in stats output
    ///
    /// Only used when `print_tenant_names` is enabled.
    pub fn with_tenant_names(mut self, resolver: Arc<dyn TenantNameResolver>) -> Self {
        if self.inner.config.print_tenant_names {
            self.reporter = Arc::new(StatsReporter::new(Some(resolver)));
        }
        self
    }

    /// Submit a task
    ///
    /// Never waits: rejections resolve the returned handle immediately.
    pub fn submit(&self, task: T) -> ResultHandle<T::Output> {
        let id = Uuid::now_v7();
        if self.inner.is_shut_down() {
            return ResultHandle::resolved(id, Err(DispatchError::Shutdown));
        }

        match task.tenant() {
            Some(tenant) if !tenant.is_system() => {
                let api = self.inner.config.kind.limited_api();
                if !self.inner.limiter.check_and_consume(api, tenant) {
                    self.inner.stats.record_rate_limited(tenant);
                    debug!(%id, %tenant, %api, "tenant rate limit exceeded");
                    return ResultHandle::resolved(id, Err(DispatchError::RateLimited { tenant }));
                }
            }
            _ => debug!(%id, "system task admitted without rate limit check"),
        }

        let (promise, handle) = task::channel(id);
        match self.inner.buffer.try_push(Envelope::new(id, task, promise)) {
            Ok(()) => self.inner.stats.record(Event::Submitted),
            Err(envelope) => {
                self.inner.stats.record(Event::Rejected);
                let capacity = self.inner.buffer.capacity();
                debug!(%id, capacity, "buffer full, task rejected");
                envelope
                    .promise
                    .resolve(Err(DispatchError::BufferFull { capacity }));
            }
        }
        handle
    }

    /// Start the dispatch workers, callback workers and stats reporter
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(kind = %self.inner.config.kind))]
    pub fn start(&self) -> Result<(), DispatcherError> {
        {
            let mut status = self.status.write();
            match *status {
                DispatcherStatus::Created => *status = DispatcherStatus::Running,
                DispatcherStatus::Running | DispatcherStatus::Draining => {
                    return Err(DispatcherError::AlreadyRunning)
                }
                DispatcherStatus::Stopped => return Err(DispatcherError::Terminated),
            }
        }

        let config = &self.inner.config;
        info!(
            buffer_capacity = config.buffer_capacity,
            concurrency_limit = config.concurrency_limit,
            max_wait_time_ms = config.max_wait_time.as_millis() as u64,
            dispatch_workers = config.dispatch_workers,
            callback_workers = config.callback_workers,
            rate_limits = config.rate_limits.enabled,
            "Starting dispatcher"
        );

        let mut workers = self.workers.lock();
        for worker in 0..config.dispatch_workers {
            workers.dispatch.push(tokio::spawn(worker::dispatch_loop(
                worker,
                Arc::clone(&self.inner),
                self.inner.shutdown_tx.subscribe(),
            )));
        }
        for worker in 0..config.callback_workers {
            workers.callbacks.push(tokio::spawn(execution::callback_loop(
                worker,
                Arc::clone(&self.callback_rx),
            )));
        }
        workers.reporter = Some(tokio::spawn(worker::report_loop(
            Arc::clone(&self.inner),
            Arc::clone(&self.reporter),
            self.inner.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Stop dispatching and drain in-flight work
    ///
    /// Items still in the buffer are left unresolved for as long as the
    /// dispatcher lives; dropping it resolves their handles with
    /// [`DispatchError::Shutdown`].
    ///
    /// Calls made while another `stop` is draining wait for it to finish and
    /// return `Ok`; only the first caller reports a shutdown timeout.
    #[instrument(skip(self), fields(kind = %self.inner.config.kind))]
    pub async fn stop(&self) -> Result<(), DispatcherError> {
        let already_draining = {
            let mut status = self.status.write();
            match *status {
                DispatcherStatus::Stopped => return Ok(()),
                DispatcherStatus::Draining => true,
                DispatcherStatus::Created | DispatcherStatus::Running => {
                    *status = DispatcherStatus::Draining;
                    false
                }
            }
        };
        if already_draining {
            // The sender lives in self, so this only ends once drained
            let _ = self.drained.subscribe().wait_for(|done| *done).await;
            return Ok(());
        }

        info!(
            in_flight = self.inner.concurrency.get(),
            buffered = self.inner.buffer.len(),
            "Stopping dispatcher"
        );
        self.inner.shutdown_tx.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers.dispatch {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch worker terminated abnormally");
            }
        }
        if let Some(handle) = workers.reporter {
            let _ = handle.await;
        }

        self.inner.executions.close();
        let drained = tokio::time::timeout(
            self.inner.config.shutdown_timeout,
            self.inner.executions.wait(),
        )
        .await
        .is_ok();
        let in_flight = self.inner.executions.len();
        if !drained {
            warn!(in_flight, "shutdown timeout reached with executions in flight");
        }

        // Closing the channel lets callback workers drain and exit; later
        // completions are delivered inline
        self.inner.completions.write().take();
        for handle in workers.callbacks {
            if let Err(e) = handle.await {
                warn!(error = %e, "callback worker terminated abnormally");
            }
        }

        self.flush_stats().await;
        *self.status.write() = DispatcherStatus::Stopped;
        self.drained.send_replace(true);
        info!("Dispatcher stopped");

        if drained {
            Ok(())
        } else {
            Err(DispatcherError::ShutdownTimeout { in_flight })
        }
    }

    /// Emit a stats snapshot now, resetting the interval counters
    ///
    /// Returns `None` if there was nothing to report.
    pub async fn flush_stats(&self) -> Option<StatsSnapshot> {
        self.reporter
            .report(
                &self.inner.stats,
                self.inner.config.kind,
                self.inner.concurrency.get(),
                self.inner.buffer.len(),
            )
            .await
    }

    /// Current lifecycle state
    pub fn status(&self) -> DispatcherStatus {
        *self.status.read()
    }

    /// Executions currently in flight
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.get()
    }

    /// Items currently waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Telemetry counters
    pub fn stats(&self) -> &DispatchStats {
        &self.inner.stats
    }

    /// Configuration in effect
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }
}

impl<T: DispatchTask> Drop for BufferedDispatcher<T> {
    fn drop(&mut self) {
        // Workers hold the shared state; once they exit, buffered envelopes
        // are dropped and callback workers see the channel close
        self.inner.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_counter() {
        let counter = ConcurrencyCounter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
        counter.decrement();
        assert_eq!(counter.get(), 1);
    }

    type NoopTask = crate::FnTask<fn() -> std::future::Ready<Result<(), crate::BoxError>>>;

    #[test]
    fn test_rejects_invalid_config() {
        let config = DispatcherConfig::default().with_concurrency_limit(0);
        let result = BufferedDispatcher::<NoopTask>::from_config(config);
        assert!(matches!(result, Err(DispatcherError::Config(_))));

        let config = DispatcherConfig::default().with_buffer_capacity(usize::MAX);
        let result = BufferedDispatcher::<NoopTask>::from_config(config);
        assert!(matches!(result, Err(DispatcherError::Config(_))));
    }
}
