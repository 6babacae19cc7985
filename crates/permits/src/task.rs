//! Work items, envelopes and result handles
//!
//! A [`DispatchTask`] is the opaque unit of work. Once admitted it travels
//! through the buffer inside an [`Envelope`] that carries the sending half of
//! a single-assignment channel; the caller holds the receiving half as a
//! [`ResultHandle`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BoxError, DispatchError};
use crate::tenant::TenantId;

/// Result delivered to the submitter
pub type DispatchResult<T> = Result<T, DispatchError>;

/// An operation against the throttled backend
///
/// `execute` is started only after the item has been admitted, buffered and
/// dispatched. If the item's budget runs out first, the returned future is
/// dropped, which is how cancellation reaches the operation.
#[async_trait]
pub trait DispatchTask: Send + 'static {
    /// Value produced on success
    type Output: Send + 'static;

    /// Owner of the work; `None` or the system tenant skips rate limiting
    fn tenant(&self) -> Option<TenantId>;

    /// Run the operation
    async fn execute(self) -> Result<Self::Output, BoxError>;
}

/// Task built from a tenant and an async closure
///
/// # Example
///
/// ```
/// use permits::{FnTask, TenantId};
///
/// let task = FnTask::new(Some(TenantId::random()), || async {
///     Ok::<_, permits::BoxError>(42)
/// });
/// ```
pub struct FnTask<F> {
    tenant: Option<TenantId>,
    op: F,
}

impl<F> FnTask<F> {
    /// Create a task owned by `tenant`
    pub fn new(tenant: Option<TenantId>, op: F) -> Self {
        Self { tenant, op }
    }

    /// Create a system-level task
    pub fn system(op: F) -> Self {
        Self { tenant: None, op }
    }
}

#[async_trait]
impl<F, Fut, T> DispatchTask for FnTask<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    async fn execute(self) -> Result<T, BoxError> {
        (self.op)().await
    }
}

/// Sending half of a result channel
///
/// Resolving consumes the promise, so a value is set at most once.
pub(crate) struct Promise<T> {
    tx: oneshot::Sender<DispatchResult<T>>,
}

impl<T> Promise<T> {
    pub(crate) fn resolve(self, result: DispatchResult<T>) {
        // The submitter may have dropped its handle
        let _ = self.tx.send(result);
    }
}

/// Create a connected promise/handle pair
pub(crate) fn channel<T>(id: Uuid) -> (Promise<T>, ResultHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Promise { tx },
        ResultHandle {
            id,
            rx,
            consumed: false,
        },
    )
}

/// Admitted work waiting in, or leaving, the buffer
pub(crate) struct Envelope<T: DispatchTask> {
    pub(crate) id: Uuid,
    pub(crate) tenant: Option<TenantId>,
    pub(crate) task: T,
    pub(crate) promise: Promise<T::Output>,
    pub(crate) admitted_at: Instant,
}

impl<T: DispatchTask> Envelope<T> {
    pub(crate) fn new(id: Uuid, task: T, promise: Promise<T::Output>) -> Self {
        Self {
            id,
            tenant: task.tenant(),
            task,
            promise,
            admitted_at: Instant::now(),
        }
    }
}

/// Handle to the outcome of a submission
///
/// Awaiting yields the result. [`try_result`](Self::try_result) polls without
/// waiting. If the dispatcher is dropped while the item is still buffered the
/// handle resolves to [`DispatchError::Shutdown`].
#[must_use = "the outcome of a submission is only observable through its handle"]
pub struct ResultHandle<T> {
    id: Uuid,
    rx: oneshot::Receiver<DispatchResult<T>>,
    consumed: bool,
}

impl<T> ResultHandle<T> {
    /// Handle that is already resolved
    pub(crate) fn resolved(id: Uuid, result: DispatchResult<T>) -> Self {
        let (promise, handle) = channel(id);
        promise.resolve(result);
        handle
    }

    /// Correlation id of the submission
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take the result if it is available
    ///
    /// Returns `None` while the item is pending and after the result has
    /// already been taken.
    pub fn try_result(&mut self) -> Option<DispatchResult<T>> {
        if self.consumed {
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.consumed = true;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.consumed = true;
                Some(Err(DispatchError::Shutdown))
            }
        }
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = DispatchResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.consumed = true;
                Poll::Ready(result.unwrap_or(Err(DispatchError::Shutdown)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("id", &self.id)
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolved_handle_yields_result() {
        let handle = ResultHandle::<u32>::resolved(Uuid::now_v7(), Ok(7));
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_try_result_before_and_after_resolution() {
        let (promise, mut handle) = channel::<&str>(Uuid::now_v7());
        assert!(handle.try_result().is_none());

        promise.resolve(Ok("done"));
        assert_eq!(handle.try_result().unwrap().unwrap(), "done");
        // Taken once
        assert!(handle.try_result().is_none());
    }

    #[tokio::test]
    async fn test_dropped_promise_reads_as_shutdown() {
        let (promise, handle) = channel::<()>(Uuid::now_v7());
        drop(promise);
        assert!(matches!(handle.await, Err(DispatchError::Shutdown)));
    }

    #[tokio::test]
    async fn test_fn_task_reports_tenant_and_runs() {
        let tenant = TenantId::random();
        let task = FnTask::new(Some(tenant), || async { Ok::<_, BoxError>("ok") });
        assert_eq!(task.tenant(), Some(tenant));
        assert_eq!(task.execute().await.unwrap(), "ok");

        let system = FnTask::system(|| async { Ok::<_, BoxError>(()) });
        assert!(system.tenant().is_none());
    }

    #[tokio::test]
    async fn test_envelope_captures_tenant() {
        let tenant = TenantId::random();
        let id = Uuid::now_v7();
        let (promise, _handle) = channel(id);
        let task = FnTask::new(Some(tenant), || async { Ok::<_, BoxError>(1u8) });
        let envelope = Envelope::new(id, task, promise);
        assert_eq!(envelope.tenant, Some(tenant));
        assert_eq!(envelope.id, id);
        assert!(envelope.admitted_at <= Instant::now());
    }
}
