//! Timeout-wrapped execution and completion delivery

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::Inner;
use crate::error::DispatchError;
use crate::stats::Event;
use crate::task::{DispatchResult, DispatchTask, Envelope, Promise};

/// A finished result on its way back to the submitter
pub(crate) struct Completion<O> {
    promise: Promise<O>,
    result: DispatchResult<O>,
}

impl<O> Completion<O> {
    pub(super) fn deliver(self) {
        self.promise.resolve(self.result);
    }
}

/// Run one dispatched task against its remaining budget
///
/// Exactly one of released, failed or timed out is recorded, and the
/// concurrency counter is decremented as soon as the outcome is known. A
/// panic while creating or polling the operation counts as failed. On
/// timeout the operation's future is dropped, cancelling it.
pub(super) async fn run<T: DispatchTask>(
    inner: Arc<Inner<T>>,
    envelope: Envelope<T>,
    budget: Duration,
) {
    let Envelope {
        id,
        tenant,
        task,
        promise,
        ..
    } = envelope;
    let started = Instant::now();

    // Building the future runs implementation code too, so it is guarded
    let execution = AssertUnwindSafe(async move { task.execute().await }).catch_unwind();
    let outcome = tokio::time::timeout(budget, execution).await;
    inner.concurrency.decrement();

    let result = match outcome {
        Ok(Ok(Ok(value))) => {
            inner.stats.record(Event::Released);
            trace!(%id, elapsed = ?started.elapsed(), "task completed");
            Ok(value)
        }
        Ok(Ok(Err(e))) => {
            inner.stats.record(Event::Failed);
            debug!(%id, tenant = ?tenant, error = %e, "task failed");
            Err(DispatchError::ExecutionFailed(e))
        }
        Ok(Err(panic)) => {
            inner.stats.record(Event::Failed);
            let message = panic_message(panic.as_ref());
            error!(%id, tenant = ?tenant, panic = %message, "task panicked");
            Err(DispatchError::ExecutionFailed(
                format!("operation panicked: {message}").into(),
            ))
        }
        Err(_) => {
            inner.stats.record(Event::Failed);
            debug!(%id, tenant = ?tenant, ?budget, "task timed out");
            Err(DispatchError::Timeout { budget })
        }
    };

    inner.complete(Completion { promise, result });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolve completed items until the completion channel closes
pub(super) async fn callback_loop<O: Send + 'static>(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Completion<O>>>>,
) {
    debug!(worker, "callback worker started");
    loop {
        let completion = rx.lock().await.recv().await;
        match completion {
            Some(completion) => completion.deliver(),
            None => break,
        }
    }
    debug!(worker, "callback worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(from_str.as_ref()), "boom");
        let from_string: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(from_string.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_callback_loop_drains_then_exits() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (promise, handle) = crate::task::channel::<u32>(uuid::Uuid::now_v7());
        tx.send(Completion {
            promise,
            result: Ok(5),
        })
        .unwrap_or_else(|_| panic!("receiver alive"));
        drop(tx);

        callback_loop(0, Arc::new(Mutex::new(rx))).await;
        assert_eq!(handle.await.unwrap(), 5);
    }
}
