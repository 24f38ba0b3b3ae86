//! Process-wide FIFO of write+rebuild operations.
//!
//! Operations run one at a time, in submission order, on a single worker
//! task. A failing or panicking operation resolves its own caller and the
//! queue moves on.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::QueueError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct AuthoringQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl AuthoringQueue {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("authoring queue worker stopped");
        });
        Self {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Append `op` to the chain. The op is queued before this returns; the
    /// returned future resolves with the op's output once it has run.
    pub fn enqueue<F, T>(&self, op: F) -> impl Future<Output = Result<T, QueueError>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);

        let job: Job = Box::pin(async move {
            let result = AssertUnwindSafe(op).catch_unwind().await;
            pending.fetch_sub(1, Ordering::SeqCst);
            let outcome = result.map_err(|panic| {
                let msg = panic_message(&panic);
                error!(panic = %msg, "queued operation panicked");
                QueueError::Panicked(msg)
            });
            let _ = done_tx.send(outcome);
        });

        let sent = self.tx.send(job).is_ok();
        if !sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }

        async move {
            if !sent {
                return Err(QueueError::Closed);
            }
            done_rx.await.map_err(|_| QueueError::Closed)?
        }
    }

    /// Operations submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn runs_in_submission_order_one_at_a_time() {
        let queue = AuthoringQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut waits = Vec::new();
        for n in 0..5u64 {
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            waits.push(queue.enqueue(async move {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                log.lock().push(format!("start {n}"));
                tokio::time::sleep(Duration::from_millis(5 - n)).await;
                log.lock().push(format!("end {n}"));
                running.fetch_sub(1, Ordering::SeqCst);
                n
            }));
        }

        for (n, wait) in waits.into_iter().enumerate() {
            assert_eq!(wait.await.unwrap(), n as u64);
        }

        let expected: Vec<String> = (0..5)
            .flat_map(|n| [format!("start {n}"), format!("end {n}")])
            .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test]
    async fn failure_does_not_block_next() {
        let queue = AuthoringQueue::new();
        let first = queue.enqueue(async { Err::<(), &str>("boom") });
        let second = queue.enqueue(async { Ok::<u32, &str>(2) });
        assert_eq!(first.await.unwrap(), Err("boom"));
        assert_eq!(second.await.unwrap(), Ok(2));
    }

    #[tokio::test]
    async fn panic_does_not_block_next() {
        let queue = AuthoringQueue::new();
        let first = queue.enqueue(async {
            if true {
                panic!("op exploded");
            }
            0u32
        });
        let second = queue.enqueue(async { 7 });

        let err = first.await.unwrap_err();
        assert_eq!(err, QueueError::Panicked("op exploded".into()));
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn queued_before_awaited() {
        let queue = AuthoringQueue::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        let fut = queue.enqueue(async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        fut.await.unwrap();
    }
}
