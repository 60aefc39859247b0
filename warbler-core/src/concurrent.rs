use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

type Op = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct QueuedOp {
    op: Op,
    done_tx: Option<oneshot::Sender<()>>,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation queue is full")]
pub struct QueueFull;

/// A bounded FIFO of operations consumed by a single worker task. Modules
/// use one queue each, so module state is only ever touched from one task
/// and handlers read as straight-line code.
pub struct OperationQueue {
    tx: mpsc::Sender<QueuedOp>,
}

impl OperationQueue {
    /// `queue_size` bounds the number of pending operations. When a
    /// `timeout` is given, an operation exceeding it is abandoned and the
    /// next one proceeds.
    pub fn new(queue_size: usize, timeout: Option<Duration>) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedOp>(queue_size);

        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let operation = (queued.op)();
                match timeout {
                    Some(timeout) => {
                        if tokio::time::timeout(timeout, operation).await.is_err() {
                            warn!("queued operation timed out; proceeding with next");
                        }
                    }
                    None => operation.await,
                }
                if let Some(done_tx) = queued.done_tx {
                    let _ = done_tx.send(());
                }
            }
        });

        Self { tx }
    }

    /// Enqueues without blocking. A full queue rejects the operation.
    pub fn enqueue<F, Fut>(&self, op: F) -> Result<(), QueueFull>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queued = QueuedOp {
            op: Box::new(move || Box::pin(op()) as Pin<Box<dyn Future<Output = ()> + Send>>),
            done_tx: None,
        };
        self.tx.try_send(queued).map_err(|_| {
            warn!("operation queue is full; dropping operation");
            QueueFull
        })
    }

    /// Enqueues and waits until the operation (and everything queued before
    /// it) has run.
    pub async fn enqueue_sync<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedOp {
            op: Box::new(move || Box::pin(op()) as Pin<Box<dyn Future<Output = ()> + Send>>),
            done_tx: Some(done_tx),
        };
        if self.tx.send(queued).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn operations_run_in_enqueue_order() {
        let queue = OperationQueue::new(32, None);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..16 {
            let log = log.clone();
            queue
                .enqueue(move || async move {
                    log.lock().unwrap().push(i);
                })
                .unwrap();
        }
        queue.enqueue_sync(|| async {}).await;

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn rejects_when_the_queue_is_full() {
        let queue = OperationQueue::new(4, None);

        // block the worker so subsequent operations stay queued
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        queue
            .enqueue(move || async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .unwrap();
        started_rx.await.unwrap();

        for _ in 0..4 {
            queue.enqueue(|| async {}).unwrap();
        }
        assert_eq!(queue.enqueue(|| async {}), Err(QueueFull));

        let _ = release_tx.send(());
        queue.enqueue_sync(|| async {}).await;
    }

    #[tokio::test]
    async fn sync_waits_for_all_prior_operations() {
        let queue = OperationQueue::new(32, None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = counter.clone();
            queue
                .enqueue(move || async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let observed = Arc::new(AtomicUsize::new(0));
        let counter_in_op = counter.clone();
        let observed_in_op = observed.clone();
        queue
            .enqueue_sync(move || async move {
                observed_in_op.store(counter_in_op.load(Ordering::SeqCst), Ordering::SeqCst);
            })
            .await;

        assert_eq!(observed.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn a_stuck_operation_is_abandoned_after_the_timeout() {
        let queue = OperationQueue::new(8, Some(Duration::from_secs(1)));

        queue
            .enqueue(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_op = ran.clone();
        queue
            .enqueue_sync(move || async move {
                ran_in_op.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
