use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use super::{StorageBackend, StorageError};
use crate::metrics::WRITE_QUEUE_DEPTH;

type Job = Box<dyn FnOnce(Arc<dyn StorageBackend>) -> BoxFuture<'static, ()> + Send>;

enum Command {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Single-consumer FIFO queue that runs storage writes one at a time.
///
/// Submission is concurrent; execution is strictly serial, in the order the
/// jobs were accepted. Each caller gets its own job's result back. Clone the
/// handle to share it.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Command>,
    pending: Arc<AtomicUsize>,
}

impl WriteQueue {
    /// Spawn the consumer task on the current runtime.
    pub fn spawn(backend: Arc<dyn StorageBackend>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_worker(rx, backend, Arc::clone(&pending)));
        Self { tx, pending }
    }

    /// Queue `op` and wait for its result.
    ///
    /// `op` receives the backend and runs only after every job submitted
    /// before it has completed.
    pub async fn enqueue<T, F, Fut>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<dyn StorageBackend>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StorageError>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |backend| {
            async move {
                let result = op(backend).await;
                // Caller may have given up waiting; the write still happened.
                let _ = reply_tx.send(result);
            }
            .boxed()
        });

        let depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        WRITE_QUEUE_DEPTH.set(depth as i64);

        if self.tx.send(Command::Run(job)).await.is_err() {
            let depth = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
            WRITE_QUEUE_DEPTH.set(depth as i64);
            return Err(StorageError::QueueClosed);
        }

        reply_rx.await.map_err(|_| StorageError::QueueClosed)?
    }

    /// Jobs accepted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs, run everything already queued, then return.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Command>,
    backend: Arc<dyn StorageBackend>,
    pending: Arc<AtomicUsize>,
) {
    tracing::info!(backend = backend.kind().as_str(), "Write queue started");
    let mut acks = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Run(job) => {
                let fut = job(Arc::clone(&backend));
                if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    tracing::error!("Write job panicked");
                }
                let depth = pending.fetch_sub(1, Ordering::SeqCst) - 1;
                WRITE_QUEUE_DEPTH.set(depth as i64);
            }
            Command::Shutdown(ack) => {
                // Keep draining what is already buffered, refuse anything new.
                rx.close();
                acks.push(ack);
            }
        }
    }

    tracing::info!("Write queue drained and stopped");
    for ack in acks {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::storage::SqliteBackend;

    fn backend() -> Arc<dyn StorageBackend> {
        Arc::new(SqliteBackend::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_returns_job_result() {
        let queue = WriteQueue::spawn(backend(), 8);
        let value = queue.enqueue(|_| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_error_is_delivered_to_its_caller_only() {
        let queue = WriteQueue::spawn(backend(), 8);

        let failed = queue
            .enqueue(|_| async { Err::<(), _>(StorageError::Database("boom".to_string())) })
            .await;
        assert!(matches!(failed, Err(StorageError::Database(_))));

        let ok = queue.enqueue(|_| async { Ok("next") }).await.unwrap();
        assert_eq!(ok, "next");
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order_one_at_a_time() {
        let queue = WriteQueue::spawn(backend(), 16);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for i in 0..5u64 {
            let queue = queue.clone();
            let log = Arc::clone(&log);
            // Earlier jobs sleep longer; serial execution still keeps order.
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(move |_| async move {
                        log.lock().unwrap().push(format!("start-{i}"));
                        tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                        log.lock().unwrap().push(format!("end-{i}"));
                        Ok(())
                    })
                    .await
            }));
            // Fix the submission order.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let log = log.lock().unwrap().clone();
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start-{i}"), format!("end-{i}")])
            .collect();
        assert_eq!(log, expected);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let queue = WriteQueue::spawn(backend(), 8);
        let done = Arc::new(AtomicUsize::new(0));

        let slow = {
            let queue = queue.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                queue
                    .enqueue(move |_| async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        queue.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        slow.await.unwrap().unwrap();

        let rejected = queue.enqueue(|_| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(StorageError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_the_worker() {
        let queue = WriteQueue::spawn(backend(), 8);

        let panicked = queue
            .enqueue(|_| async {
                if true {
                    panic!("job exploded");
                }
                Ok(())
            })
            .await;
        assert!(matches!(panicked, Err(StorageError::QueueClosed)));

        let ok = queue.enqueue(|_| async { Ok(1) }).await.unwrap();
        assert_eq!(ok, 1);
    }
}
