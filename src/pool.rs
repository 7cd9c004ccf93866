use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed-size worker set behind a bounded queue. Submission awaits while the
/// queue is full, which bounds in-memory work per stage.
pub struct WorkerPool {
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    size: Mutex<usize>,
    inner: Arc<Inner>,
}

struct Inner {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    kill: Semaphore,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(cancel: CancellationToken, workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let pool = Self {
            queue: Mutex::new(Some(tx)),
            size: Mutex::new(0),
            inner: Arc::new(Inner {
                receiver: tokio::sync::Mutex::new(rx),
                kill: Semaphore::new(0),
                cancel,
                tracker: TaskTracker::new(),
            }),
        };
        pool.resize(workers);
        pool
    }

    /// Grows or shrinks the worker set. Shrinking posts one kill permit per
    /// removed worker; a worker consumes it after finishing its current task.
    pub fn resize(&self, workers: usize) {
        let mut size = self.size.lock().unwrap();
        while *size < workers {
            *size += 1;
            self.inner.tracker.spawn(Inner::worker(self.inner.clone()));
        }
        if *size > workers {
            self.inner.kill.add_permits(*size - workers);
            *size = workers;
        }
    }

    /// Enqueues a task, waiting while the queue is full. Returns false once
    /// the pool is closed.
    pub async fn submit(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        let sender = self.queue.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(Box::pin(task)).await.is_ok(),
            None => false,
        }
    }

    /// Closes the queue. Workers drain what is already enqueued and exit.
    pub fn close(&self) {
        self.queue.lock().unwrap().take();
    }

    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    async fn worker(inner: Arc<Inner>) {
        loop {
            let task = {
                let mut receiver = inner.receiver.lock().await;
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    permit = inner.kill.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                        return;
                    }
                    task = receiver.recv() => match task {
                        Some(task) => task,
                        None => return,
                    },
                }
            };
            task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let pool = WorkerPool::new(CancellationToken::new(), 2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            assert!(
                pool.submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
            );
        }
        pool.close();
        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let pool = WorkerPool::new(CancellationToken::new(), 1, 1);
        let gate = Arc::new(Semaphore::new(0));

        // Occupy the single worker until the gate opens.
        let g = gate.clone();
        assert!(
            pool.submit(async move {
                let _ = g.acquire().await;
            })
            .await
        );
        // Fill the queue.
        assert!(pool.submit(async {}).await);
        // The next submit must block until a slot frees up.
        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.submit(async {}));
        assert!(blocked.await.is_err());

        gate.add_permits(1);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), pool.submit(async {}))
                .await
                .is_ok()
        );
        pool.close();
        pool.wait().await;
    }

    #[tokio::test]
    async fn cancellation_stops_workers() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(cancel.clone(), 2, 2);
        cancel.cancel();
        pool.wait().await;
        // Workers are gone; submissions still enqueue but nobody runs them.
        assert!(pool.submit(async {}).await);
    }

    #[tokio::test]
    async fn shrink_retires_workers() {
        let pool = WorkerPool::new(CancellationToken::new(), 4, 4);
        pool.resize(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.close();
        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn submit_after_close_is_rejected() {
        let pool = WorkerPool::new(CancellationToken::new(), 1, 1);
        pool.close();
        assert!(!pool.submit(async {}).await);
        pool.wait().await;
    }
}
