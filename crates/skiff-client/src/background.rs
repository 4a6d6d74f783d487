//! Fixed-size background worker pool for asynchronous batches.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const QUEUE_CAPACITY: usize = 1024;

/// A pool of worker tasks draining a shared job queue.
///
/// Submitting returns a [`TaskHandle`] the caller may wait on; the handle
/// resolves once the job has run. [`shutdown`](BackgroundPool::shutdown)
/// closes the queue and drains every queued job before returning.
pub struct BackgroundPool {
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Completion handle for a submitted task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task and take its result. `None` means the pool shut
    /// down before the task ran.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}

impl BackgroundPool {
    /// Create a pool with `count` workers; 0 means one per host CPU.
    pub fn new(count: usize) -> Self {
        let count = if count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            count
        };

        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..count)
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(worker, "background worker exited");
                })
            })
            .collect();

        Self {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Submit a task. The returned handle resolves with the task's value;
    /// after shutdown the handle resolves to `None` immediately.
    pub async fn submit<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(future.await);
        });

        let sender = self.queue.lock().expect("queue lock poisoned").clone();
        if let Some(sender) = sender {
            // A send only fails once shutdown dropped the receiver; the
            // oneshot sender is dropped with the job, resolving to None.
            let _ = sender.send(job).await;
        }

        TaskHandle { rx }
    }

    /// Close the queue and wait for the workers to drain every queued job.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().expect("queue lock poisoned").take());
        let workers = std::mem::take(&mut *self.workers.lock().expect("workers lock poisoned"));
        for worker in workers {
            let _ = worker.await;
        }
    }
}
