//! Fixed-size pool of workers executing queued async jobs.
//!
//! Every job receives a child of its worker's cancellation token, so
//! shutting the pool down interrupts running jobs as well as the workers
//! waiting for new ones. Jobs still queued at shutdown are dropped.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runner::TaskRunner;

type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

const JOB_QUEUE_DEPTH: usize = 64;

pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    workers: Vec<TaskRunner>,
}

impl WorkerPool {
    /// Starts `workers` workers sharing one job queue.
    pub fn spawn(workers: usize) -> Self {
        let (jobs, receiver) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                TaskRunner::spawn(CancellationToken::new(), move |token| async move {
                    loop {
                        let job = tokio::select! {
                            _ = token.cancelled() => break,
                            job = async { receiver.lock().await.recv().await } => match job {
                                Some(job) => job,
                                None => break,
                            },
                        };
                        job(token.child_token()).await;
                    }
                    debug!("worker {index} stopped");
                })
            })
            .collect();

        Self { jobs, workers }
    }

    /// Queues a job. Returns `false` once the pool is shutting down.
    pub async fn enqueue<F, Fut>(&self, job: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: Job = Box::new(move |token| Box::pin(job(token)));
        self.jobs.send(boxed).await.is_ok()
    }

    /// Cancels every worker (and through the child tokens every running
    /// job), then joins them all.
    pub async fn shutdown(self) {
        drop(self.jobs);
        for worker in self.workers {
            worker.stop_and_join().await;
        }
    }
}
