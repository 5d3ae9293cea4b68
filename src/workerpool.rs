use crate::error::PoolError;
use futures_util::{future::BoxFuture, FutureExt};
use serde::Serialize;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

pub(crate) type Job = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Succeeded,
    Failed(String),
    Panicked(String),
}

/// Resolves once the job has run
#[derive(Debug)]
pub(crate) struct JobHandle {
    id: u64,
    done: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) async fn outcome(self) -> JobOutcome {
        self.done
            .await
            .unwrap_or_else(|_| JobOutcome::Failed("job dropped before it ran".to_string()))
    }
}

struct QueuedJob {
    id: u64,
    job: Job,
    done: oneshot::Sender<JobOutcome>,
}

#[derive(Default, Debug, Serialize)]
pub(crate) struct PoolStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl PoolStats {
    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Relaxed)
    }

    pub(crate) fn succeeded(&self) -> u64 {
        self.succeeded.load(Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Relaxed)
    }

    pub(crate) fn panicked(&self) -> u64 {
        self.panicked.load(Relaxed)
    }
}

/// A fixed number of workers pulling jobs off a bounded queue.
///
/// `submit` waits while the queue is full, it never drops a job. A job that fails or panics is
/// reported through its handle and does not take its worker down. Shutdown stops accepting new
/// jobs, lets the workers drain everything already queued, then waits for them to exit.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    queue_size: usize,
    next_job_id: AtomicU64,
    stats: Arc<PoolStats>,
}

/// 0 means one worker per available CPU
pub(crate) fn resolve_pool_size(requested: usize) -> usize {
    match requested {
        0 => std::thread::available_parallelism().map_or(1, |parallelism| parallelism.get()),
        requested => requested,
    }
}

impl WorkerPool {
    /// Must be called from within a tokio runtime
    pub(crate) fn new(requested_size: usize, queue_size: usize) -> Self {
        let size = resolve_pool_size(requested_size);
        let queue_size = queue_size.max(1);
        let (sender, receiver) = mpsc::channel(queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let stats = Arc::new(PoolStats::default());

        let workers = (0..size)
            .map(|index| tokio::spawn(worker(index, Arc::clone(&receiver), Arc::clone(&stats))))
            .collect();

        log::info!("Worker pool started with {} workers, queue size {}", size, queue_size);

        Self {
            sender: Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(workers),
            size,
            queue_size,
            next_job_id: AtomicU64::new(1),
            stats,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub(crate) fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Queue `job`, waiting for room if the queue is full
    pub(crate) async fn submit(&self, job: Job) -> Result<JobHandle, PoolError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::ShutDown)?;

        let id = self.next_job_id.fetch_add(1, Relaxed);
        let (done_sender, done) = oneshot::channel();

        sender
            .send(QueuedJob {
                id,
                job,
                done: done_sender,
            })
            .await
            .map_err(|_| PoolError::ShutDown)?;

        self.stats.submitted.fetch_add(1, Relaxed);

        Ok(JobHandle { id, done })
    }

    /// Drain then stop. Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_some() {
            log::info!("Worker pool shutting down, draining queued jobs");
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for result in futures_util::future::join_all(workers).await {
            if let Err(err) = result {
                log::error!("Worker exited abnormally: {}", err);
            }
        }
    }
}

async fn worker(index: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>>, stats: Arc<PoolStats>) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(QueuedJob { id, job, done }) = next else {
            log::debug!("Worker {} exiting", index);
            return;
        };

        let outcome = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {
                stats.succeeded.fetch_add(1, Relaxed);
                JobOutcome::Succeeded
            }
            Ok(Err(err)) => {
                stats.failed.fetch_add(1, Relaxed);
                log::debug!("Job {} failed on worker {}: {:#}", id, index, err);
                JobOutcome::Failed(format!("{:#}", err))
            }
            Err(panic) => {
                stats.panicked.fetch_add(1, Relaxed);
                let message = if let Some(message) = panic.downcast_ref::<&str>() {
                    message.to_string()
                } else if let Some(message) = panic.downcast_ref::<String>() {
                    message.clone()
                } else {
                    "unknown panic".to_string()
                };
                log::error!("Job {} panicked on worker {}: {}", id, index, message);
                JobOutcome::Panicked(message)
            }
        };

        // Nobody waiting on the handle is fine
        let _ = done.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, time::Duration};
    use tokio::sync::Notify;

    fn job(future: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static) -> Job {
        future.boxed()
    }

    #[test]
    fn zero_resolves_to_available_parallelism() {
        assert!(resolve_pool_size(0) >= 1);
        assert_eq!(resolve_pool_size(3), 3);
    }

    #[tokio::test]
    async fn runs_jobs_and_reports_outcomes() {
        let pool = WorkerPool::new(2, 8);

        let ok = pool.submit(job(async { Ok(()) })).await.unwrap();
        let failed = pool.submit(job(async { Err(anyhow::anyhow!("agent said no")) })).await.unwrap();

        assert_eq!(ok.outcome().await, JobOutcome::Succeeded);
        assert_eq!(failed.outcome().await, JobOutcome::Failed("agent said no".to_string()));
        assert_eq!(pool.stats().succeeded(), 1);
        assert_eq!(pool.stats().failed(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_pool() {
        let pool = WorkerPool::new(1, 4);

        let panicked = pool
            .submit(job(async { panic!("boom") }))
            .await
            .unwrap();
        assert_eq!(panicked.outcome().await, JobOutcome::Panicked("boom".to_string()));

        // The only worker is still alive
        let after = pool.submit(job(async { Ok(()) })).await.unwrap();
        assert_eq!(after.outcome().await, JobOutcome::Succeeded);
        assert_eq!(pool.stats().panicked(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_blocks_submitter_without_dropping() {
        let pool = Arc::new(WorkerPool::new(1, 2));
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = {
            let started = started.clone();
            let gate = gate.clone();
            let ran = ran.clone();
            job(async move {
                started.notify_one();
                gate.notified().await;
                ran.fetch_add(1, Relaxed);
                Ok(())
            })
        };
        let mut handles = vec![pool.submit(blocker).await.unwrap()];

        // The single worker is now busy, the queue holds 2 more
        started.notified().await;
        for _ in 0..2 {
            let ran = ran.clone();
            handles.push(
                pool.submit(job(async move {
                    ran.fetch_add(1, Relaxed);
                    Ok(())
                }))
                .await
                .unwrap(),
            );
        }

        // Queue full: the next submit waits instead of failing or dropping
        let ran_for_blocked = ran.clone();
        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.submit(job(async move {
                    ran_for_blocked.fetch_add(1, Relaxed);
                    Ok(())
                }))
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished());

        gate.notify_one();
        handles.push(blocked.await.unwrap().unwrap());

        for handle in handles {
            assert_eq!(handle.outcome().await, JobOutcome::Succeeded);
        }
        assert_eq!(ran.load(Relaxed), 4);
        assert_eq!(pool.stats().submitted(), 4);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_is_idempotent() {
        let pool = WorkerPool::new(1, 16);
        let ran = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ran = ran.clone();
            handles.push(
                pool.submit(job(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    ran.fetch_add(1, Relaxed);
                    Ok(())
                }))
                .await
                .unwrap(),
            );
        }

        pool.shutdown().await;
        assert_eq!(ran.load(Relaxed), 10);

        pool.shutdown().await;
        assert_eq!(pool.submit(job(async { Ok(()) })).await.unwrap_err(), PoolError::ShutDown);

        for handle in handles {
            assert_eq!(handle.outcome().await, JobOutcome::Succeeded);
        }
    }
}
