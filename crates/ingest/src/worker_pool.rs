use futures::future::BoxFuture;
use shared::AppError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_WORKERS: usize = 10;

/// A unit of work submitted to the pool. The closure receives the pool's
/// shared cancellation token; long-running jobs are expected to observe it.
pub type PoolJob = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Bounded-concurrency worker pool. At most N jobs run in parallel and the
/// intake buffer holds 2N submissions; `submit` blocks once the buffer is
/// full. Failures are accumulated and never stop sibling jobs.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<(usize, PoolJob)>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    errors: Arc<Mutex<Vec<(usize, anyhow::Error)>>>,
    next_seq: AtomicUsize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self::build(workers, CancellationToken::new())
    }

    /// A pool whose cancellation token is a child of `parent`: cancelling
    /// the parent aborts this pool's jobs at their next context check, as
    /// `shutdown` would.
    pub fn with_parent(workers: usize, parent: &CancellationToken) -> Self {
        Self::build(workers, parent.child_token())
    }

    fn build(workers: usize, cancel: CancellationToken) -> Self {
        let count = workers.max(1);
        let (tx, rx) = mpsc::channel::<(usize, PoolJob)>(count * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let errors: Arc<Mutex<Vec<(usize, anyhow::Error)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let rx = Arc::clone(&rx);
            let cancel = cancel.clone();
            let errors = Arc::clone(&errors);
            handles.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            job = guard.recv() => job,
                        }
                    };
                    let Some((seq, job)) = next else {
                        break;
                    };
                    debug!(worker_id, seq, "worker picked up job");
                    if let Err(e) = job(cancel.clone()).await {
                        warn!(worker_id, seq, error = %e, "pool job failed");
                        errors.lock().unwrap().push((seq, e));
                    }
                }
                debug!(worker_id, "worker exiting");
            }));
        }

        Self {
            tx: Some(tx),
            workers: handles,
            cancel,
            errors,
            next_seq: AtomicUsize::new(0),
        }
    }

    /// Submit a job. Blocks while the intake buffer is full. Fails
    /// deterministically once `wait` or `shutdown` has been called.
    pub async fn submit(&self, job: PoolJob) -> shared::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(AppError::Internal("worker pool is closed".to_string()));
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        tx.send((seq, job))
            .await
            .map_err(|_| AppError::Internal("worker pool is closed".to_string()))
    }

    /// Close intake and wait for all in-flight jobs to finish.
    pub async fn wait(&mut self) {
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Cancel the shared token (in-flight jobs observing it abort, queued
    /// jobs are dropped), then wait for the workers to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Accumulated job failures in submission order.
    pub fn errors(&self) -> Vec<String> {
        let mut collected: Vec<(usize, String)> = self
            .errors
            .lock()
            .unwrap()
            .iter()
            .map(|(seq, e)| (*seq, e.to_string()))
            .collect();
        collected.sort_by_key(|(seq, _)| *seq);
        collected.into_iter().map(|(_, msg)| msg).collect()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
