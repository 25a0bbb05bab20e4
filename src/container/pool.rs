//! A fixed set of worker tasks draining one shared queue
// (c) 2025 Ross Younger

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, trace, trace_span, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Base pool size
pub const BASE_WORKERS: usize = 20;
/// Extra workers per interface
pub const WORKERS_PER_INTERFACE: usize = 6;

/// Default pool size for a container running `interfaces` interfaces
#[must_use]
pub fn default_size(interfaces: usize) -> usize {
    BASE_WORKERS + WORKERS_PER_INTERFACE * interfaces
}

/// Runs submitted jobs on a fixed number of tokio tasks.
///
/// Cloning gives another handle on the same pool. [`WorkerPool::submit`] never blocks,
/// so it is safe to call from a network listener.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Job>,
    token: CancellationToken,
    workers: Arc<Mutex<JoinSet<()>>>,
    busy: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    /// Starts `size` workers (at least one)
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (queue, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();
        let busy = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        for n in 0..size {
            let rx = rx.clone();
            let token = token.clone();
            let busy = busy.clone();
            let _ = workers.spawn(
                async move {
                    loop {
                        let job = tokio::select! {
                            () = token.cancelled() => break,
                            j = async { rx.lock().await.recv().await } => match j {
                                Some(j) => j,
                                None => break,
                            },
                        };
                        let _ = busy.fetch_add(1, Ordering::SeqCst);
                        job.await;
                        let _ = busy.fetch_sub(1, Ordering::SeqCst);
                    }
                    trace!("worker exiting");
                }
                .instrument(trace_span!("worker", n)),
            );
        }
        debug!("started {size} workers");
        Self {
            queue,
            token,
            workers: Arc::new(Mutex::new(workers)),
            busy,
            size,
        }
    }

    /// Queues a job. Jobs submitted after [`shutdown`](Self::shutdown) are dropped.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.queue.send(Box::pin(job.in_current_span())).is_err() {
            warn!("worker pool is shut down; job dropped");
        }
    }

    /// Number of workers
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of jobs currently running
    #[must_use]
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Stops the workers. Running jobs are abandoned at their next await point; queued jobs are dropped.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let mut workers = self.workers.lock().await;
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        debug!("worker pool stopped");
    }
}
