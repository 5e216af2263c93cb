//! Coalesces individually submitted jobs into batches for an external
//! executor and fans the results back out to per-job handles.
//!
//! One loop task owns the pending list. Submitters only talk to it through an
//! unbounded command channel, so `submit` never blocks and never races the
//! loop. A batch is cut when the pending count reaches `batch_size`, on an
//! explicit flush or stop, or when no command arrived for `idle_timeout`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Sequence number of a job, unique and increasing per processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Pending count that triggers a cut.
    pub batch_size: usize,
    /// Quiet period after which whatever is pending is cut.
    pub idle_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("processor is closed; job rejected")]
    SubmissionRejected,
    #[error("job {0} was not processed")]
    JobNotProcessed(JobId),
    #[error("batch executor failed: {0}")]
    ExecutorFailed(String),
}

/// Runs one batch. Results may come back in any order and may omit jobs;
/// omitted jobs fail with [`BatchError::JobNotProcessed`].
#[async_trait]
pub trait BatchExecutor<P, R>: Send + Sync {
    async fn execute(&self, batch: Vec<(JobId, P)>) -> anyhow::Result<Vec<(JobId, R)>>;
}

#[async_trait]
impl<P, R, F, Fut> BatchExecutor<P, R> for F
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<(JobId, P)>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<(JobId, R)>>> + Send + 'static,
{
    async fn execute(&self, batch: Vec<(JobId, P)>) -> anyhow::Result<Vec<(JobId, R)>> {
        (self)(batch).await
    }
}

/// Completion handle for one submitted job. Resolves exactly once.
pub struct JobHandle<R> {
    id: JobId,
    rx: oneshot::Receiver<Result<R, BatchError>>,
}

impl<R> JobHandle<R> {
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl<R> Future for JobHandle<R> {
    type Output = Result<R, BatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The loop is gone without answering (runtime shutdown).
            Poll::Ready(Err(_)) => Poll::Ready(Err(BatchError::SubmissionRejected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Job<P, R> {
    id: JobId,
    payload: P,
    reply: oneshot::Sender<Result<R, BatchError>>,
}

enum Command<P, R> {
    NewJob(Job<P, R>),
    /// Explicit flushes carry an ack; idle timeouts do not.
    Flush(Option<oneshot::Sender<()>>),
    Stop,
}

pub struct BatchProcessor<P, R> {
    tx: mpsc::UnboundedSender<Command<P, R>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<P, R> BatchProcessor<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Spawn the processing loop. Must be called inside a tokio runtime.
    pub fn new(config: BatchConfig, executor: impl BatchExecutor<P, R> + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor: Arc<dyn BatchExecutor<P, R>> = Arc::new(executor);
        let task = tokio::spawn(process(rx, executor, config));
        Self {
            tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Queue a job and return its handle immediately.
    pub fn submit(&self, payload: P) -> Result<JobHandle<R>, BatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::SubmissionRejected);
        }
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::NewJob(Job { id, payload, reply }))
            .map_err(|_| BatchError::SubmissionRejected)?;
        Ok(JobHandle { id, rx })
    }

    /// Cut whatever is pending, even below the size threshold, and wait for
    /// that batch to finish.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(Some(ack))).is_ok() {
            let _ = done.await;
        }
    }

    /// Close for submission, run the remaining jobs and wait for the loop to
    /// exit. Safe to call more than once.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.tx.send(Command::Stop);
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "batch processor loop ended abnormally");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn process<P, R>(
    mut rx: mpsc::UnboundedReceiver<Command<P, R>>,
    executor: Arc<dyn BatchExecutor<P, R>>,
    config: BatchConfig,
) where
    P: Send + 'static,
    R: Send + 'static,
{
    let batch_size = config.batch_size.max(1);
    let mut pending: Vec<Job<P, R>> = Vec::new();

    loop {
        let command = match tokio::time::timeout(config.idle_timeout, rx.recv()).await {
            Ok(Some(command)) => command,
            // Every processor handle was dropped.
            Ok(None) => Command::Stop,
            Err(_) => Command::Flush(None),
        };

        match command {
            Command::NewJob(job) => {
                pending.push(job);
                if pending.len() >= batch_size {
                    run_batch(executor.as_ref(), std::mem::take(&mut pending)).await;
                }
            }
            Command::Flush(ack) => {
                run_batch(executor.as_ref(), std::mem::take(&mut pending)).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::Stop => {
                run_batch(executor.as_ref(), std::mem::take(&mut pending)).await;
                break;
            }
        }
    }

    // Submissions that raced `stop()`.
    rx.close();
    let mut rejected = 0usize;
    while let Ok(command) = rx.try_recv() {
        match command {
            Command::NewJob(job) => {
                rejected += 1;
                let _ = job.reply.send(Err(BatchError::SubmissionRejected));
            }
            Command::Flush(Some(ack)) => {
                let _ = ack.send(());
            }
            Command::Flush(None) | Command::Stop => {}
        }
    }
    if rejected > 0 {
        warn!(rejected, "jobs submitted after stop were rejected");
    }
    debug!("batch processor stopped");
}

async fn run_batch<P, R>(executor: &dyn BatchExecutor<P, R>, jobs: Vec<Job<P, R>>) {
    if jobs.is_empty() {
        trace!("flush ignored, nothing pending");
        return;
    }
    let size = jobs.len();
    debug!(jobs = size, "running batch");

    let mut replies = HashMap::with_capacity(size);
    let batch: Vec<(JobId, P)> = jobs
        .into_iter()
        .map(|job| {
            replies.insert(job.id, job.reply);
            (job.id, job.payload)
        })
        .collect();

    let outcome = AssertUnwindSafe(executor.execute(batch)).catch_unwind().await;
    let results = match outcome {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => {
            error!(jobs = size, error = %e, "batch executor failed");
            fail_all(replies, &format!("{e:#}"));
            return;
        }
        Err(panic) => {
            let msg = panic_message(&panic);
            error!(jobs = size, panic = %msg, "batch executor panicked");
            fail_all(replies, &msg);
            return;
        }
    };

    for (id, result) in results {
        match replies.remove(&id) {
            Some(reply) => {
                let _ = reply.send(Ok(result));
            }
            None => warn!(job_id = %id, "executor returned an unknown or duplicate job id"),
        }
    }
    if !replies.is_empty() {
        warn!(missing = replies.len(), jobs = size, "executor omitted jobs");
    }
    for (id, reply) in replies {
        let _ = reply.send(Err(BatchError::JobNotProcessed(id)));
    }
}

fn fail_all<R>(replies: HashMap<JobId, oneshot::Sender<Result<R, BatchError>>>, msg: &str) {
    for (_, reply) in replies {
        let _ = reply.send(Err(BatchError::ExecutorFailed(msg.to_string())));
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
