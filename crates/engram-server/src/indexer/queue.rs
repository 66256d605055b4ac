// crates/engram-server/src/indexer/queue.rs
// Async indexing job queue with a bounded worker pool
//
// Indexing never blocks a message's routing path: the dispatcher upserts
// the chat message synchronously (so the UUID exists for citations), then
// enqueues here and returns. Timeouts bound each job; timed-out jobs are
// not retried because the message row is already durable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};

use super::{index_chat_message, IndexerContext, MessageJob};

/// Queue capacity.
const QUEUE_DEPTH: usize = 1024;
/// Base timeout in seconds.
const BASE_TIMEOUT: f64 = 8.0;
/// Timeout per estimated chunk in seconds.
const PER_CHUNK_TIMEOUT: f64 = 3.5;
/// Minimum per-job timeout.
const MIN_TIMEOUT: f64 = 15.0;
/// Maximum computed per-job timeout.
const MAX_TIMEOUT: f64 = 300.0;
/// Absolute safety limit enforced by the worker.
const HARD_CAP: f64 = 600.0;
/// Completed-job records retained for status queries.
const MAX_RETAINED_JOBS: usize = 1000;

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Success,
    Timeout,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Timeout => "timeout",
            JobState::Error => "error",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Timeout | JobState::Error)
    }
}

/// Status record for one job, kept for queries after completion.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub message_uuid: String,
    pub estimated_chunks: usize,
    pub computed_timeout: f64,
    pub enqueue_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub chunks_indexed: usize,
    pub error_message: Option<String>,
}

impl JobStatus {
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Dynamic timeout from the chunk estimate, clamped to [15s, 300s].
fn compute_timeout(estimated_chunks: usize) -> f64 {
    (BASE_TIMEOUT + PER_CHUNK_TIMEOUT * estimated_chunks as f64).clamp(MIN_TIMEOUT, MAX_TIMEOUT)
}

struct QueuedJob {
    job_id: String,
    job: MessageJob,
    timeout: f64,
}

/// Bounded FIFO indexing queue with parallel workers.
pub struct IndexingQueue {
    tx: mpsc::Sender<QueuedJob>,
    jobs: Arc<Mutex<HashMap<String, JobStatus>>>,
    shutdown: watch::Sender<bool>,
}

impl IndexingQueue {
    /// Start the queue with `num_workers` worker tasks.
    pub fn start(ctx: Arc<IndexerContext>, num_workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedJob>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let jobs: Arc<Mutex<HashMap<String, JobStatus>>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for worker_id in 0..num_workers.max(1) {
            let rx = rx.clone();
            let jobs = jobs.clone();
            let ctx = ctx.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    let queued = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = shutdown.changed() => None,
                        }
                    };
                    let Some(queued) = queued else { break };
                    process_job(&ctx, &jobs, queued).await;
                }
                tracing::debug!("Index worker {} stopped", worker_id + 1);
            });
        }
        tracing::info!("Started {} indexing workers", num_workers.max(1));

        Self {
            tx,
            jobs,
            shutdown: shutdown_tx,
        }
    }

    /// Stop worker tasks (graceful; in-flight jobs complete).
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Enqueue a message-indexing job. Returns the job id.
    pub async fn enqueue(&self, job: MessageJob) -> crate::Result<String> {
        let estimated_chunks = super::chunking::estimate_chunks(&job.content);
        let timeout = compute_timeout(estimated_chunks);
        let job_id = format!(
            "{}:{}:{}",
            job.chat_id,
            job.message_id,
            uuid::Uuid::new_v4().simple()
        );

        {
            let mut jobs = self.jobs.lock().await;
            jobs.insert(
                job_id.clone(),
                JobStatus {
                    job_id: job_id.clone(),
                    state: JobState::Queued,
                    message_uuid: job.message_uuid.clone(),
                    estimated_chunks,
                    computed_timeout: timeout,
                    enqueue_time: Utc::now(),
                    start_time: None,
                    end_time: None,
                    chunks_indexed: 0,
                    error_message: None,
                },
            );
        }

        self.tx
            .send(QueuedJob {
                job_id: job_id.clone(),
                job,
                timeout,
            })
            .await
            .map_err(|_| crate::EngramError::Other("indexing queue is closed".to_string()))?;

        tracing::info!(
            "Enqueued indexing job {} (chunks~{}, timeout={:.1}s)",
            job_id,
            estimated_chunks,
            timeout
        );
        Ok(job_id)
    }

    /// Get a job's status.
    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    /// Number of retained job records.
    pub async fn tracked_jobs(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

async fn process_job(
    ctx: &IndexerContext,
    jobs: &Arc<Mutex<HashMap<String, JobStatus>>>,
    queued: QueuedJob,
) {
    let QueuedJob { job_id, job, timeout } = queued;
    {
        let mut jobs = jobs.lock().await;
        if let Some(status) = jobs.get_mut(&job_id) {
            status.state = JobState::Running;
            status.start_time = Some(Utc::now());
        }
    }
    tracing::info!(
        "Processing indexing job {} (project={}, timeout={:.1}s)",
        job_id,
        job.project_id,
        timeout
    );

    let effective = timeout.min(HARD_CAP);
    let result = tokio::time::timeout(
        Duration::from_secs_f64(effective),
        index_chat_message(ctx, &job),
    )
    .await;

    let mut jobs_guard = jobs.lock().await;
    if let Some(status) = jobs_guard.get_mut(&job_id) {
        status.end_time = Some(Utc::now());
        match result {
            Ok(Ok(chunks)) => {
                status.state = JobState::Success;
                status.chunks_indexed = chunks;
            }
            Ok(Err(e)) => {
                status.state = JobState::Error;
                status.error_message = Some(e.to_string());
                tracing::error!("Indexing job {} failed: {}", job_id, e);
            }
            Err(_) => {
                // Timed-out jobs are not retried; the message row is
                // already committed so the content is recoverable.
                status.state = JobState::Timeout;
                status.error_message = Some(format!("Job exceeded timeout ({effective:.1}s)"));
                tracing::warn!("Indexing job {} timed out after {:.1}s", job_id, effective);
            }
        }

        tracing::info!(
            job_id = %status.job_id,
            message_uuid = %status.message_uuid,
            role = %job.role,
            estimated_chunks = status.estimated_chunks,
            computed_timeout = status.computed_timeout,
            duration = status.duration_secs().unwrap_or(0.0),
            status = status.state.as_str(),
            error = status.error_message.as_deref().unwrap_or("none"),
            "Indexing job finished"
        );
    }

    // Retention: keep the most recent records, evicting oldest completed
    if jobs_guard.len() > MAX_RETAINED_JOBS {
        let mut completed: Vec<(String, DateTime<Utc>)> = jobs_guard
            .iter()
            .filter(|(_, s)| s.state.is_terminal())
            .map(|(id, s)| (id.clone(), s.enqueue_time))
            .collect();
        completed.sort_by_key(|(_, t)| *t);
        let excess = jobs_guard.len() - MAX_RETAINED_JOBS;
        for (id, _) in completed.into_iter().take(excess) {
            jobs_guard.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::db::ProjectDatabases;
    use crate::embeddings::EmbeddingClient;
    use crate::index::VectorIndex;

    #[test]
    fn test_compute_timeout_clamps() {
        assert_eq!(compute_timeout(1), MIN_TIMEOUT);
        // 8 + 3.5 * 10 = 43
        assert!((compute_timeout(10) - 43.0).abs() < 1e-9);
        assert_eq!(compute_timeout(1000), MAX_TIMEOUT);
    }

    async fn test_queue() -> (IndexingQueue, Arc<IndexerContext>) {
        let ctx = Arc::new(IndexerContext {
            databases: Arc::new(ProjectDatabases::in_memory(ServiceConfig::default())),
            embedder: Arc::new(EmbeddingClient::deterministic(16)),
            index: Arc::new(VectorIndex::new(16)),
        });
        (IndexingQueue::start(ctx.clone(), 2), ctx)
    }

    fn test_job(content: &str) -> MessageJob {
        MessageJob {
            project_id: uuid::Uuid::new_v4(),
            chat_id: "chat-1".to_string(),
            message_id: "m-1".to_string(),
            message_uuid: "uuid-1".to_string(),
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            message_index: 0,
        }
    }

    #[tokio::test]
    async fn test_job_runs_to_success() {
        let (queue, ctx) = test_queue().await;
        let job_id = queue
            .enqueue(test_job("The deployment pipeline now runs the smoke tests first."))
            .await
            .expect("enqueue");

        // Wait for the worker to finish
        let mut state = JobState::Queued;
        for _ in 0..100 {
            if let Some(status) = queue.job_status(&job_id).await {
                state = status.state;
                if state.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, JobState::Success);
        assert_eq!(ctx.index.active_count().await, 1);

        let status = queue.job_status(&job_id).await.expect("status");
        assert_eq!(status.chunks_indexed, 1);
        assert!(status.duration_secs().is_some());
        queue.stop();
    }

    #[tokio::test]
    async fn test_short_content_succeeds_with_zero_chunks() {
        let (queue, ctx) = test_queue().await;
        let job_id = queue.enqueue(test_job("ok")).await.expect("enqueue");
        for _ in 0..100 {
            if let Some(status) = queue.job_status(&job_id).await {
                if status.state.is_terminal() {
                    assert_eq!(status.state, JobState::Success);
                    assert_eq!(status.chunks_indexed, 0);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.index.is_empty().await);
        queue.stop();
    }
}
