use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertSink, LogAlertSink, Severity};
use crate::clock::{Clock, SystemClock};
use crate::handler::{HandlerOutcome, HandlerRegistry, JobError, NewJob};
use crate::job::{DrainOutcome, Job, JobId, JobStatus, JobType, QueueStats};
use crate::retry::{calculate_retry_delay, policy_for, should_retry, RetryContext};

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent background workers started by `start()`. Priority order
    /// is the admission rule regardless of how many run.
    pub workers: usize,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("No handler registered for job type: {0}")]
    HandlerNotRegistered(JobType),
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    pub priority: i32,
    /// Schedule the first run this far in the future.
    pub delay: Option<Duration>,
}

impl EnqueueOpts {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

struct QueueInner {
    jobs: HashMap<JobId, Job>,
    retry: HashMap<JobId, RetryContext>,
    seq: u64,
}

struct WorkerState {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

enum Dispatch {
    Completed,
    Failed,
    Retried,
}

/// In-memory priority job queue.
///
/// Jobs live in a single map guarded by a mutex; the lock is only held for
/// bookkeeping, never while a handler is in flight, so stats reads and
/// `clear` stay safe during a drain.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    handlers: Arc<HandlerRegistry>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    workers: Mutex<Option<WorkerState>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                retry: HashMap::new(),
                seq: 0,
            }),
            handlers: Arc::new(HandlerRegistry::new()),
            alerts: Arc::new(LogAlertSink),
            clock: Arc::new(SystemClock),
            config: QueueConfig::default(),
            workers: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Create a pending job and insert it into the ordered set. Never
    /// blocks; fails fast when the type has no registered handler.
    pub fn enqueue(
        &self,
        job_type: JobType,
        payload: Value,
        opts: EnqueueOpts,
    ) -> Result<Job, QueueError> {
        if !self.handlers.has_handler(job_type) {
            return Err(QueueError::HandlerNotRegistered(job_type));
        }

        let now = self.clock.now();
        let mut job = Job::new(job_type, payload).with_priority(opts.priority);
        job.created_at = now;
        job.updated_at = now;
        if let Some(delay) = opts.delay {
            job.next_run_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        }

        let mut inner = self.lock_inner();
        inner.seq += 1;
        job.seq = inner.seq;
        inner.jobs.insert(job.id.clone(), job.clone());

        debug!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "Job enqueued");
        Ok(job)
    }

    /// Process ready jobs until none remain, including jobs enqueued by
    /// handlers during this same drain.
    pub async fn process_all(&self) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        while let Some(dispatch) = self.process_one().await {
            match dispatch {
                Dispatch::Completed => outcome.completed += 1,
                Dispatch::Failed => outcome.failed += 1,
                Dispatch::Retried => {}
            }
        }
        outcome
    }

    /// Claim and run the best-ordered ready job, if any.
    async fn process_one(&self) -> Option<Dispatch> {
        let job = self.claim_next()?;
        debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "Processing job");

        match self.handlers.execute(&job).await {
            Ok(outcome) => {
                self.record_success(&job, outcome);
                Some(Dispatch::Completed)
            }
            Err(JobError::HandlerNotFound(job_type)) => {
                // Registration was checked at enqueue time; reaching this
                // means the registry changed underneath us. Fail loudly.
                self.record_terminal_failure(
                    &job,
                    format!("No handler registered for job type: {}", job_type),
                    "handler missing at dispatch time".to_string(),
                )
                .await;
                Some(Dispatch::Failed)
            }
            Err(JobError::Execution(err)) => {
                let message = err.to_string();
                let policy = policy_for(job.job_type);
                let decision = should_retry(policy, &message, job.attempts);

                if decision.retry {
                    let delay_ms = calculate_retry_delay(policy, job.attempts);
                    self.record_retry(&job, message, delay_ms, &decision.reason);
                    Some(Dispatch::Retried)
                } else {
                    self.record_terminal_failure(&job, message, decision.reason).await;
                    Some(Dispatch::Failed)
                }
            }
        }
    }

    /// Select the highest-priority ready job and mark it running.
    /// Exclusive per job id: a Running job is invisible to other claims.
    fn claim_next(&self) -> Option<Job> {
        let now = self.clock.now();
        let mut inner = self.lock_inner();

        let id = inner
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| j.order_key())
            .map(|j| j.id.clone())?;

        let job = inner.jobs.get_mut(&id)?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.updated_at = now;
        Some(job.clone())
    }

    fn record_success(&self, job: &Job, outcome: HandlerOutcome) {
        let next_jobs = {
            let mut inner = self.lock_inner();
            if let Some(stored) = inner.jobs.get_mut(&job.id) {
                stored.status = JobStatus::Completed;
                stored.result = Some(outcome.result);
                stored.next_run_at = None;
                stored.updated_at = self.clock.now();
            }
            inner.retry.remove(&job.id);
            outcome.next_jobs
        };

        info!(job_id = %job.id, job_type = %job.job_type, "Job succeeded");

        // Chained jobs are admitted only after the success is recorded.
        for next in next_jobs {
            self.enqueue_chained(&job.id, next);
        }
    }

    fn enqueue_chained(&self, parent: &JobId, next: NewJob) {
        match self.enqueue(next.job_type, next.payload, EnqueueOpts::priority(next.priority)) {
            Ok(chained) => {
                debug!(job_id = %chained.id, parent_id = %parent, job_type = %chained.job_type, "Chained job enqueued")
            }
            Err(e) => {
                error!(parent_id = %parent, error = %e, "Failed to enqueue chained job")
            }
        }
    }

    fn record_retry(&self, job: &Job, message: String, delay_ms: u64, reason: &str) {
        let now = self.clock.now();
        let next_run_at = now + chrono::Duration::milliseconds(delay_ms as i64);
        let mut inner = self.lock_inner();

        if let Some(stored) = inner.jobs.get_mut(&job.id) {
            stored.status = JobStatus::Pending;
            stored.next_run_at = Some(next_run_at);
            stored.last_error = Some(message.clone());
            stored.updated_at = now;
        }

        let ctx = RetryContext {
            job_id: job.id.clone(),
            job_type: job.job_type,
            attempt: job.attempts,
            last_error: message.clone(),
            next_retry_at: Some(next_run_at),
            policy: *policy_for(job.job_type),
        };
        inner.retry.insert(job.id.clone(), ctx);

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            delay_ms = delay_ms,
            reason = reason,
            error = %message,
            "Job failed, retry scheduled"
        );
    }

    async fn record_terminal_failure(&self, job: &Job, message: String, reason: String) {
        {
            let mut inner = self.lock_inner();
            if let Some(stored) = inner.jobs.get_mut(&job.id) {
                stored.status = JobStatus::Failed;
                stored.last_error = Some(message.clone());
                stored.updated_at = self.clock.now();
            }
            inner.retry.remove(&job.id);
        }

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            reason = %reason,
            error = %message,
            "Job failed permanently"
        );

        self.alerts
            .notify(
                "job_failed",
                Severity::Error,
                &format!("{} job failed permanently", job.job_type),
                &format!("job {} after {} attempt(s): {} ({})", job.id, job.attempts, message, reason),
            )
            .await;
    }

    /// Start background polling workers. Calling again while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(self.config.workers.max(1));
        for _ in 0..self.config.workers.max(1) {
            let queue = Arc::clone(self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                queue.worker_loop(token).await;
            }));
        }

        *workers = Some(WorkerState { shutdown, handles });
        info!(workers = self.config.workers.max(1), "Queue workers started");
    }

    /// Stop background workers. Idempotent; leaves no dangling tasks. Does
    /// not abort a handler already executing: the worker finishes its
    /// current job before observing the cancellation.
    pub async fn stop(&self) {
        let state = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.take()
        };

        let Some(state) = state else { return };
        state.shutdown.cancel();
        for handle in state.handles {
            let _ = handle.await;
        }
        info!("Queue workers stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn worker_loop(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                debug!("Worker shutting down");
                break;
            }
            // Cancellation is only observed between dispatches, so a job
            // that is already running always finishes its attempt.
            if self.process_one().await.is_none() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        let inner = self.lock_inner();
        let mut stats = QueueStats {
            total: inner.jobs.len() as u64,
            ..QueueStats::default()
        };
        for job in inner.jobs.values() {
            *stats.by_status.entry(job.status.as_str().to_string()).or_insert(0) += 1;
            *stats.by_type.entry(job.job_type.as_str().to_string()).or_insert(0) += 1;
        }
        stats
    }

    /// Snapshot of pending jobs in dispatch order.
    pub fn get_pending_jobs(&self) -> Vec<Job> {
        let inner = self.lock_inner();
        let mut pending: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.order_key());
        pending
    }

    /// All jobs of one type, in insertion order.
    pub fn jobs_by_type(&self, job_type: JobType) -> Vec<Job> {
        let inner = self.lock_inner();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.job_type == job_type)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// Remove jobs matching `status`, or all jobs when `None`. Running jobs
    /// are never removed.
    pub fn clear(&self, status: Option<JobStatus>) -> usize {
        let mut inner = self.lock_inner();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            job.status == JobStatus::Running
                || match status {
                    Some(s) => job.status != s,
                    None => false,
                }
        });
        let removed: Vec<JobId> = inner
            .retry
            .keys()
            .filter(|id| !inner.jobs.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            inner.retry.remove(&id);
        }
        before - inner.jobs.len()
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.lock_inner().jobs.get(id).cloned()
    }

    /// Retry bookkeeping for a job between failures, if any is in flight.
    pub fn retry_context(&self, id: &JobId) -> Option<RetryContext> {
        self.lock_inner().retry.get(id).cloned()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
