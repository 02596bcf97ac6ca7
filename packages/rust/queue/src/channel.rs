//! The queue channel: validated send, leased receive with ack / requeue /
//! dead-letter bookkeeping, and in-flight duplicate suppression.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use feedforge_shared::{DeadLetter, Job, QueueConfig};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::backend::QueueBackend;
use crate::error::QueueError;
use crate::validate::validate_job;

/// A handler failure kept for the caller.
#[derive(Debug)]
pub struct JobFailure {
    pub job_id: String,
    pub error: QueueError,
}

/// What one `receive` call did with each delivered job.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub acked: Vec<String>,
    pub requeued: Vec<String>,
    pub dead_lettered: Vec<String>,
    /// Deliveries skipped because the same job id was already in flight.
    pub skipped_duplicates: usize,
    pub failures: Vec<JobFailure>,
}

impl DeliveryReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0
    }

    /// Whether any handler returned an error in this delivery.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Cloneable handle over a [`QueueBackend`]. Clones share the in-flight set.
#[derive(Clone)]
pub struct QueueChannel {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl QueueChannel {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self {
            backend,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Validate and enqueue one job.
    pub async fn send(&self, job: Job) -> Result<(), QueueError> {
        validate_job(&job, self.config.max_job_bytes)?;
        self.backend.push(std::slice::from_ref(&job)).await?;
        debug!(job_id = %job.id, kind = job.kind.as_str(), "job enqueued");
        Ok(())
    }

    /// Validate every job, then enqueue them together. One invalid job
    /// rejects the whole batch. Returns the number enqueued.
    pub async fn send_batch(&self, jobs: Vec<Job>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        for job in &jobs {
            validate_job(job, self.config.max_job_bytes)?;
        }
        self.backend.push(&jobs).await?;
        debug!(count = jobs.len(), "job batch enqueued");
        Ok(jobs.len())
    }

    /// Lease a batch and run `handler` on each job in turn.
    ///
    /// `Ok` acknowledges. `Retryable` requeues with `attempts + 1`, or
    /// dead-letters once that reaches `max_attempts`. `Fatal` and `Validation`
    /// dead-letter immediately. The channel never retries on its own; handler
    /// errors come back in [`DeliveryReport::failures`].
    #[instrument(skip_all, fields(batch = self.config.receive_batch))]
    pub async fn receive<F, Fut>(&self, handler: F) -> Result<DeliveryReport, QueueError>
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = Result<(), QueueError>>,
    {
        let jobs = self
            .backend
            .lease(self.config.receive_batch, self.config.lease)
            .await?;

        let mut report = DeliveryReport::default();
        let mut seen = HashSet::new();
        for job in jobs {
            if !seen.insert(job.id.clone()) || !self.claim(&job.id).await {
                debug!(job_id = %job.id, "duplicate delivery skipped");
                report.skipped_duplicates += 1;
                continue;
            }
            report.delivered += 1;

            let id = job.id.clone();
            let outcome = handler(job.clone()).await;
            let settled = self.settle(job, outcome, &mut report).await;
            self.in_flight.lock().await.remove(&id);
            settled?;
        }
        Ok(report)
    }

    async fn claim(&self, id: &str) -> bool {
        self.in_flight.lock().await.insert(id.to_string())
    }

    async fn settle(
        &self,
        mut job: Job,
        outcome: Result<(), QueueError>,
        report: &mut DeliveryReport,
    ) -> Result<(), QueueError> {
        let error = match outcome {
            Ok(()) => {
                self.backend.ack(&job.id).await?;
                report.acked.push(job.id);
                return Ok(());
            }
            Err(error) => error,
        };

        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(error.to_string());

        let exhausted = job.attempts >= job.max_attempts;
        if error.is_retryable() && !exhausted {
            let delay = match &error {
                QueueError::Retryable {
                    delay: Some(delay), ..
                } => chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::zero()),
                _ => chrono::Duration::zero(),
            };
            job.available_at = Utc::now() + delay;
            self.backend.requeue(&job).await?;
            debug!(job_id = %job.id, attempts = job.attempts, "job requeued");
            report.requeued.push(job.id.clone());
        } else {
            let reason = error.to_string();
            self.backend.dead_letter(&job, &reason).await?;
            warn!(
                job_id = %job.id,
                attempts = job.attempts,
                error = %reason,
                "job dead-lettered"
            );
            report.dead_lettered.push(job.id.clone());
        }

        report.failures.push(JobFailure {
            job_id: job.id,
            error,
        });
        Ok(())
    }

    /// Jobs waiting or leased in the backend.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.backend.depth().await?)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.backend.dead_letters(limit).await?)
    }

    pub async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        Ok(self.backend.dead_letter_count().await?)
    }

    /// Jobs currently held by a handler.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
