//! Queue transports.
//!
//! [`QueueBackend`] is the at-least-once transport the channel drives. Two
//! backends ship: [`MemoryQueue`] for tests and ephemeral runs, and the libSQL
//! [`Storage`] for durable operation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use feedforge_shared::{DeadLetter, FeedforgeError, Job, Result};
use feedforge_storage::{LEASE_EXPIRED, Storage};
use tokio::sync::Mutex;

/// Durable, at-least-once message transport.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue jobs; either all are stored or none.
    async fn push(&self, jobs: &[Job]) -> Result<()>;

    /// Hand out up to `limit` available jobs, hidden from other callers for `lease`.
    async fn lease(&self, limit: usize, lease: Duration) -> Result<Vec<Job>>;

    /// Remove a completed job.
    async fn ack(&self, id: &str) -> Result<()>;

    /// Put a leased job back with its updated attempts, availability and error.
    async fn requeue(&self, job: &Job) -> Result<()>;

    /// Remove a job from circulation, keeping it with its last error.
    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()>;

    /// Jobs waiting or leased.
    async fn depth(&self) -> Result<u64>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn dead_letter_count(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<Job>,
    leased: Vec<(Job, Instant)>,
    dead: Vec<DeadLetter>,
}

/// Process-local queue. Jobs are lost on exit.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, jobs: &[Job]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ready.extend(jobs.iter().cloned());
        Ok(())
    }

    async fn lease(&self, limit: usize, lease: Duration) -> Result<Vec<Job>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        // An expired lease is a failed delivery. Survivors go back to the
        // front of the line; exhausted jobs are dead-lettered.
        let wall_now = Utc::now();
        let (expired, live): (Vec<_>, Vec<_>) =
            state.leased.drain(..).partition(|(_, until)| *until <= now);
        state.leased = live;
        for (mut job, _) in expired.into_iter().rev() {
            job.attempts = job.attempts.saturating_add(1);
            job.last_error = Some(LEASE_EXPIRED.to_string());
            if job.attempts >= job.max_attempts {
                state.dead.push(DeadLetter {
                    job,
                    error: LEASE_EXPIRED.to_string(),
                    dead_at: wall_now,
                });
            } else {
                state.ready.push_front(job);
            }
        }

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.ready.len());
        while let Some(job) = state.ready.pop_front() {
            if taken.len() < limit && job.available_at <= wall_now {
                taken.push(job);
            } else {
                remaining.push_back(job);
            }
        }
        state.ready = remaining;

        let until = now + lease;
        state
            .leased
            .extend(taken.iter().cloned().map(|job| (job, until)));
        Ok(taken)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.leased.retain(|(job, _)| job.id != id);
        Ok(())
    }

    async fn requeue(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.leased.len();
        state.leased.retain(|(leased, _)| leased.id != job.id);
        if state.leased.len() == before {
            return Err(FeedforgeError::NotFound(format!("job {}", job.id)));
        }
        state.ready.push_back(job.clone());
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.leased.retain(|(leased, _)| leased.id != job.id);
        state.ready.retain(|ready| ready.id != job.id);
        state.dead.push(DeadLetter {
            job: job.clone(),
            error: error.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok((state.ready.len() + state.leased.len()) as u64)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn dead_letter_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.dead.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// libSQL backend
// ---------------------------------------------------------------------------

#[async_trait]
impl QueueBackend for Storage {
    async fn push(&self, jobs: &[Job]) -> Result<()> {
        self.push_jobs(jobs).await
    }

    async fn lease(&self, limit: usize, lease: Duration) -> Result<Vec<Job>> {
        self.lease_jobs(limit, lease).await
    }

    async fn ack(&self, id: &str) -> Result<()> {
        if !self.ack_job(id).await? {
            tracing::debug!(job_id = id, "ack for job already removed");
        }
        Ok(())
    }

    async fn requeue(&self, job: &Job) -> Result<()> {
        self.reschedule_job(job).await
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()> {
        self.dead_letter_job(job, error, Utc::now()).await
    }

    async fn depth(&self) -> Result<u64> {
        self.count_jobs().await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.list_dead_letters(limit).await
    }

    async fn dead_letter_count(&self) -> Result<u64> {
        self.count_dead_letters().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedforge_shared::SourceId;

    #[tokio::test]
    async fn memory_queue_leases_in_order() {
        let queue = MemoryQueue::new();
        let jobs: Vec<Job> = (0..3).map(|_| Job::fetch(&SourceId::new(), 3)).collect();
        queue.push(&jobs).await.unwrap();

        let leased = queue.lease(2, Duration::from_secs(60)).await.unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0].id, jobs[0].id);
        assert_eq!(leased[1].id, jobs[1].id);
        assert_eq!(queue.depth().await.unwrap(), 3);

        queue.ack(&jobs[0].id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn memory_queue_respects_availability() {
        let queue = MemoryQueue::new();
        let mut job = Job::fetch(&SourceId::new(), 3);
        job.available_at = Utc::now() + chrono::Duration::seconds(3600);
        queue.push(&[job]).await.unwrap();
        assert!(queue.lease(10, Duration::from_secs(60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_queue_redelivers_expired_leases() {
        let queue = MemoryQueue::new();
        queue.push(&[Job::fetch(&SourceId::new(), 3)]).await.unwrap();
        assert_eq!(queue.lease(1, Duration::ZERO).await.unwrap().len(), 1);
        let again = queue.lease(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 1);
    }

    #[tokio::test]
    async fn expired_leases_are_bounded_by_max_attempts() {
        let queue = MemoryQueue::new();
        queue.push(&[Job::fetch(&SourceId::new(), 2)]).await.unwrap();

        let mut deliveries = 0;
        for _ in 0..10 {
            deliveries += queue.lease(1, Duration::ZERO).await.unwrap().len();
        }
        assert_eq!(deliveries, 2);
        assert_eq!(queue.depth().await.unwrap(), 0);

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, LEASE_EXPIRED);
        assert_eq!(dead[0].job.attempts, 2);
    }

    #[tokio::test]
    async fn storage_backend_roundtrip() {
        let tmp = std::env::temp_dir().join(format!("ff_test_{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open");
        let job = Job::fetch(&SourceId::new(), 2);
        storage.push(&[job.clone()]).await.unwrap();

        let leased = storage.lease(5, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.len(), 1);
        storage.dead_letter(&leased[0], "gave up").await.unwrap();
        assert_eq!(storage.depth().await.unwrap(), 0);
        assert_eq!(storage.dead_letters(5).await.unwrap()[0].error, "gave up");
    }
}
