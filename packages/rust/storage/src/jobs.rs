//! Persistent job queue primitives and dead letters.
//!
//! A delivered job stays in `jobs` with a lease; it becomes visible again when
//! the lease expires unless it is acknowledged, rescheduled, or dead-lettered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use feedforge_shared::{DeadLetter, FeedforgeError, Job, JobKind, Result};
use libsql::{Row, params};

use crate::sources::count_row;
use crate::{Storage, db_err, parse_ts, ts};

/// Dead-letter reason for a job whose last lease ran out.
pub const LEASE_EXPIRED: &str = "lease expired";

const JOB_COLUMNS: &str =
    "id, kind, payload, created_at, attempts, max_attempts, available_at, last_error";

impl Storage {
    /// Insert all jobs in one transaction.
    pub async fn push_jobs(&self, jobs: &[Job]) -> Result<()> {
        self.check_writable()?;
        if jobs.is_empty() {
            return Ok(());
        }

        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        for job in jobs {
            let payload = serde_json::to_string(&job.payload)
                .map_err(|e| FeedforgeError::parse(format!("job payload: {e}")))?;
            tx.execute(
                "INSERT INTO jobs (id, kind, payload, created_at, attempts, max_attempts,
                     available_at, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.as_str(),
                    job.kind.as_str(),
                    payload,
                    ts(&job.created_at),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    ts(&job.available_at),
                    job.last_error.as_deref()
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Lease up to `limit` visible jobs for `lease`. Visible means available
    /// and not held by an unexpired lease. Oldest availability first.
    ///
    /// A job whose lease ran out counts as a failed delivery: its `attempts`
    /// goes up by one, and once that reaches `max_attempts` it is moved to
    /// `dead_letters` with [`LEASE_EXPIRED`] instead of being handed out.
    pub async fn lease_jobs(&self, limit: usize, lease: Duration) -> Result<Vec<Job>> {
        self.check_writable()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| FeedforgeError::config(format!("lease duration: {e}")))?;
        let until = ts(&(now + lease));
        let now_ts = ts(&now);

        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(db_err)?;

        let mut rows = tx
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE lease_expires_at IS NOT NULL AND lease_expires_at <= ?1"
                ),
                params![now_ts.as_str()],
            )
            .await
            .map_err(db_err)?;
        let mut expired = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            expired.push(row_to_job(&row)?);
        }
        drop(rows);

        for mut job in expired {
            job.attempts = job.attempts.saturating_add(1);
            job.last_error = Some(LEASE_EXPIRED.to_string());
            if job.attempts >= job.max_attempts {
                let job_json = serde_json::to_string(&job)
                    .map_err(|e| FeedforgeError::parse(format!("dead letter: {e}")))?;
                tx.execute(
                    "INSERT OR REPLACE INTO dead_letters (job_id, job_json, error, dead_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![job.id.as_str(), job_json, LEASE_EXPIRED, now_ts.as_str()],
                )
                .await
                .map_err(db_err)?;
                tx.execute("DELETE FROM jobs WHERE id = ?1", params![job.id.as_str()])
                    .await
                    .map_err(db_err)?;
                tracing::warn!(job_id = %job.id, attempts = job.attempts, "lease expired, job dead-lettered");
            } else {
                tx.execute(
                    "UPDATE jobs SET attempts = ?2, last_error = ?3, lease_expires_at = NULL
                     WHERE id = ?1",
                    params![job.id.as_str(), job.attempts as i64, LEASE_EXPIRED],
                )
                .await
                .map_err(db_err)?;
            }
        }

        let mut rows = tx
            .query(
                &format!(
                    "UPDATE jobs SET lease_expires_at = ?1
                     WHERE id IN (
                         SELECT id FROM jobs
                         WHERE available_at <= ?2 AND lease_expires_at IS NULL
                         ORDER BY available_at, created_at
                         LIMIT ?3
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![until, now_ts, limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            jobs.push(row_to_job(&row)?);
        }
        drop(rows);
        tx.commit().await.map_err(db_err)?;

        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| {
            (a.available_at, a.created_at).cmp(&(b.available_at, b.created_at))
        });
        Ok(jobs)
    }

    /// Remove a completed job. Returns `false` if it was already gone.
    pub async fn ack_job(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Persist a rescheduled job (attempts, availability, last error) and drop its lease.
    pub async fn reschedule_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET attempts = ?2, available_at = ?3, last_error = ?4,
                     lease_expires_at = NULL
                 WHERE id = ?1",
                params![
                    job.id.as_str(),
                    job.attempts as i64,
                    ts(&job.available_at),
                    job.last_error.as_deref()
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(FeedforgeError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    /// Move a job to the dead-letter table.
    pub async fn dead_letter_job(&self, job: &Job, error: &str, dead_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let job_json = serde_json::to_string(job)
            .map_err(|e| FeedforgeError::parse(format!("dead letter: {e}")))?;

        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO dead_letters (job_id, job_json, error, dead_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job.id.as_str(), job_json, error, ts(&dead_at)],
        )
        .await
        .map_err(db_err)?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![job.id.as_str()])
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Most recent dead letters first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut rows = self
            .conn
            .query(
                "SELECT job_json, error, dead_at FROM dead_letters
                 ORDER BY dead_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let job_json = row.get::<String>(0).map_err(db_err)?;
            let job: Job = serde_json::from_str(&job_json)
                .map_err(|e| FeedforgeError::Storage(format!("bad dead letter: {e}")))?;
            results.push(DeadLetter {
                job,
                error: row.get::<String>(1).map_err(db_err)?,
                dead_at: parse_ts(&row.get::<String>(2).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Jobs waiting or leased.
    pub async fn count_jobs(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM jobs", params![])
            .await
            .map_err(db_err)?;
        count_row(&mut rows).await
    }

    pub async fn count_dead_letters(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM dead_letters", params![])
            .await
            .map_err(db_err)?;
        count_row(&mut rows).await
    }
}

fn row_to_job(row: &Row) -> Result<Job> {
    let kind_raw = row.get::<String>(1).map_err(db_err)?;
    let kind: JobKind = kind_raw.parse().map_err(FeedforgeError::Storage)?;
    let payload_raw = row.get::<String>(2).map_err(db_err)?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|e| FeedforgeError::Storage(format!("bad job payload: {e}")))?;

    Ok(Job {
        id: row.get::<String>(0).map_err(db_err)?,
        kind,
        payload,
        created_at: parse_ts(&row.get::<String>(3).map_err(db_err)?)?,
        attempts: row.get::<i64>(4).map_err(db_err)?.max(0) as u32,
        max_attempts: row.get::<i64>(5).map_err(db_err)?.max(0) as u32,
        available_at: parse_ts(&row.get::<String>(6).map_err(db_err)?)?,
        last_error: row.get::<Option<String>>(7).map_err(db_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_storage;
    use feedforge_shared::SourceId;

    #[tokio::test]
    async fn lease_hides_job_until_ack() {
        let storage = test_storage().await;
        let job = Job::fetch(&SourceId::new(), 3);
        storage.push_jobs(&[job.clone()]).await.expect("push");

        let leased = storage
            .lease_jobs(10, Duration::from_secs(60))
            .await
            .expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, job.id);
        assert_eq!(leased[0].kind, JobKind::Fetch);

        let again = storage
            .lease_jobs(10, Duration::from_secs(60))
            .await
            .expect("lease again");
        assert!(again.is_empty(), "leased job must stay hidden");

        assert!(storage.ack_job(&job.id).await.unwrap());
        assert!(!storage.ack_job(&job.id).await.unwrap());
        assert_eq!(storage.count_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_redelivers_with_attempt_counted() {
        let storage = test_storage().await;
        let job = Job::fetch(&SourceId::new(), 3);
        storage.push_jobs(&[job]).await.expect("push");

        let first = storage.lease_jobs(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 0);
        let second = storage.lease_jobs(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 1);
        assert_eq!(second[0].last_error.as_deref(), Some(LEASE_EXPIRED));
    }

    #[tokio::test]
    async fn repeatedly_expired_lease_is_dead_lettered() {
        let storage = test_storage().await;
        let job = Job::fetch(&SourceId::new(), 2);
        storage.push_jobs(&[job.clone()]).await.expect("push");

        let mut deliveries = 0;
        for _ in 0..10 {
            deliveries += storage.lease_jobs(1, Duration::ZERO).await.unwrap().len();
        }
        assert_eq!(deliveries, 2, "never delivered more than max_attempts times");
        assert_eq!(storage.count_jobs().await.unwrap(), 0);

        let letters = storage.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].job.id, job.id);
        assert_eq!(letters[0].job.attempts, 2);
        assert_eq!(letters[0].error, LEASE_EXPIRED);
    }

    #[tokio::test]
    async fn reschedule_delays_delivery() {
        let storage = test_storage().await;
        let job = Job::fetch(&SourceId::new(), 3);
        storage.push_jobs(&[job]).await.unwrap();

        let mut leased = storage.lease_jobs(1, Duration::from_secs(60)).await.unwrap();
        let mut job = leased.remove(0);
        job.attempts += 1;
        job.available_at = Utc::now() + chrono::Duration::seconds(3600);
        job.last_error = Some("timeout".into());
        storage.reschedule_job(&job).await.unwrap();

        assert!(storage.lease_jobs(1, Duration::from_secs(60)).await.unwrap().is_empty());
        assert_eq!(storage.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dead_letter_moves_job() {
        let storage = test_storage().await;
        let job = Job::fetch(&SourceId::new(), 1);
        storage.push_jobs(&[job.clone()]).await.unwrap();

        storage
            .dead_letter_job(&job, "permanent failure", Utc::now())
            .await
            .unwrap();
        assert_eq!(storage.count_jobs().await.unwrap(), 0);
        assert_eq!(storage.count_dead_letters().await.unwrap(), 1);

        let letters = storage.list_dead_letters(10).await.unwrap();
        assert_eq!(letters[0].job, job);
        assert_eq!(letters[0].error, "permanent failure");
    }
}
