//! Producer-side job validation.

use feedforge_shared::Job;

use crate::error::QueueError;

/// Check a job before it is enqueued.
///
/// Rules: non-empty id, required payload fields for the kind present and
/// non-empty, `1 <= max_attempts`, `attempts <= max_attempts`, and the
/// serialized job no larger than `max_bytes`.
pub fn validate_job(job: &Job, max_bytes: usize) -> Result<(), QueueError> {
    if job.id.trim().is_empty() {
        return Err(QueueError::validation("job id must not be empty"));
    }

    for field in job.kind.required_fields() {
        match job.payload.get(*field) {
            None | Some(serde_json::Value::Null) => {
                return Err(QueueError::validation(format!(
                    "{} job {} missing payload field '{field}'",
                    job.kind.as_str(),
                    job.id
                )));
            }
            Some(serde_json::Value::String(s)) if s.is_empty() => {
                return Err(QueueError::validation(format!(
                    "{} job {} has empty payload field '{field}'",
                    job.kind.as_str(),
                    job.id
                )));
            }
            Some(_) => {}
        }
    }

    if job.max_attempts == 0 {
        return Err(QueueError::validation(format!(
            "job {} must allow at least one attempt",
            job.id
        )));
    }
    if job.attempts > job.max_attempts {
        return Err(QueueError::validation(format!(
            "job {} already used {} of {} attempts",
            job.id, job.attempts, job.max_attempts
        )));
    }

    let size = serde_json::to_vec(job)
        .map_err(|e| QueueError::validation(format!("job {} not serializable: {e}", job.id)))?
        .len();
    if size > max_bytes {
        return Err(QueueError::validation(format!(
            "job {} is {size} bytes, limit is {max_bytes}",
            job.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedforge_shared::{JobKind, SourceId};

    const LIMIT: usize = 64 * 1024;

    #[test]
    fn accepts_well_formed_jobs() {
        let job = Job::fetch(&SourceId::new(), 3);
        assert!(validate_job(&job, LIMIT).is_ok());
    }

    #[test]
    fn rejects_empty_id() {
        let mut job = Job::fetch(&SourceId::new(), 3);
        job.id = "  ".into();
        assert!(matches!(
            validate_job(&job, LIMIT),
            Err(QueueError::Validation { .. })
        ));
    }

    #[test]
    fn rejects_missing_fields() {
        let job = Job::new(JobKind::Process, serde_json::json!({ "guid": "a" }), 3);
        let err = validate_job(&job, LIMIT).unwrap_err();
        assert!(err.to_string().contains("source_id"));

        let job = Job::new(JobKind::Fetch, serde_json::json!({ "source_id": "" }), 3);
        assert!(validate_job(&job, LIMIT).is_err());
    }

    #[test]
    fn rejects_bad_attempt_bounds() {
        let job = Job::fetch(&SourceId::new(), 0);
        assert!(validate_job(&job, LIMIT).is_err());

        let mut job = Job::fetch(&SourceId::new(), 2);
        job.attempts = 3;
        assert!(validate_job(&job, LIMIT).is_err());
    }

    #[test]
    fn rejects_oversized_jobs() {
        let job = Job::new(
            JobKind::Fetch,
            serde_json::json!({ "source_id": "x", "blob": "y".repeat(2048) }),
            3,
        );
        assert!(validate_job(&job, 1024).is_err());
        assert!(validate_job(&job, LIMIT).is_ok());
    }
}
