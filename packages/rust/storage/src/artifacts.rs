//! Shared artifact metadata and consumer reference records.
//!
//! Reference counts only move through guarded single-statement updates, so
//! the stored count never goes negative.

use chrono::{DateTime, Utc};
use feedforge_shared::{ConsumerReference, FeedforgeError, Result, SharedArtifact};
use libsql::{Row, params};
use serde::Serialize;

use crate::sources::count_row;
use crate::{Storage, db_err, parse_opt_ts, parse_ts, ts};

const ARTIFACT_COLUMNS: &str = "content_hash, storage_locator, reference_count, size_bytes, \
     created_at, orphaned_since, metadata_json";

const REFERENCE_COLUMNS: &str = "owner_id, subject_id, content_hash, current_hash, is_modified, \
     locator, created_at, updated_at";

/// Aggregate counters over artifacts and references.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArtifactCounts {
    pub artifacts: u64,
    /// Artifacts with at least one live reference.
    pub referenced: u64,
    /// Artifacts whose count dropped back to zero; eligible for collection.
    pub orphaned: u64,
    pub total_bytes: u64,
    pub references: u64,
    pub forked_references: u64,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Artifact operations
    // -----------------------------------------------------------------------

    /// Insert artifact metadata. Returns `false` if the hash already exists.
    pub async fn insert_artifact(&self, artifact: &SharedArtifact) -> Result<bool> {
        self.check_writable()?;
        let metadata = artifact
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| FeedforgeError::parse(format!("artifact metadata: {e}")))?;

        let changed = self
            .conn
            .execute(
                "INSERT INTO artifacts (content_hash, storage_locator, reference_count,
                     size_bytes, created_at, orphaned_since, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(content_hash) DO NOTHING",
                params![
                    artifact.content_hash.as_str(),
                    artifact.storage_locator.as_str(),
                    artifact.reference_count as i64,
                    artifact.size_bytes as i64,
                    ts(&artifact.created_at),
                    artifact.orphaned_since.as_ref().map(ts),
                    metadata
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Get artifact metadata by hash.
    pub async fn get_artifact(&self, content_hash: &str) -> Result<Option<SharedArtifact>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE content_hash = ?1"),
                params![content_hash],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_artifact(&row)?)),
            None => Ok(None),
        }
    }

    /// Add one reference and clear the orphan mark. Returns the new count.
    pub async fn increment_reference_count(&self, content_hash: &str) -> Result<u64> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "UPDATE artifacts SET reference_count = reference_count + 1,
                     orphaned_since = NULL
                 WHERE content_hash = ?1
                 RETURNING reference_count",
                params![content_hash],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Err(FeedforgeError::NotFound(format!("artifact {content_hash}"))),
        }
    }

    /// Drop one reference, never below zero. When the count reaches zero the
    /// artifact is stamped orphaned at `now`. Returns the new count.
    pub async fn decrement_reference_count(
        &self,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "UPDATE artifacts SET reference_count = reference_count - 1,
                     orphaned_since = CASE WHEN reference_count = 1 THEN ?2
                                           ELSE orphaned_since END
                 WHERE content_hash = ?1 AND reference_count > 0
                 RETURNING reference_count",
                params![content_hash, ts(&now)],
            )
            .await
            .map_err(db_err)?;

        if let Some(row) = rows.next().await.map_err(db_err)? {
            return Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64);
        }
        drop(rows);

        // Already at zero, or unknown hash.
        match self.get_artifact(content_hash).await? {
            Some(artifact) => {
                tracing::warn!(content_hash, "reference count already zero");
                Ok(artifact.reference_count)
            }
            None => Err(FeedforgeError::NotFound(format!("artifact {content_hash}"))),
        }
    }

    /// Artifacts with no references, orphaned at or before `cutoff`.
    pub async fn list_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<SharedArtifact>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ARTIFACT_COLUMNS} FROM artifacts
                     WHERE reference_count = 0
                       AND orphaned_since IS NOT NULL
                       AND orphaned_since <= ?1
                     ORDER BY orphaned_since"
                ),
                params![ts(&cutoff)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_artifact(&row)?);
        }
        Ok(results)
    }

    /// Delete artifact metadata if it is still unreferenced.
    /// Returns `false` when a reference appeared in the meantime.
    pub async fn delete_orphan(&self, content_hash: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM artifacts WHERE content_hash = ?1 AND reference_count = 0",
                params![content_hash],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Consumer reference operations
    // -----------------------------------------------------------------------

    pub async fn insert_reference(&self, reference: &ConsumerReference) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO consumer_refs (owner_id, subject_id, content_hash, current_hash,
                     is_modified, locator, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    reference.owner_id.as_str(),
                    reference.subject_id.as_str(),
                    reference.content_hash.as_str(),
                    reference.current_hash.as_str(),
                    reference.is_modified as i64,
                    reference.locator.as_str(),
                    ts(&reference.created_at),
                    ts(&reference.updated_at)
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_reference(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> Result<Option<ConsumerReference>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {REFERENCE_COLUMNS} FROM consumer_refs
                     WHERE owner_id = ?1 AND subject_id = ?2"
                ),
                params![owner_id, subject_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_reference(&row)?)),
            None => Ok(None),
        }
    }

    /// Persist the mutable parts of a reference: current hash, fork flag, timestamp.
    pub async fn update_reference(&self, reference: &ConsumerReference) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE consumer_refs SET current_hash = ?3, is_modified = ?4, updated_at = ?5
                 WHERE owner_id = ?1 AND subject_id = ?2",
                params![
                    reference.owner_id.as_str(),
                    reference.subject_id.as_str(),
                    reference.current_hash.as_str(),
                    reference.is_modified as i64,
                    ts(&reference.updated_at)
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Returns `false` if no such reference existed.
    pub async fn delete_reference(&self, owner_id: &str, subject_id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM consumer_refs WHERE owner_id = ?1 AND subject_id = ?2",
                params![owner_id, subject_id],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Unmodified references pointing at `content_hash`.
    pub async fn count_shared_references(&self, content_hash: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM consumer_refs WHERE content_hash = ?1 AND is_modified = 0",
                params![content_hash],
            )
            .await
            .map_err(db_err)?;
        count_row(&mut rows).await
    }

    pub async fn artifact_counts(&self) -> Result<ArtifactCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN reference_count = 0
                                           AND orphaned_since IS NOT NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(size_bytes), 0),
                        COALESCE(SUM(CASE WHEN reference_count > 0 THEN 1 ELSE 0 END), 0)
                 FROM artifacts",
                params![],
            )
            .await
            .map_err(db_err)?;
        let mut counts = ArtifactCounts::default();
        if let Some(row) = rows.next().await.map_err(db_err)? {
            counts.artifacts = row.get::<i64>(0).map_err(db_err)?.max(0) as u64;
            counts.orphaned = row.get::<i64>(1).map_err(db_err)?.max(0) as u64;
            counts.total_bytes = row.get::<i64>(2).map_err(db_err)?.max(0) as u64;
            counts.referenced = row.get::<i64>(3).map_err(db_err)?.max(0) as u64;
        }
        drop(rows);

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*), COALESCE(SUM(is_modified), 0) FROM consumer_refs",
                params![],
            )
            .await
            .map_err(db_err)?;
        if let Some(row) = rows.next().await.map_err(db_err)? {
            counts.references = row.get::<i64>(0).map_err(db_err)?.max(0) as u64;
            counts.forked_references = row.get::<i64>(1).map_err(db_err)?.max(0) as u64;
        }
        Ok(counts)
    }
}

fn row_to_artifact(row: &Row) -> Result<SharedArtifact> {
    let metadata = row
        .get::<Option<String>>(6)
        .map_err(db_err)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| FeedforgeError::Storage(format!("bad artifact metadata: {e}")))?;

    Ok(SharedArtifact {
        content_hash: row.get::<String>(0).map_err(db_err)?,
        storage_locator: row.get::<String>(1).map_err(db_err)?,
        reference_count: row.get::<i64>(2).map_err(db_err)?.max(0) as u64,
        size_bytes: row.get::<i64>(3).map_err(db_err)?.max(0) as u64,
        created_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
        orphaned_since: parse_opt_ts(row.get::<Option<String>>(5).map_err(db_err)?)?,
        metadata,
    })
}

fn row_to_reference(row: &Row) -> Result<ConsumerReference> {
    Ok(ConsumerReference {
        owner_id: row.get::<String>(0).map_err(db_err)?,
        subject_id: row.get::<String>(1).map_err(db_err)?,
        content_hash: row.get::<String>(2).map_err(db_err)?,
        current_hash: row.get::<String>(3).map_err(db_err)?,
        is_modified: row.get::<i64>(4).map_err(db_err)? != 0,
        locator: row.get::<String>(5).map_err(db_err)?,
        created_at: parse_ts(&row.get::<String>(6).map_err(db_err)?)?,
        updated_at: parse_ts(&row.get::<String>(7).map_err(db_err)?)?,
    })
}
