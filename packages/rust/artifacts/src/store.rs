//! Content-addressed artifact store with copy-on-write consumer references.
//!
//! Shared bytes live once under `shared/<aa>/<hash>`. Each consumer gets its
//! own copy under `owners/<owner>/<subject>`, counted against the shared
//! artifact until the consumer's bytes diverge. Count mutations for one hash
//! are serialized through [`KeyedLocks`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use feedforge_shared::{
    ConsumerReference, FeedforgeError, Result, SharedArtifact, content_hash,
};
use feedforge_storage::Storage;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::blob::BlobStore;
use crate::locks::KeyedLocks;

/// Result of [`ContentStore::apply_owner_update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    /// `false` when the new bytes equal the owner's current bytes.
    pub forked: bool,
    pub current_hash: String,
}

/// A blob that could not be removed during collection.
#[derive(Debug, Clone, Serialize)]
pub struct GcFailure {
    pub content_hash: String,
    pub error: String,
}

/// Result of one orphan collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub scanned: usize,
    pub removed: usize,
    pub bytes_freed: u64,
    pub failures: Vec<GcFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub artifacts: u64,
    pub referenced: u64,
    pub orphaned: u64,
    pub total_bytes: u64,
    pub references: u64,
    pub forked_references: u64,
}

/// `shared/<first two chars>/<hash>`. Hashes shorter than two characters
/// (or not split on a char boundary) use the whole hash as the prefix.
pub fn shared_locator(hash: &str) -> String {
    let prefix = hash.get(..2).unwrap_or(hash);
    format!("shared/{prefix}/{hash}")
}

/// `owners/<owner>/<subject>`.
pub fn owner_locator(owner_id: &str, subject_id: &str) -> String {
    format!("owners/{owner_id}/{subject_id}")
}

fn validate_hash(hash: &str) -> Result<()> {
    let well_formed = hash.len() == 64
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if well_formed {
        Ok(())
    } else {
        Err(FeedforgeError::validation(format!(
            "'{hash}' is not a lowercase SHA-256 hex digest"
        )))
    }
}

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(FeedforgeError::validation(format!(
            "{kind} '{value}' is not a valid path segment"
        )));
    }
    Ok(())
}

pub struct ContentStore {
    storage: Arc<Storage>,
    blobs: Arc<dyn BlobStore>,
    locks: KeyedLocks,
}

impl ContentStore {
    pub fn new(storage: Arc<Storage>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            storage,
            blobs,
            locks: KeyedLocks::new(),
        }
    }

    /// Store `bytes` under `hash` once. Existing artifacts are returned
    /// untouched: no write, no reference change.
    #[instrument(skip_all, fields(hash = %hash, size = bytes.len()))]
    pub async fn store_shared(
        &self,
        hash: &str,
        bytes: &[u8],
        metadata: Option<serde_json::Value>,
    ) -> Result<SharedArtifact> {
        validate_hash(hash)?;
        let actual = content_hash(bytes);
        if actual != hash {
            return Err(FeedforgeError::validation(format!(
                "content hash mismatch: expected {hash}, bytes hash to {actual}"
            )));
        }

        let _guard = self.locks.lock(hash).await;
        if let Some(existing) = self.storage.get_artifact(hash).await? {
            debug!("artifact already stored");
            return Ok(existing);
        }

        let locator = shared_locator(hash);
        self.blobs.put(&locator, bytes).await?;

        let now = Utc::now();
        let artifact = SharedArtifact {
            content_hash: hash.to_string(),
            storage_locator: locator,
            reference_count: 0,
            size_bytes: bytes.len() as u64,
            created_at: now,
            // Only a release back to zero makes an artifact collectable.
            orphaned_since: None,
            metadata,
        };
        self.storage.insert_artifact(&artifact).await?;
        info!("artifact stored");
        Ok(artifact)
    }

    /// Return the owner's reference to `hash`, creating it (with its own copy
    /// of the bytes and one more count on the artifact) on first access.
    pub async fn acquire_reference(
        &self,
        owner_id: &str,
        subject_id: &str,
        hash: &str,
    ) -> Result<ConsumerReference> {
        validate_segment("owner id", owner_id)?;
        validate_segment("subject id", subject_id)?;
        validate_hash(hash)?;

        let locator = owner_locator(owner_id, subject_id);
        let _owner = self.locks.lock(&locator).await;
        let _guard = self.locks.lock(hash).await;
        if let Some(existing) = self.storage.get_reference(owner_id, subject_id).await? {
            return Ok(existing);
        }

        let artifact = self
            .storage
            .get_artifact(hash)
            .await?
            .ok_or_else(|| FeedforgeError::NotFound(format!("artifact {hash}")))?;

        let bytes = self.blobs.get(&artifact.storage_locator).await?;
        self.blobs.put(&locator, &bytes).await?;

        let now = Utc::now();
        let reference = ConsumerReference {
            owner_id: owner_id.to_string(),
            subject_id: subject_id.to_string(),
            content_hash: hash.to_string(),
            current_hash: hash.to_string(),
            is_modified: false,
            locator: locator.clone(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.storage.insert_reference(&reference).await {
            self.discard_owner_copy(&locator).await;
            return Err(e);
        }

        if let Err(e) = self.storage.increment_reference_count(hash).await {
            // Keep record, copy and count consistent.
            if let Err(undo) = self.storage.delete_reference(owner_id, subject_id).await {
                warn!(owner_id, subject_id, error = %undo, "could not roll back reference");
            }
            self.discard_owner_copy(&locator).await;
            return Err(e);
        }

        debug!(owner_id, subject_id, hash, "reference acquired");
        Ok(reference)
    }

    /// The owner's current bytes.
    pub async fn read_reference(&self, owner_id: &str, subject_id: &str) -> Result<Vec<u8>> {
        let reference = self.require_reference(owner_id, subject_id).await?;
        self.blobs.get(&reference.locator).await
    }

    /// Replace the owner's bytes. Identical content is a no-op. Divergent
    /// content is written to the owner's copy; the first divergence also
    /// releases the reference's count on the shared artifact.
    pub async fn apply_owner_update(
        &self,
        owner_id: &str,
        subject_id: &str,
        new_bytes: &[u8],
    ) -> Result<UpdateOutcome> {
        let _owner = self.locks.lock(&owner_locator(owner_id, subject_id)).await;
        let hash = self
            .require_reference(owner_id, subject_id)
            .await?
            .content_hash;
        let _guard = self.locks.lock(&hash).await;
        // Re-read under the lock.
        let mut reference = self.require_reference(owner_id, subject_id).await?;

        let new_hash = content_hash(new_bytes);
        if new_hash == reference.current_hash {
            return Ok(UpdateOutcome {
                forked: false,
                current_hash: new_hash,
            });
        }

        self.blobs.put(&reference.locator, new_bytes).await?;

        let first_divergence = !reference.is_modified;
        reference.current_hash = new_hash.clone();
        reference.is_modified = true;
        reference.updated_at = Utc::now();
        self.storage.update_reference(&reference).await?;

        if first_divergence {
            let remaining = self
                .storage
                .decrement_reference_count(&reference.content_hash, reference.updated_at)
                .await?;
            debug!(owner_id, subject_id, remaining, "reference forked");
        }

        Ok(UpdateOutcome {
            forked: true,
            current_hash: new_hash,
        })
    }

    /// Drop the owner's reference and its copy. Shared bytes stay until
    /// [`collect_orphans`](Self::collect_orphans). Returns `false` if there
    /// was no such reference.
    pub async fn release_reference(&self, owner_id: &str, subject_id: &str) -> Result<bool> {
        let _owner = self.locks.lock(&owner_locator(owner_id, subject_id)).await;
        let Some(found) = self.storage.get_reference(owner_id, subject_id).await? else {
            return Ok(false);
        };
        let _guard = self.locks.lock(&found.content_hash).await;
        let Some(reference) = self.storage.get_reference(owner_id, subject_id).await? else {
            return Ok(false);
        };

        self.blobs.delete(&reference.locator).await?;
        self.storage.delete_reference(owner_id, subject_id).await?;
        if !reference.is_modified {
            self.storage
                .decrement_reference_count(&reference.content_hash, Utc::now())
                .await?;
        }
        debug!(owner_id, subject_id, "reference released");
        Ok(true)
    }

    /// Remove artifacts unreferenced for longer than `retention`. A failed
    /// blob delete is recorded and the pass moves on; that artifact stays for
    /// the next pass.
    #[instrument(skip_all, fields(retention_secs = retention.as_secs()))]
    pub async fn collect_orphans(&self, retention: Duration) -> Result<GcReport> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| FeedforgeError::config(format!("retention: {e}")))?;
        let cutoff = Utc::now() - retention;
        let orphans = self.storage.list_orphans(cutoff).await?;

        let mut report = GcReport {
            scanned: orphans.len(),
            ..GcReport::default()
        };

        for orphan in orphans {
            let _guard = self.locks.lock(&orphan.content_hash).await;

            // A reference may have appeared since the scan.
            let current = match self.storage.get_artifact(&orphan.content_hash).await {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(e) => {
                    report.failures.push(GcFailure {
                        content_hash: orphan.content_hash.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let still_orphaned = current.reference_count == 0
                && current.orphaned_since.is_some_and(|since| since <= cutoff);
            if !still_orphaned {
                continue;
            }

            if let Err(e) = self.blobs.delete(&current.storage_locator).await {
                warn!(hash = %current.content_hash, error = %e, "orphan blob delete failed");
                report.failures.push(GcFailure {
                    content_hash: current.content_hash.clone(),
                    error: e.to_string(),
                });
                continue;
            }

            match self.storage.delete_orphan(&current.content_hash).await {
                Ok(true) => {
                    report.removed += 1;
                    report.bytes_freed += current.size_bytes;
                }
                Ok(false) => {}
                Err(e) => report.failures.push(GcFailure {
                    content_hash: current.content_hash.clone(),
                    error: e.to_string(),
                }),
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.removed,
            bytes_freed = report.bytes_freed,
            failures = report.failures.len(),
            "orphan collection finished"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let counts = self.storage.artifact_counts().await?;
        Ok(StoreStats {
            artifacts: counts.artifacts,
            referenced: counts.referenced,
            orphaned: counts.orphaned,
            total_bytes: counts.total_bytes,
            references: counts.references,
            forked_references: counts.forked_references,
        })
    }

    async fn discard_owner_copy(&self, locator: &str) {
        if let Err(e) = self.blobs.delete(locator).await {
            warn!(locator, error = %e, "could not remove owner copy");
        }
    }

    async fn require_reference(
        &self,
        owner_id: &str,
        subject_id: &str,
    ) -> Result<ConsumerReference> {
        self.storage
            .get_reference(owner_id, subject_id)
            .await?
            .ok_or_else(|| FeedforgeError::NotFound(format!("reference {owner_id}/{subject_id}")))
    }
}
