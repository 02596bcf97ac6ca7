//! Core domain types for feedforge: sources, discovered items, queue jobs,
//! shared artifacts and consumer references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{FeedforgeError, Result};

// ---------------------------------------------------------------------------
// SourceId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for feed source identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub Uuid);

impl SourceId {
    /// Generate a new time-sortable source identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// A feed source polled by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Feed URL (RSS, Atom or JSON Feed).
    pub url: String,
    /// Human-readable name.
    pub name: String,
    /// Inactive sources are never scheduled.
    pub active: bool,
    /// When the last successful fetch completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// When the last fetch attempt finished, successful or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Failed fetches in a row; reset to zero on success or by an admin.
    pub consecutive_failure_count: u32,
    /// Minimum seconds between two fetches of this source.
    pub min_fetch_interval_secs: u64,
    /// Editorial quality in `[0.0, 1.0]`; drives scheduling gate and AI priority.
    pub quality_score: f64,
    /// Message of the most recent fetch failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub url: String,
    pub name: String,
    pub min_fetch_interval_secs: u64,
    pub quality_score: f64,
}

impl NewSource {
    /// Reject URLs that are not absolute http(s) and scores outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        validate_feed_url(&self.url)?;
        validate_quality(self.quality_score)?;
        if self.name.trim().is_empty() {
            return Err(FeedforgeError::validation("source name must not be empty"));
        }
        Ok(())
    }
}

/// Partial update of a source; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceUpdate {
    pub url: Option<String>,
    pub name: Option<String>,
    pub active: Option<bool>,
    pub min_fetch_interval_secs: Option<u64>,
    pub quality_score: Option<f64>,
}

impl SourceUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.url {
            validate_feed_url(url)?;
        }
        if let Some(score) = self.quality_score {
            validate_quality(score)?;
        }
        Ok(())
    }
}

fn validate_feed_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| FeedforgeError::validation(format!("invalid feed URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FeedforgeError::validation(format!(
            "unsupported feed URL scheme '{other}'"
        ))),
    }
}

fn validate_quality(score: f64) -> Result<()> {
    if (0.0..=1.0).contains(&score) {
        Ok(())
    } else {
        Err(FeedforgeError::validation(format!(
            "quality score {score} outside [0, 1]"
        )))
    }
}

// ---------------------------------------------------------------------------
// DiscoveredItem
// ---------------------------------------------------------------------------

/// One entry found in a feed. Identity is `guid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub guid: String,
    pub source_id: SourceId,
    pub title: String,
    pub link: String,
    pub raw_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Hash of the artifact generated for this item, once processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The kinds of work a queue job can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch one source now.
    Fetch,
    /// Run one discovered item through the completion call.
    Process,
}

impl JobKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Process => "process",
        }
    }

    /// Payload fields a job of this kind must carry.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Fetch => &["source_id"],
            Self::Process => &["guid", "source_id"],
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(Self::Fetch),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// A queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Deliveries that ended in failure so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest instant the job may be delivered again.
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Build a job of the given kind with a fresh id.
    pub fn new(kind: JobKind, payload: serde_json::Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            payload,
            created_at: now,
            attempts: 0,
            max_attempts,
            available_at: now,
            last_error: None,
        }
    }

    /// A job asking a worker to fetch `source_id` out of schedule.
    pub fn fetch(source_id: &SourceId, max_attempts: u32) -> Self {
        Self::new(
            JobKind::Fetch,
            serde_json::json!({ "source_id": source_id.to_string() }),
            max_attempts,
        )
    }

    /// A job asking a worker to process a freshly discovered item.
    pub fn process(item: &DiscoveredItem, max_attempts: u32) -> Self {
        Self::new(
            JobKind::Process,
            serde_json::json!({
                "guid": item.guid,
                "source_id": item.source_id.to_string(),
            }),
            max_attempts,
        )
    }

    /// String field of the payload, if present.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

/// A job that exhausted its attempts or failed fatally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub dead_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Content-addressed artifacts
// ---------------------------------------------------------------------------

/// One stored artifact, shared by every consumer holding an unmodified reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedArtifact {
    /// SHA-256 of the canonical bytes, lowercase hex.
    pub content_hash: String,
    /// Key of the bytes in the blob backend.
    pub storage_locator: String,
    /// Active, non-forked consumer references.
    pub reference_count: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// When the count last dropped to zero (or creation, if never referenced).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphaned_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A consumer's copy-on-write view of a [`SharedArtifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerReference {
    pub owner_id: String,
    pub subject_id: String,
    /// The shared artifact this reference was created from.
    pub content_hash: String,
    /// Hash of the owner's current bytes; equals `content_hash` until forked.
    pub current_hash: String,
    pub is_modified: bool,
    /// Owner-scoped blob key.
    pub locator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_roundtrip() {
        let id = SourceId::new();
        let parsed: SourceId = id.to_string().parse().expect("parse SourceId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = content_hash(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn job_kind_parse() {
        assert_eq!("fetch".parse::<JobKind>(), Ok(JobKind::Fetch));
        assert_eq!("process".parse::<JobKind>(), Ok(JobKind::Process));
        assert!("summarize".parse::<JobKind>().is_err());
    }

    #[test]
    fn process_job_carries_required_fields() {
        let item = DiscoveredItem {
            guid: "urn:item:1".into(),
            source_id: SourceId::new(),
            title: "Title".into(),
            link: "https://example.com/1".into(),
            raw_content: "body".into(),
            published_at: None,
            artifact_hash: None,
        };
        let job = Job::process(&item, 5);
        for field in JobKind::Process.required_fields() {
            assert!(job.payload_str(field).is_some(), "missing {field}");
        }
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 5);
    }

    #[test]
    fn new_source_validation() {
        let mut source = NewSource {
            url: "https://example.com/feed.xml".into(),
            name: "Example".into(),
            min_fetch_interval_secs: 300,
            quality_score: 0.8,
        };
        assert!(source.validate().is_ok());

        source.url = "ftp://example.com/feed".into();
        assert!(source.validate().is_err());

        source.url = "https://example.com/feed.xml".into();
        source.quality_score = 1.5;
        assert!(source.validate().is_err());
    }

    #[test]
    fn job_serialization() {
        let job = Job::fetch(&SourceId::new(), 3);
        let json = serde_json::to_string(&job).expect("serialize");
        assert!(json.contains(r#""kind":"fetch""#));
        let parsed: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, job);
    }
}
