//! Per-source scheduling state and due evaluation.

use chrono::{DateTime, Utc};
use feedforge_shared::{SchedulerConfig, Source};
use serde::Serialize;

/// Where a source is in its fetch cycle. Every terminal state returns to
/// [`SourceState::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Due,
    Fetching,
    Fetched,
    Failed,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Due => "due",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusion thresholds applied by [`is_due`] outside force mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DueGate {
    pub failure_threshold: u32,
    pub min_quality_score: f64,
}

impl From<&SchedulerConfig> for DueGate {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            min_quality_score: config.min_quality_score,
        }
    }
}

/// Whether `source` should be fetched at `now`.
///
/// `force` skips the failure and quality gates. The minimum interval always
/// applies, counted from the last attempt whether or not it succeeded.
pub fn is_due(source: &Source, now: DateTime<Utc>, gate: &DueGate, force: bool) -> bool {
    if !source.active {
        return false;
    }

    if let Some(last) = source.last_attempt_at.max(source.last_fetched_at) {
        let elapsed = now.signed_duration_since(last).num_seconds();
        if elapsed < 0 || (elapsed as u64) < source.min_fetch_interval_secs {
            return false;
        }
    }

    if force {
        return true;
    }

    source.consecutive_failure_count < gate.failure_threshold
        && source.quality_score >= gate.min_quality_score
}
