//! Batched, bounded-parallel source polling.
//!
//! A cycle selects the due sources, fetches them in chunks of `batch_size`
//! through a [`JoinSet`], ingests new items idempotently and enqueues one
//! `process` job per newly inserted item.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use feedforge_queue::QueueChannel;
use feedforge_shared::{
    DiscoveredItem, FeedforgeError, Job, Result, SchedulerConfig, Source, SourceId,
};
use feedforge_storage::Storage;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::due::{DueGate, SourceState, is_due};
use crate::fetcher::FeedFetcher;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of fetching one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: SourceId,
    pub name: String,
    /// Entries the feed listed.
    pub discovered: usize,
    /// Entries not seen before.
    pub new_items: usize,
    pub jobs_enqueued: usize,
    /// Set when the fetch failed; the failure streak was incremented.
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one scheduler cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub due: usize,
    pub fetched: usize,
    pub failed: usize,
    pub new_items: usize,
    pub jobs_enqueued: usize,
    /// Due sources left alone because a fetch was already running.
    pub skipped_busy: usize,
    /// (source id, error message)
    pub errors: Vec<(String, String)>,
    #[serde(skip)]
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Progress callback for scheduler cycles.
pub trait CycleProgress: Send + Sync {
    /// Called once the due set is known.
    fn cycle_started(&self, due: usize);
    /// Called after each source finishes, in completion order.
    fn source_finished(&self, current: usize, total: usize, outcome: &SourceOutcome);
}

/// No-op progress for headless runs.
pub struct SilentProgress;

impl CycleProgress for SilentProgress {
    fn cycle_started(&self, _due: usize) {}
    fn source_finished(&self, _current: usize, _total: usize, _outcome: &SourceOutcome) {}
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Inner {
    storage: Arc<Storage>,
    channel: QueueChannel,
    fetcher: Arc<dyn FeedFetcher>,
    config: SchedulerConfig,
    states: Mutex<HashMap<SourceId, SourceState>>,
}

/// Polls due sources and feeds new items into the queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        channel: QueueChannel,
        fetcher: Arc<dyn FeedFetcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                channel,
                fetcher,
                config,
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Current state of a source in this scheduler.
    pub fn state_of(&self, id: &SourceId) -> SourceState {
        self.states()
            .get(id)
            .copied()
            .unwrap_or(SourceState::Idle)
    }

    /// Run one cycle over all active sources.
    #[instrument(skip_all, fields(force = force))]
    pub async fn run_cycle(&self, force: bool, progress: &dyn CycleProgress) -> Result<CycleReport> {
        let start = Instant::now();
        let now = Utc::now();
        let gate = DueGate::from(&self.inner.config);

        let mut report = CycleReport::default();
        let mut due: Vec<Source> = Vec::new();
        for source in self.inner.storage.list_active_sources().await? {
            if !is_due(&source, now, &gate, force) {
                continue;
            }
            if self.claim(&source.id) {
                due.push(source);
            } else {
                report.skipped_busy += 1;
            }
        }
        report.due = due.len();
        progress.cycle_started(due.len());

        info!(
            due = due.len(),
            batch_size = self.inner.config.batch_size,
            "starting scheduler cycle"
        );

        let total = due.len();
        let mut done = 0;
        let batch_size = self.inner.config.batch_size.max(1);
        let mut pending = due.into_iter().peekable();

        while pending.peek().is_some() {
            if done > 0 && !self.inner.config.inter_batch_pause.is_zero() {
                tokio::time::sleep(self.inner.config.inter_batch_pause).await;
            }

            let chunk: Vec<Source> = pending.by_ref().take(batch_size).collect();
            let ids: Vec<SourceId> = chunk.iter().map(|s| s.id.clone()).collect();

            let mut set = JoinSet::new();
            for source in chunk {
                let this = self.clone();
                set.spawn(async move { this.fetch_source(source).await });
            }

            while let Some(joined) = set.join_next().await {
                done += 1;
                match joined {
                    Ok(outcome) => {
                        progress.source_finished(done, total, &outcome);
                        tally(&mut report, outcome);
                    }
                    Err(e) => {
                        warn!(error = %e, "fetch task aborted");
                        report.failed += 1;
                        report.errors.push((String::new(), e.to_string()));
                    }
                }
            }

            for id in &ids {
                self.release(id);
            }
        }

        report.duration = start.elapsed();
        info!(
            fetched = report.fetched,
            failed = report.failed,
            new_items = report.new_items,
            jobs = report.jobs_enqueued,
            duration_ms = report.duration.as_millis() as u64,
            "scheduler cycle finished"
        );
        Ok(report)
    }

    /// Fetch one source now, ignoring the failure and quality gates.
    ///
    /// Returns `Ok(None)` when the source is inactive, its minimum interval
    /// has not elapsed, or a fetch is already running.
    pub async fn trigger_fetch(&self, id: &SourceId) -> Result<Option<SourceOutcome>> {
        let source = self
            .inner
            .storage
            .get_source(id)
            .await?
            .ok_or_else(|| FeedforgeError::NotFound(format!("source {id}")))?;

        let gate = DueGate::from(&self.inner.config);
        if !is_due(&source, Utc::now(), &gate, true) {
            debug!(source = %id, "manual fetch skipped: not due");
            return Ok(None);
        }
        if !self.claim(id) {
            debug!(source = %id, "manual fetch skipped: already fetching");
            return Ok(None);
        }

        let outcome = self.fetch_source(source).await;
        self.release(id);
        Ok(Some(outcome))
    }

    /// Fetch and ingest one claimed source. Failures are recorded on the
    /// source, not returned.
    #[instrument(skip_all, fields(source = %source.id, url = %source.url))]
    async fn fetch_source(&self, source: Source) -> SourceOutcome {
        self.set_state(&source.id, SourceState::Fetching);

        let mut outcome = SourceOutcome {
            source_id: source.id.clone(),
            name: source.name.clone(),
            discovered: 0,
            new_items: 0,
            jobs_enqueued: 0,
            error: None,
        };

        let timeout = self.inner.config.fetch_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.fetcher.fetch(&source)).await
        {
            Ok(Ok(items)) => self.ingest(&source, items, &mut outcome).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FeedforgeError::Network(format!(
                "fetch timed out after {}s",
                timeout.as_secs_f64()
            ))),
        };

        match result {
            Ok(()) => {
                self.set_state(&source.id, SourceState::Fetched);
                debug!(
                    new_items = outcome.new_items,
                    jobs = outcome.jobs_enqueued,
                    "source fetched"
                );
            }
            Err(e) => {
                let message = e.to_string();
                match self
                    .inner
                    .storage
                    .record_fetch_failure(&source.id, &message)
                    .await
                {
                    Ok(streak) if streak >= self.inner.config.failure_threshold => {
                        warn!(streak, error = %message, "source excluded until reset");
                    }
                    Ok(streak) => warn!(streak, error = %message, "source fetch failed"),
                    Err(store_err) => {
                        warn!(error = %store_err, "could not record fetch failure");
                    }
                }
                self.set_state(&source.id, SourceState::Failed);
                outcome.error = Some(message);
            }
        }
        outcome
    }

    async fn ingest(
        &self,
        source: &Source,
        items: Vec<DiscoveredItem>,
        outcome: &mut SourceOutcome,
    ) -> Result<()> {
        outcome.discovered = items.len();

        let mut inserted = Vec::new();
        if let Err(e) = self.stage(&items, &mut inserted, outcome).await {
            // Items without a job would read as duplicates on every later
            // fetch; forget them so the next due cycle picks them up again.
            if let Err(undo) = self.inner.storage.delete_items(&inserted).await {
                warn!(error = %undo, count = inserted.len(), "could not roll back staged items");
            }
            outcome.new_items = 0;
            outcome.jobs_enqueued = 0;
            return Err(e);
        }

        self.inner
            .storage
            .record_fetch_success(&source.id, Utc::now())
            .await
    }

    /// Insert unseen items and enqueue one `process` job per inserted guid.
    /// `inserted` collects the guids written so far, even on error.
    async fn stage(
        &self,
        items: &[DiscoveredItem],
        inserted: &mut Vec<String>,
        outcome: &mut SourceOutcome,
    ) -> Result<()> {
        let mut jobs = Vec::new();
        for item in items {
            if self.inner.storage.insert_item(item).await? {
                inserted.push(item.guid.clone());
                jobs.push(Job::process(item, self.inner.config.job_max_attempts));
            }
        }
        outcome.new_items = jobs.len();

        if !jobs.is_empty() {
            outcome.jobs_enqueued = self
                .inner
                .channel
                .send_batch(jobs)
                .await
                .map_err(|e| FeedforgeError::Queue(e.to_string()))?;
        }
        Ok(())
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<SourceId, SourceState>> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Move an idle source to `Due`. False if it is already in a cycle.
    fn claim(&self, id: &SourceId) -> bool {
        let mut states = self.states();
        match states.get(id) {
            Some(state) if *state != SourceState::Idle => false,
            _ => {
                states.insert(id.clone(), SourceState::Due);
                true
            }
        }
    }

    fn set_state(&self, id: &SourceId, state: SourceState) {
        self.states().insert(id.clone(), state);
    }

    fn release(&self, id: &SourceId) {
        self.states().remove(id);
    }
}

fn tally(report: &mut CycleReport, outcome: SourceOutcome) {
    report.new_items += outcome.new_items;
    report.jobs_enqueued += outcome.jobs_enqueued;
    match outcome.error {
        None => report.fetched += 1,
        Some(error) => {
            report.failed += 1;
            report.errors.push((outcome.source_id.to_string(), error));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
