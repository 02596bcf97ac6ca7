//! Queue consumer: turns `process` jobs into stored artifacts and `fetch`
//! jobs into manual source fetches.

use std::sync::Arc;

use feedforge_artifacts::ContentStore;
use feedforge_dispatch::{
    CallController, CallError, CompletionClient, CompletionRequest, select_tier,
};
use feedforge_queue::{DeliveryReport, QueueChannel, QueueError};
use feedforge_scheduler::Scheduler;
use feedforge_shared::{DiscoveredItem, FeedforgeError, Job, JobKind, SourceId, content_hash};
use feedforge_storage::Storage;
use tracing::{debug, info, instrument, warn};

const SYSTEM_PROMPT: &str = "You summarize news items. Reply with a concise, factual \
summary of the item in a few sentences, without preamble.";

/// Content beyond this many characters is cut before prompting.
const MAX_CONTENT_CHARS: usize = 48_000;

/// Drains the queue one leased batch at a time.
#[derive(Clone)]
pub struct ProcessingWorker {
    storage: Arc<Storage>,
    channel: QueueChannel,
    controller: CallController<dyn CompletionClient>,
    store: Arc<ContentStore>,
    scheduler: Scheduler,
}

impl ProcessingWorker {
    pub fn new(
        storage: Arc<Storage>,
        channel: QueueChannel,
        controller: CallController<dyn CompletionClient>,
        store: Arc<ContentStore>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            storage,
            channel,
            controller,
            store,
            scheduler,
        }
    }

    /// Lease one batch and handle every job in it.
    #[instrument(skip_all)]
    pub async fn run_once(&self) -> Result<DeliveryReport, QueueError> {
        let report = self.channel.receive(|job| self.handle(job)).await?;
        if !report.is_empty() {
            info!(
                delivered = report.delivered,
                acked = report.acked.len(),
                requeued = report.requeued.len(),
                dead_lettered = report.dead_lettered.len(),
                "worker batch settled"
            );
        }
        for failure in &report.failures {
            warn!(job_id = %failure.job_id, error = %failure.error, "job handler failed");
        }
        Ok(report)
    }

    async fn handle(&self, job: Job) -> Result<(), QueueError> {
        match job.kind {
            JobKind::Process => self.process(&job).await,
            JobKind::Fetch => self.fetch(&job).await,
        }
    }

    async fn process(&self, job: &Job) -> Result<(), QueueError> {
        let guid = job
            .payload_str("guid")
            .ok_or_else(|| QueueError::fatal("process job without guid"))?;

        let item = self
            .storage
            .get_item(guid)
            .await
            .map_err(job_error)?
            .ok_or_else(|| QueueError::fatal(format!("item {guid} does not exist")))?;

        if let Some(hash) = &item.artifact_hash {
            debug!(guid, hash = %hash, "item already processed");
            return Ok(());
        }

        let quality = self
            .storage
            .get_source(&item.source_id)
            .await
            .map_err(job_error)?
            .map(|s| s.quality_score)
            .unwrap_or(0.0);

        let request = CompletionRequest {
            prompt: build_prompt(&item),
            system: Some(SYSTEM_PROMPT.to_string()),
            tier: select_tier(item.raw_content.len(), quality),
        };
        let outcome = self
            .controller
            .submit(request, priority_for(quality))
            .await
            .map_err(call_error)?;

        let bytes = outcome.response.text.as_bytes();
        let hash = content_hash(bytes);
        let metadata = serde_json::json!({
            "guid": item.guid,
            "source_id": item.source_id.to_string(),
            "model": outcome.response.model,
            "input_tokens": outcome.response.input_tokens,
            "output_tokens": outcome.response.output_tokens,
            "retry_count": outcome.retry_count,
        });
        self.store
            .store_shared(&hash, bytes, Some(metadata))
            .await
            .map_err(job_error)?;
        self.storage
            .set_item_artifact(guid, &hash)
            .await
            .map_err(job_error)?;

        debug!(
            guid,
            hash = %hash,
            latency_ms = outcome.latency.as_millis() as u64,
            "item processed"
        );
        Ok(())
    }

    async fn fetch(&self, job: &Job) -> Result<(), QueueError> {
        let raw = job
            .payload_str("source_id")
            .ok_or_else(|| QueueError::fatal("fetch job without source_id"))?;
        let id: SourceId = raw
            .parse()
            .map_err(|e| QueueError::fatal(format!("invalid source id '{raw}': {e}")))?;

        // Fetch failures are recorded on the source and retried by the
        // next due cycle, so only lookup/storage errors fail the job.
        match self.scheduler.trigger_fetch(&id).await {
            Ok(_) => Ok(()),
            Err(FeedforgeError::NotFound(what)) => {
                Err(QueueError::fatal(format!("{what} does not exist")))
            }
            Err(e) => Err(job_error(e)),
        }
    }
}

/// Higher quality sources are summarized first.
fn priority_for(quality: f64) -> i32 {
    (quality.clamp(0.0, 1.0) * 100.0).round() as i32
}

fn build_prompt(item: &DiscoveredItem) -> String {
    let mut prompt = format!("Title: {}\n", item.title);
    if !item.link.is_empty() {
        prompt.push_str(&format!("Link: {}\n", item.link));
    }
    prompt.push('\n');
    prompt.push_str(&truncate_content(&item.raw_content, MAX_CONTENT_CHARS));
    prompt
}

fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((idx, _)) => format!("{}\n\n[... content truncated ...]", &content[..idx]),
    }
}

/// Transient failures go back to the queue, everything else dead-letters.
fn job_error(e: FeedforgeError) -> QueueError {
    if e.is_transient() {
        QueueError::retryable(e.to_string())
    } else {
        QueueError::fatal(e.to_string())
    }
}

fn call_error(e: CallError) -> QueueError {
    match e {
        CallError::Failed { ref error, .. } if error.class.is_retryable() => {
            QueueError::Retryable {
                message: e.to_string(),
                delay: error.retry_after,
            }
        }
        CallError::Failed { .. } => QueueError::fatal(e.to_string()),
        CallError::Cancelled | CallError::Shutdown => QueueError::retryable(e.to_string()),
    }
}
