//! Health snapshot over the running subsystems.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use feedforge_artifacts::{ContentStore, StoreStats};
use feedforge_dispatch::{CallController, CompletionClient, ControllerStats};
use feedforge_queue::QueueChannel;
use feedforge_shared::{FeedforgeError, Result};
use feedforge_storage::Storage;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub running: bool,
    pub controller: ControllerStats,
    pub queue_depth: u64,
    pub dead_letters: u64,
    pub store: StoreStats,
    /// Active sources at or above the failure threshold.
    pub sources_excluded: u64,
    pub checked_at: DateTime<Utc>,
}

/// Injectable health service; one per runtime.
#[derive(Clone)]
pub struct HealthService {
    storage: Arc<Storage>,
    channel: QueueChannel,
    controller: CallController<dyn CompletionClient>,
    store: Arc<ContentStore>,
    failure_threshold: u32,
    running: Arc<AtomicBool>,
}

impl HealthService {
    pub fn new(
        storage: Arc<Storage>,
        channel: QueueChannel,
        controller: CallController<dyn CompletionClient>,
        store: Arc<ContentStore>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            storage,
            channel,
            controller,
            store,
            failure_threshold,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn report(&self) -> Result<HealthReport> {
        let queue_depth = self.channel.depth().await.map_err(queue_err)?;
        let dead_letters = self.channel.dead_letter_count().await.map_err(queue_err)?;

        Ok(HealthReport {
            running: self.is_running(),
            controller: self.controller.stats(),
            queue_depth,
            dead_letters,
            store: self.store.stats().await?,
            sources_excluded: self
                .storage
                .count_excluded_sources(self.failure_threshold)
                .await?,
            checked_at: Utc::now(),
        })
    }
}

fn queue_err(e: feedforge_queue::QueueError) -> FeedforgeError {
    FeedforgeError::Queue(e.to_string())
}
