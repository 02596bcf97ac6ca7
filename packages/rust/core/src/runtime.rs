//! Composition root: wires the subsystems together and runs their loops.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use feedforge_artifacts::{BlobStore, ContentStore, FsBlobStore};
use feedforge_dispatch::{CallController, CompletionClient, RetryPolicy};
use feedforge_queue::{QueueBackend, QueueChannel};
use feedforge_scheduler::{FeedFetcher, HttpFeedFetcher, Scheduler, SilentProgress};
use feedforge_shared::{
    AppConfig, ControllerConfig, FeedforgeError, QueueConfig, Result, RetryConfig,
    SchedulerConfig, StoreConfig,
};
use feedforge_storage::Storage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admin::Admin;
use crate::health::HealthService;
use crate::worker::ProcessingWorker;

/// Every long-lived subsystem, constructed once.
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<Storage>,
    pub channel: QueueChannel,
    pub controller: CallController<dyn CompletionClient>,
    pub store: Arc<ContentStore>,
    pub scheduler: Scheduler,
    pub health: HealthService,
}

impl Services {
    /// Wire the subsystems over the given backends.
    pub fn assemble(
        config: &AppConfig,
        storage: Arc<Storage>,
        queue: Arc<dyn QueueBackend>,
        client: Arc<dyn CompletionClient>,
        fetcher: Arc<dyn FeedFetcher>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let scheduler_config = SchedulerConfig::from(config);
        let failure_threshold = scheduler_config.failure_threshold;

        let channel = QueueChannel::new(queue, QueueConfig::from(config));
        let controller = CallController::new(
            client,
            RetryPolicy::from(&RetryConfig::from(config)),
            ControllerConfig::from(config),
        );
        let store = Arc::new(ContentStore::new(storage.clone(), blobs));
        let scheduler = Scheduler::new(
            storage.clone(),
            channel.clone(),
            fetcher,
            scheduler_config,
        );
        let health = HealthService::new(
            storage.clone(),
            channel.clone(),
            controller.clone(),
            store.clone(),
            failure_threshold,
        );

        Self {
            storage,
            channel,
            controller,
            store,
            scheduler,
            health,
        }
    }

    /// Durable wiring: jobs in the database, blobs under `storage.blob_dir`,
    /// feeds over HTTP.
    pub async fn open(config: &AppConfig, client: Arc<dyn CompletionClient>) -> Result<Self> {
        let storage = Arc::new(Storage::open(Path::new(&config.storage.db_path)).await?);
        let fetcher = HttpFeedFetcher::new(Duration::from_secs(
            config.scheduler.fetch_timeout_secs,
        ))?;
        let blobs = FsBlobStore::new(&config.storage.blob_dir);
        let queue: Arc<dyn QueueBackend> = storage.clone();

        Ok(Self::assemble(
            config,
            storage,
            queue,
            client,
            Arc::new(fetcher),
            Arc::new(blobs),
        ))
    }

    pub fn worker(&self) -> ProcessingWorker {
        ProcessingWorker::new(
            self.storage.clone(),
            self.channel.clone(),
            self.controller.clone(),
            self.store.clone(),
            self.scheduler.clone(),
        )
    }

    pub fn admin(&self) -> Admin {
        Admin::new(
            self.storage.clone(),
            self.scheduler.clone(),
            self.health.clone(),
        )
    }
}

/// Loop timing for [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub tick_interval: Duration,
    pub idle_poll: Duration,
    pub store: StoreConfig,
}

impl From<&AppConfig> for RuntimeSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.runtime.workers.max(1),
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs.max(1)),
            idle_poll: Duration::from_millis(config.runtime.idle_poll_ms.max(10)),
            store: StoreConfig::from(config),
        }
    }
}

/// Runs the scheduler tick, the worker loops and orphan collection until
/// [`Runtime::stop`].
pub struct Runtime {
    services: Services,
    settings: RuntimeSettings,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(services: Services, settings: RuntimeSettings) -> Self {
        Self {
            services,
            settings,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Spawn every loop. Fails if already started.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(FeedforgeError::validation("runtime already started"));
        }

        let (tx, rx) = watch::channel(false);

        self.tasks.push(tokio::spawn(scheduler_loop(
            self.services.scheduler.clone(),
            self.settings.tick_interval,
            rx.clone(),
        )));
        for index in 0..self.settings.workers {
            self.tasks.push(tokio::spawn(worker_loop(
                index,
                self.services.worker(),
                self.settings.idle_poll,
                rx.clone(),
            )));
        }
        self.tasks.push(tokio::spawn(gc_loop(
            self.services.store.clone(),
            self.settings.store.clone(),
            rx,
        )));

        self.shutdown = Some(tx);
        self.services.health.set_running(true);
        info!(
            workers = self.settings.workers,
            tick_secs = self.settings.tick_interval.as_secs(),
            "runtime started"
        );
        Ok(())
    }

    /// Signal every loop and wait for it to finish its current step.
    pub async fn stop(&mut self) {
        let Some(tx) = self.shutdown.take() else {
            return;
        };
        let _ = tx.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "runtime task ended abnormally");
            }
        }
        self.services.health.set_running(false);
        info!("runtime stopped");
    }
}

async fn scheduler_loop(scheduler: Scheduler, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = scheduler.run_cycle(false, &SilentProgress).await {
                    warn!(error = %e, "scheduler cycle failed");
                }
            }
        }
    }
    debug!("scheduler loop exited");
}

async fn worker_loop(
    index: usize,
    worker: ProcessingWorker,
    idle_poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let idle = match worker.run_once().await {
            Ok(report) => report.is_empty(),
            Err(e) => {
                warn!(worker = index, error = %e, "worker batch failed");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(idle_poll) => {}
            }
        }
    }
    debug!(worker = index, "worker loop exited");
}

async fn gc_loop(store: Arc<ContentStore>, config: StoreConfig, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(config.gc_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.collect_orphans(config.retention).await {
                    warn!(error = %e, "orphan collection failed");
                }
            }
        }
    }
    debug!("gc loop exited");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use feedforge_artifacts::MemoryBlobStore;
    use feedforge_dispatch::{CompletionError, CompletionRequest, CompletionResponse};
    use feedforge_queue::MemoryQueue;
    use feedforge_shared::{DiscoveredItem, NewSource, Result as FfResult, Source};
    use uuid::Uuid;

    use super::*;

    struct Echo;

    #[async_trait]
    impl CompletionClient for Echo {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> std::result::Result<CompletionResponse, CompletionError> {
            Ok(CompletionResponse {
                text: format!("summary: {}", request.prompt.lines().next().unwrap_or("")),
                model: "echo".into(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    struct TwoItems;

    #[async_trait]
    impl FeedFetcher for TwoItems {
        async fn fetch(&self, source: &Source) -> FfResult<Vec<DiscoveredItem>> {
            Ok(["one", "two"]
                .into_iter()
                .map(|n| DiscoveredItem {
                    guid: format!("{}-{n}", source.id),
                    source_id: source.id.clone(),
                    title: format!("Item {n}"),
                    link: String::new(),
                    raw_content: format!("content {n}"),
                    published_at: None,
                    artifact_hash: None,
                })
                .collect())
        }
    }

    async fn services() -> Services {
        let tmp = std::env::temp_dir().join(format!("ff_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        Services::assemble(
            &AppConfig::default(),
            storage,
            Arc::new(MemoryQueue::new()),
            Arc::new(Echo),
            Arc::new(TwoItems),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    fn fast_settings() -> RuntimeSettings {
        RuntimeSettings {
            workers: 2,
            tick_interval: Duration::from_millis(50),
            idle_poll: Duration::from_millis(10),
            store: StoreConfig {
                retention: Duration::from_secs(3600),
                gc_interval: Duration::from_secs(1),
            },
        }
    }

    #[tokio::test]
    async fn runtime_processes_fetched_items_end_to_end() {
        let services = services().await;
        let source = services
            .storage
            .insert_source(&NewSource {
                url: "https://feeds.example.com/rss".into(),
                name: "Feeds".into(),
                min_fetch_interval_secs: 3600,
                quality_score: 0.5,
            })
            .await
            .unwrap();

        let mut runtime = Runtime::new(services.clone(), fast_settings());
        runtime.start().unwrap();
        assert!(services.health.is_running());
        assert!(runtime.start().is_err(), "second start is rejected");

        let guid = format!("{}-one", source.id);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = services.storage.count_items().await.unwrap() == 2
                && services.channel.depth().await.unwrap() == 0
                && services
                    .storage
                    .get_item(&guid)
                    .await
                    .unwrap()
                    .is_some_and(|i| i.artifact_hash.is_some());
            if done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "pipeline stalled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        runtime.stop().await;
        assert!(!runtime.is_running());

        let report = services.health.report().await.unwrap();
        assert!(!report.running);
        assert_eq!(report.store.artifacts, 2);
        assert_eq!(report.queue_depth, 0);
        assert_eq!(report.dead_letters, 0);
        assert_eq!(report.controller.completed, 2);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let mut runtime = Runtime::new(services().await, fast_settings());
        runtime.stop().await;
        assert!(!runtime.is_running());
    }
}
