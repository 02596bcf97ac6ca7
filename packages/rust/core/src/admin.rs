//! Administrative operations behind capability checks.
//!
//! Every operation is an [`AdminOp`] variant; [`AdminOp::required_capability`]
//! maps it to exactly one [`Capability`] by exhaustive match, so a new
//! operation cannot compile without deciding who may run it.

use std::collections::HashSet;
use std::sync::Arc;

use feedforge_scheduler::{Scheduler, SourceOutcome};
use feedforge_shared::{FeedforgeError, NewSource, Source, SourceId, SourceUpdate};
use feedforge_storage::Storage;
use serde::Serialize;
use tracing::info;

use crate::health::{HealthReport, HealthService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Source,
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Reset,
    Trigger,
    Read,
}

/// One (resource, action) permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Capability {
    pub resource: Resource,
    pub action: Action,
}

impl Capability {
    pub const fn new(resource: Resource, action: Action) -> Self {
        Self { resource, action }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resource = match self.resource {
            Resource::Source => "source",
            Resource::Stats => "stats",
        };
        let action = match self.action {
            Action::Create => "create",
            Action::Update => "update",
            Action::Reset => "reset",
            Action::Trigger => "trigger",
            Action::Read => "read",
        };
        write!(f, "{resource}:{action}")
    }
}

/// Capabilities granted to a caller.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    granted: HashSet<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capability an operator needs.
    pub fn operator() -> Self {
        [
            Capability::new(Resource::Source, Action::Create),
            Capability::new(Resource::Source, Action::Update),
            Capability::new(Resource::Source, Action::Reset),
            Capability::new(Resource::Source, Action::Trigger),
            Capability::new(Resource::Source, Action::Read),
            Capability::new(Resource::Stats, Action::Read),
        ]
        .into_iter()
        .collect()
    }

    pub fn read_only() -> Self {
        [
            Capability::new(Resource::Source, Action::Read),
            Capability::new(Resource::Stats, Action::Read),
        ]
        .into_iter()
        .collect()
    }

    pub fn grant(mut self, capability: Capability) -> Self {
        self.granted.insert(capability);
        self
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            granted: iter.into_iter().collect(),
        }
    }
}

/// The closed set of administrative operations.
#[derive(Debug, Clone)]
pub enum AdminOp {
    CreateSource(NewSource),
    UpdateSource { id: SourceId, update: SourceUpdate },
    ResetFailures(SourceId),
    TriggerFetch(SourceId),
    ListSources,
    ReadStats,
}

impl AdminOp {
    pub fn required_capability(&self) -> Capability {
        match self {
            Self::CreateSource(_) => Capability::new(Resource::Source, Action::Create),
            Self::UpdateSource { .. } => Capability::new(Resource::Source, Action::Update),
            Self::ResetFailures(_) => Capability::new(Resource::Source, Action::Reset),
            Self::TriggerFetch(_) => Capability::new(Resource::Source, Action::Trigger),
            Self::ListSources => Capability::new(Resource::Source, Action::Read),
            Self::ReadStats => Capability::new(Resource::Stats, Action::Read),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AdminOutcome {
    Source(Source),
    Sources(Vec<Source>),
    Reset(SourceId),
    /// `None` when the source was not due or already fetching.
    Fetch(Option<SourceOutcome>),
    Stats(Box<HealthReport>),
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("missing capability {0}")]
    Forbidden(Capability),

    #[error(transparent)]
    Core(#[from] FeedforgeError),
}

/// Entry point for the excluded admin/CRUD layer.
#[derive(Clone)]
pub struct Admin {
    storage: Arc<Storage>,
    scheduler: Scheduler,
    health: HealthService,
}

impl Admin {
    pub fn new(storage: Arc<Storage>, scheduler: Scheduler, health: HealthService) -> Self {
        Self {
            storage,
            scheduler,
            health,
        }
    }

    pub async fn execute(
        &self,
        op: AdminOp,
        capabilities: &CapabilitySet,
    ) -> Result<AdminOutcome, AdminError> {
        let required = op.required_capability();
        if !capabilities.allows(required) {
            return Err(AdminError::Forbidden(required));
        }

        let outcome = match op {
            AdminOp::CreateSource(new) => {
                let source = self.storage.insert_source(&new).await?;
                info!(source = %source.id, url = %source.url, "source created");
                AdminOutcome::Source(source)
            }
            AdminOp::UpdateSource { id, update } => {
                AdminOutcome::Source(self.storage.update_source(&id, &update).await?)
            }
            AdminOp::ResetFailures(id) => {
                self.storage.reset_source_failures(&id).await?;
                info!(source = %id, "failure streak reset");
                AdminOutcome::Reset(id)
            }
            AdminOp::TriggerFetch(id) => AdminOutcome::Fetch(self.scheduler.trigger_fetch(&id).await?),
            AdminOp::ListSources => AdminOutcome::Sources(self.storage.list_sources().await?),
            AdminOp::ReadStats => AdminOutcome::Stats(Box::new(self.health.report().await?)),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use feedforge_artifacts::{ContentStore, MemoryBlobStore};
    use feedforge_dispatch::{
        CallController, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
        RetryPolicy,
    };
    use feedforge_queue::{MemoryQueue, QueueChannel};
    use feedforge_scheduler::FeedFetcher;
    use feedforge_shared::{
        ControllerConfig, DiscoveredItem, QueueConfig, Result as FfResult, SchedulerConfig,
    };
    use uuid::Uuid;

    use super::*;

    struct Unused;

    #[async_trait]
    impl CompletionClient for Unused {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> std::result::Result<CompletionResponse, CompletionError> {
            unreachable!("admin never calls the completion API")
        }
    }

    struct EmptyFeed;

    #[async_trait]
    impl FeedFetcher for EmptyFeed {
        async fn fetch(&self, _source: &Source) -> FfResult<Vec<DiscoveredItem>> {
            Ok(Vec::new())
        }
    }

    async fn admin() -> Admin {
        let tmp = std::env::temp_dir().join(format!("ff_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        let channel = QueueChannel::new(
            Arc::new(MemoryQueue::new()),
            QueueConfig {
                max_job_bytes: 64 * 1024,
                receive_batch: 8,
                lease: Duration::from_secs(60),
            },
        );
        let client: Arc<dyn CompletionClient> = Arc::new(Unused);
        let controller = CallController::new(
            client,
            RetryPolicy::default(),
            ControllerConfig {
                concurrency: 1,
                call_timeout: Duration::from_secs(1),
            },
        );
        let store = Arc::new(ContentStore::new(
            storage.clone(),
            Arc::new(MemoryBlobStore::new()),
        ));
        let scheduler = Scheduler::new(
            storage.clone(),
            channel.clone(),
            Arc::new(EmptyFeed),
            SchedulerConfig {
                batch_size: 2,
                fetch_timeout: Duration::from_secs(1),
                inter_batch_pause: Duration::ZERO,
                failure_threshold: 2,
                min_quality_score: 0.0,
                job_max_attempts: 3,
            },
        );
        let health = HealthService::new(storage.clone(), channel, controller, store, 2);
        Admin::new(storage, scheduler, health)
    }

    fn new_source() -> NewSource {
        NewSource {
            url: "https://blog.example.org/atom.xml".into(),
            name: "Blog".into(),
            min_fetch_interval_secs: 600,
            quality_score: 0.4,
        }
    }

    #[test]
    fn every_op_maps_to_a_capability() {
        let id = SourceId::new();
        let ops = [
            AdminOp::CreateSource(new_source()),
            AdminOp::UpdateSource {
                id: id.clone(),
                update: SourceUpdate::default(),
            },
            AdminOp::ResetFailures(id.clone()),
            AdminOp::TriggerFetch(id),
            AdminOp::ListSources,
            AdminOp::ReadStats,
        ];
        let operator = CapabilitySet::operator();
        for op in &ops {
            assert!(operator.allows(op.required_capability()), "{op:?}");
        }
        assert_eq!(
            AdminOp::ReadStats.required_capability().to_string(),
            "stats:read"
        );
    }

    #[tokio::test]
    async fn read_only_cannot_mutate() {
        let admin = admin().await;
        let err = admin
            .execute(AdminOp::CreateSource(new_source()), &CapabilitySet::read_only())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdminError::Forbidden(Capability {
                resource: Resource::Source,
                action: Action::Create
            })
        ));

        let listed = admin
            .execute(AdminOp::ListSources, &CapabilitySet::read_only())
            .await
            .unwrap();
        assert!(matches!(listed, AdminOutcome::Sources(ref s) if s.is_empty()));
    }

    #[tokio::test]
    async fn operator_lifecycle() {
        let admin = admin().await;
        let caps = CapabilitySet::operator();

        // No interval, so the trigger below runs right after the failures.
        let create = AdminOp::CreateSource(NewSource {
            min_fetch_interval_secs: 0,
            ..new_source()
        });
        let AdminOutcome::Source(source) = admin
            .execute(create, &caps)
            .await
            .unwrap()
        else {
            panic!("expected a source");
        };

        // Two failures reach the threshold of 2.
        admin.storage.record_fetch_failure(&source.id, "boom").await.unwrap();
        admin.storage.record_fetch_failure(&source.id, "boom").await.unwrap();
        let AdminOutcome::Stats(report) =
            admin.execute(AdminOp::ReadStats, &caps).await.unwrap()
        else {
            panic!("expected stats");
        };
        assert_eq!(report.sources_excluded, 1);

        admin
            .execute(AdminOp::ResetFailures(source.id.clone()), &caps)
            .await
            .unwrap();
        let after = admin.storage.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(after.consecutive_failure_count, 0);

        let AdminOutcome::Fetch(Some(outcome)) = admin
            .execute(AdminOp::TriggerFetch(source.id.clone()), &caps)
            .await
            .unwrap()
        else {
            panic!("expected a fetch");
        };
        assert!(outcome.is_success());

        let AdminOutcome::Source(updated) = admin
            .execute(
                AdminOp::UpdateSource {
                    id: source.id.clone(),
                    update: SourceUpdate {
                        active: Some(false),
                        ..SourceUpdate::default()
                    },
                },
                &caps,
            )
            .await
            .unwrap()
        else {
            panic!("expected a source");
        };
        assert!(!updated.active);
    }

    #[tokio::test]
    async fn grant_extends_a_set() {
        let admin = admin().await;
        let caps = CapabilitySet::new().grant(Capability::new(Resource::Stats, Action::Read));
        assert!(admin.execute(AdminOp::ReadStats, &caps).await.is_ok());
        assert!(admin.execute(AdminOp::ListSources, &caps).await.is_err());
    }
}
