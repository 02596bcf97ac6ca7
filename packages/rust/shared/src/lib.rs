//! Shared types, error model, and configuration for feedforge.
//!
//! This crate is the foundation depended on by all other feedforge crates.
//! It provides:
//! - [`FeedforgeError`], the unified error type
//! - Domain types ([`Source`], [`DiscoveredItem`], [`Job`], [`SharedArtifact`], [`ConsumerReference`])
//! - Configuration ([`AppConfig`], runtime configs, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CompletionSection, ControllerConfig, ModelsSection, QueueConfig, RetryConfig,
    SchedulerConfig, StoreConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, validate_api_key,
};
pub use error::{FeedforgeError, Result};
pub use types::{
    ConsumerReference, DeadLetter, DiscoveredItem, Job, JobKind, NewSource, SharedArtifact,
    Source, SourceId, SourceUpdate, content_hash,
};
