//! Application configuration for feedforge.
//!
//! User config lives at `~/.feedforge/feedforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedforgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "feedforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".feedforge";

// ---------------------------------------------------------------------------
// Config structs (matching feedforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub completion: CompletionSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Root directory of the filesystem blob backend.
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blob_dir: default_blob_dir(),
        }
    }
}

fn default_db_path() -> String {
    "var/feedforge.db".into()
}
fn default_blob_dir() -> String {
    "var/blobs".into()
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Sources fetched in parallel per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Pause between two fetch batches.
    #[serde(default = "default_inter_batch_pause")]
    pub inter_batch_pause_ms: u64,

    /// Failure streak at which a source stops being scheduled.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sources scoring below this are skipped unless forced.
    #[serde(default)]
    pub min_quality_score: f64,

    /// How often the runtime evaluates due sources.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fetch_timeout_secs: default_fetch_timeout(),
            inter_batch_pause_ms: default_inter_batch_pause(),
            failure_threshold: default_failure_threshold(),
            min_quality_score: 0.0,
            tick_interval_secs: default_tick_interval(),
        }
    }
}

fn default_batch_size() -> usize {
    8
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_inter_batch_pause() -> u64 {
    500
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_tick_interval() -> u64 {
    60
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Hard cap on a serialized job.
    #[serde(default = "default_max_job_bytes")]
    pub max_job_bytes: usize,

    /// Deliveries before a job is dead-lettered.
    #[serde(default = "default_job_attempts")]
    pub max_attempts: u32,

    /// Jobs leased per `receive` call.
    #[serde(default = "default_receive_batch")]
    pub receive_batch: usize,

    /// Seconds a leased job stays invisible before redelivery.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_job_bytes: default_max_job_bytes(),
            max_attempts: default_job_attempts(),
            receive_batch: default_receive_batch(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_max_job_bytes() -> usize {
    64 * 1024
}
fn default_job_attempts() -> u32 {
    5
}
fn default_receive_batch() -> usize {
    16
}
fn default_lease_secs() -> u64 {
    300
}

/// `[completion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSection {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Simultaneous in-flight completion calls.
    #[serde(default = "default_completion_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default)]
    pub models: ModelsSection,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            endpoint: default_endpoint(),
            concurrency: default_completion_concurrency(),
            call_timeout_secs: default_call_timeout(),
            models: ModelsSection::default(),
        }
    }
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".into()
}
fn default_completion_concurrency() -> usize {
    3
}
fn default_call_timeout() -> u64 {
    60
}

/// `[completion.models]`: model id per tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsSection {
    #[serde(default = "default_fast_model")]
    pub fast: String,
    #[serde(default = "default_balanced_model")]
    pub balanced: String,
    #[serde(default = "default_accurate_model")]
    pub accurate: String,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            balanced: default_balanced_model(),
            accurate: default_accurate_model(),
        }
    }
}

fn default_fast_model() -> String {
    "claude-3-5-haiku-latest".into()
}
fn default_balanced_model() -> String {
    "claude-sonnet-4-0".into()
}
fn default_accurate_model() -> String {
    "claude-opus-4-0".into()
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Attempts per completion call, including the first.
    #[serde(default = "default_call_attempts")]
    pub max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_call_attempts(),
        }
    }
}

fn default_base_delay() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    60_000
}
fn default_call_attempts() -> u32 {
    4
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// How long an unreferenced artifact is kept before collection.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

fn default_retention() -> u64 {
    7 * 24 * 3600
}
fn default_gc_interval() -> u64 {
    3600
}

/// `[runtime]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Processing worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Idle sleep between two empty `receive` calls.
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            idle_poll_ms: default_idle_poll(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_idle_poll() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    pub inter_batch_pause: Duration,
    pub failure_threshold: u32,
    pub min_quality_score: f64,
    /// Attempts given to each `process` job the scheduler enqueues.
    pub job_max_attempts: u32,
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.scheduler.batch_size.max(1),
            fetch_timeout: Duration::from_secs(config.scheduler.fetch_timeout_secs),
            inter_batch_pause: Duration::from_millis(config.scheduler.inter_batch_pause_ms),
            failure_threshold: config.scheduler.failure_threshold,
            min_quality_score: config.scheduler.min_quality_score,
            job_max_attempts: config.queue.max_attempts,
        }
    }
}

/// Runtime queue channel configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_job_bytes: usize,
    pub receive_batch: usize,
    pub lease: Duration,
}

impl From<&AppConfig> for QueueConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_job_bytes: config.queue.max_job_bytes,
            receive_batch: config.queue.receive_batch.max(1),
            lease: Duration::from_secs(config.queue.lease_secs),
        }
    }
}

/// Runtime retry policy parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl From<&AppConfig> for RetryConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            multiplier: config.retry.multiplier,
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            max_attempts: config.retry.max_attempts,
        }
    }
}

/// Runtime bounded call controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub concurrency: usize,
    pub call_timeout: Duration,
}

impl From<&AppConfig> for ControllerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.completion.concurrency.max(1),
            call_timeout: Duration::from_secs(config.completion.call_timeout_secs),
        }
    }
}

/// Runtime content store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub retention: Duration,
    pub gc_interval: Duration,
}

impl From<&AppConfig> for StoreConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            retention: Duration::from_secs(config.store.retention_secs),
            gc_interval: Duration::from_secs(config.store.gc_interval_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.feedforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| FeedforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.feedforge/feedforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| FeedforgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| FeedforgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| FeedforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| FeedforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| FeedforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the completion API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.completion.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(FeedforgeError::config(format!(
            "completion API key not found. Set the {var_name} environment variable."
        ))),
    }
}
