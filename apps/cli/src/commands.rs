//! CLI command definitions, routing, and tracing setup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use feedforge_artifacts::FsBlobStore;
use feedforge_core::{AdminOp, AdminOutcome, CapabilitySet, Runtime, RuntimeSettings, Services};
use feedforge_dispatch::{CompletionClient, HttpCompletionClient};
use feedforge_queue::QueueBackend;
use feedforge_scheduler::{CycleProgress, CycleReport, HttpFeedFetcher, SourceOutcome};
use feedforge_shared::{
    AppConfig, NewSource, SourceId, StoreConfig, config_file_path, init_config, load_config,
    validate_api_key,
};
use feedforge_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// feedforge: poll feeds, summarize new items, store each result once.
#[derive(Parser)]
#[command(
    name = "feedforge",
    version,
    about = "Poll feed sources, summarize new items with a completion API, and store artifacts by content hash.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run scheduler, workers and orphan collection until Ctrl-C.
    Run,

    /// Run one scheduler cycle, or fetch a single source.
    Fetch {
        /// Fetch only this source (ignores the failure and quality gates).
        #[arg(long)]
        source: Option<String>,

        /// Ignore the failure and quality gates for every source.
        #[arg(long)]
        force: bool,
    },

    /// Manage feed sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Process queued jobs.
    Work {
        /// Handle a single leased batch and exit.
        #[arg(long)]
        once: bool,
    },

    /// Remove unreferenced artifacts past the retention window.
    Gc {
        /// Override `store.retention_secs`.
        #[arg(long)]
        retention_secs: Option<u64>,
    },

    /// Print the health report as JSON.
    Stats,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Source subcommands.
#[derive(Subcommand)]
pub(crate) enum SourceAction {
    /// Register a feed.
    Add {
        /// Feed URL (RSS, Atom or JSON Feed).
        url: String,

        /// Display name (defaults to the URL).
        #[arg(short, long)]
        name: Option<String>,

        /// Minimum seconds between fetches.
        #[arg(long, default_value = "900")]
        interval: u64,

        /// Quality score in [0, 1].
        #[arg(long, default_value = "0.5")]
        quality: f64,
    },
    /// List all sources.
    List,
    /// Clear a source's failure streak.
    Reset {
        /// Source id.
        id: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "feedforge=info",
        1 => "feedforge=debug",
        _ => "feedforge=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => cmd_run().await,
        Command::Fetch { source, force } => cmd_fetch(source.as_deref(), force).await,
        Command::Source { action } => match action {
            SourceAction::Add {
                url,
                name,
                interval,
                quality,
            } => cmd_source_add(url, name, interval, quality).await,
            SourceAction::List => cmd_source_list().await,
            SourceAction::Reset { id } => cmd_source_reset(&id).await,
        },
        Command::Work { once } => cmd_work(once).await,
        Command::Gc { retention_secs } => cmd_gc(retention_secs).await,
        Command::Stats => cmd_stats().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Completion client for commands that may call the API. Commands that never
/// do get a client without a key.
fn completion_client(config: &AppConfig, require_key: bool) -> Result<Arc<dyn CompletionClient>> {
    let key = if require_key {
        validate_api_key(config)?
    } else {
        validate_api_key(config).unwrap_or_default()
    };
    Ok(Arc::new(HttpCompletionClient::from_config(config, key)?))
}

async fn open_services(config: &AppConfig, require_key: bool) -> Result<Services> {
    let client = completion_client(config, require_key)?;
    Ok(Services::open(config, client).await?)
}

fn parse_source_id(raw: &str) -> Result<SourceId> {
    raw.parse()
        .map_err(|e| eyre!("invalid source id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run() -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, true).await?;
    let mut runtime = Runtime::new(services, RuntimeSettings::from(&config));

    runtime.start()?;
    println!("feedforge running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for Ctrl-C: {e}"))?;
    info!("shutdown requested");
    runtime.stop().await;
    Ok(())
}

async fn cmd_fetch(source: Option<&str>, force: bool) -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, false).await?;

    if let Some(raw) = source {
        let id = parse_source_id(raw)?;
        let outcome = services
            .admin()
            .execute(AdminOp::TriggerFetch(id), &CapabilitySet::operator())
            .await?;
        match outcome {
            AdminOutcome::Fetch(Some(outcome)) => print_outcome(&outcome),
            _ => println!("source {raw} is not due (minimum interval not elapsed or inactive)"),
        }
        return Ok(());
    }

    let progress = CliProgress::new();
    let report = services.scheduler.run_cycle(force, &progress).await?;
    progress.finish();
    print_cycle(&report);
    Ok(())
}

async fn cmd_source_add(
    url: String,
    name: Option<String>,
    interval: u64,
    quality: f64,
) -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, false).await?;
    let name = name.unwrap_or_else(|| url.clone());

    let op = AdminOp::CreateSource(NewSource {
        url,
        name,
        min_fetch_interval_secs: interval,
        quality_score: quality,
    });
    if let AdminOutcome::Source(source) = services
        .admin()
        .execute(op, &CapabilitySet::operator())
        .await?
    {
        println!("added source {} ({})", source.id, source.url);
    }
    Ok(())
}

async fn cmd_source_list() -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, false).await?;

    let AdminOutcome::Sources(sources) = services
        .admin()
        .execute(AdminOp::ListSources, &CapabilitySet::read_only())
        .await?
    else {
        return Err(eyre!("unexpected admin outcome"));
    };

    if sources.is_empty() {
        println!("no sources registered; add one with `feedforge source add <url>`");
        return Ok(());
    }
    for s in sources {
        let last = s
            .last_fetched_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".into());
        let status = if !s.active {
            "inactive".to_string()
        } else if s.consecutive_failure_count >= config.scheduler.failure_threshold {
            format!("excluded ({} failures)", s.consecutive_failure_count)
        } else {
            "active".to_string()
        };
        println!(
            "{}  {:<24} q={:.2} every {}s  last={}  {}",
            s.id, s.name, s.quality_score, s.min_fetch_interval_secs, last, status
        );
        if let Some(err) = s.last_error {
            println!("    last error: {err}");
        }
    }
    Ok(())
}

async fn cmd_source_reset(raw: &str) -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, false).await?;
    let id = parse_source_id(raw)?;
    services
        .admin()
        .execute(AdminOp::ResetFailures(id), &CapabilitySet::operator())
        .await?;
    println!("failure streak cleared for {raw}");
    Ok(())
}

async fn cmd_work(once: bool) -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, true).await?;
    let worker = services.worker();

    let (mut acked, mut requeued, mut dead) = (0, 0, 0);
    loop {
        let report = worker.run_once().await?;
        acked += report.acked.len();
        requeued += report.requeued.len();
        dead += report.dead_lettered.len();
        for failure in &report.failures {
            info!(job_id = %failure.job_id, error = %failure.error, "job failed");
        }
        if once || report.is_empty() {
            break;
        }
    }
    println!("acked {acked}, requeued {requeued}, dead-lettered {dead}");
    Ok(())
}

async fn cmd_gc(retention_secs: Option<u64>) -> Result<()> {
    let config = load_config()?;
    let services = open_services(&config, false).await?;
    let retention = retention_secs
        .map(Duration::from_secs)
        .unwrap_or(StoreConfig::from(&config).retention);

    let report = services.store.collect_orphans(retention).await?;
    println!(
        "scanned {}, removed {}, freed {} bytes",
        report.scanned, report.removed, report.bytes_freed
    );
    for failure in &report.failures {
        println!("  failed {}: {}", failure.content_hash, failure.error);
    }
    Ok(())
}

async fn cmd_stats() -> Result<()> {
    let config = load_config()?;
    let storage = Arc::new(Storage::open_readonly(Path::new(&config.storage.db_path)).await?);
    let queue: Arc<dyn QueueBackend> = storage.clone();
    let fetcher = HttpFeedFetcher::new(Duration::from_secs(config.scheduler.fetch_timeout_secs))?;
    let services = Services::assemble(
        &config,
        storage,
        queue,
        completion_client(&config, false)?,
        Arc::new(fetcher),
        Arc::new(FsBlobStore::new(&config.storage.blob_dir)),
    );

    let report = services.health.report().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("config written to {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("# {}", config_file_path()?.display());
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_outcome(outcome: &SourceOutcome) {
    match &outcome.error {
        None => println!(
            "{}: {} entries, {} new, {} jobs queued",
            outcome.name, outcome.discovered, outcome.new_items, outcome.jobs_enqueued
        ),
        Some(err) => println!("{}: fetch failed: {err}", outcome.name),
    }
}

fn print_cycle(report: &CycleReport) {
    println!(
        "due {}, fetched {}, failed {}, new items {}, jobs queued {} ({:.1}s)",
        report.due,
        report.fetched,
        report.failed,
        report.new_items,
        report.jobs_enqueued,
        report.duration.as_secs_f64()
    );
    for (id, err) in &report.errors {
        println!("  {id}: {err}");
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl CycleProgress for CliProgress {
    fn cycle_started(&self, due: usize) {
        self.spinner.set_message(format!("Fetching {due} due source(s)"));
    }

    fn source_finished(&self, current: usize, total: usize, outcome: &SourceOutcome) {
        let status = if outcome.is_success() { "ok" } else { "failed" };
        self.spinner
            .set_message(format!("[{current}/{total}] {} {status}", outcome.name));
    }
}
