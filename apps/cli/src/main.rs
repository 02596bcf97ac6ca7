//! feedforge CLI: feed ingestion, AI summarization and shared artifact storage.
//!
//! Polls feed sources on a schedule, routes new items through a bounded
//! completion-call controller and stores each summary once by content hash.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
