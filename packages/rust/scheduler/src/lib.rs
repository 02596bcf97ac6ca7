//! Source scheduling for feedforge.
//!
//! - [`due`]: per-source state and the due predicate
//! - [`fetcher`]: the [`FeedFetcher`] seam and its reqwest/feed-rs implementation
//! - [`engine`]: the [`Scheduler`] that polls due sources in bounded batches

pub mod due;
pub mod engine;
pub mod fetcher;

pub use due::{DueGate, SourceState, is_due};
pub use engine::{CycleProgress, CycleReport, Scheduler, SilentProgress, SourceOutcome};
pub use fetcher::{FeedFetcher, HttpFeedFetcher, parse_feed};
