//! AI-call dispatch for feedforge.
//!
//! - [`RetryPolicy`]: pure retry/backoff decisions over the [`ErrorClass`] taxonomy
//! - [`CallController`]: bounded-concurrency, priority-ordered call gate
//! - [`HttpCompletionClient`]: the Messages-style HTTP [`CompletionClient`]
//! - [`ModelTier`] and [`select_tier`]: model choice per item

pub mod completion;
pub mod controller;
pub mod error;
pub mod retry;
pub mod tier;

pub use completion::{
    CompletionClient, CompletionRequest, CompletionResponse, HttpCompletionClient,
};
pub use controller::{CallController, CallOutcome, CallTicket, ControllerStats};
pub use error::{CallError, Classify, CompletionError, ErrorClass};
pub use retry::{RetryDecision, RetryPolicy};
pub use tier::{ModelTier, TierParams, TierTable, select_tier};
