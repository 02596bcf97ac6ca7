//! Queue channel for feedforge jobs.
//!
//! Producers [`QueueChannel::send`] validated jobs; workers call
//! [`QueueChannel::receive`] with a handler whose outcome decides between
//! acknowledge, requeue and dead-letter. Transports implement [`QueueBackend`].

pub mod backend;
pub mod channel;
pub mod error;
pub mod validate;

pub use backend::{MemoryQueue, QueueBackend};
pub use channel::{DeliveryReport, JobFailure, QueueChannel};
pub use error::QueueError;
pub use validate::validate_job;
