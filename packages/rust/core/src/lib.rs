//! Pipeline orchestration for feedforge.
//!
//! This crate ties the scheduler, queue, call controller and content store
//! into a running system: the [`ProcessingWorker`] consumes jobs, the
//! [`Runtime`] owns the loops, [`HealthService`] reports on them and
//! [`Admin`] exposes capability-checked operations.

pub mod admin;
pub mod health;
pub mod runtime;
pub mod worker;

pub use admin::{
    Action, Admin, AdminError, AdminOp, AdminOutcome, Capability, CapabilitySet, Resource,
};
pub use health::{HealthReport, HealthService};
pub use runtime::{Runtime, RuntimeSettings, Services};
pub use worker::ProcessingWorker;
