//! Content-addressed artifact storage for feedforge.
//!
//! Generated artifacts are stored once per SHA-256 hash in a [`BlobStore`];
//! consumers hold copy-on-write references managed by [`ContentStore`].

pub mod blob;
pub mod locks;
pub mod store;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use locks::KeyedLocks;
pub use store::{
    ContentStore, GcFailure, GcReport, StoreStats, UpdateOutcome, owner_locator, shared_locator,
};
