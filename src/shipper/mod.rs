//! The shipping pipeline.
//!
//! Batch mode scans a queue directory and ships each file through
//! claim -> upload -> finalize on a bounded worker pool. Tail mode cuts a
//! growing NDJSON file into gzip chunks by size or age. Exactly one of the two
//! runs per daemon, driven by the [`scheduler`].

/// Atomic-rename claims and startup recovery
pub mod claim;

/// Mode selection, directory preparation and the run loop
pub mod daemon;

/// Storage key layout
pub mod key;

/// Rename with cross-device fallback, archive collisions
pub mod mover;

/// Queue directory listing
pub mod scanner;

/// Fixed-interval cycle driver
pub mod scheduler;

/// Continuous log mode
pub mod tail;

/// Bounded-concurrency batch shipping and error aggregation
pub mod worker;

pub use daemon::{Context, Daemon, Pipeline};
pub use worker::{BatchError, FailureStage, FileFailure};
