//! Background enrichment workers.
//!
//! The pool claims jobs from the durable queue one at a time per worker
//! and hands each to a [`stratum_core::SessionEnricher`]. Claim
//! atomicity lives in the store; this crate only polls, executes, and
//! records outcomes. The [`scan`] module is the matching producer: it
//! discovers sessions that have no facts on record and enqueues them.

pub mod scan;
pub mod worker;

pub use scan::SessionScanner;
pub use worker::{PoolHandle, StatusBoard, WorkerConfig, WorkerPool};
