//! # stratum-core
//!
//! Core types, traits, and abstractions for the stratum distillation
//! pipeline.
//!
//! This crate provides the foundational data structures and trait
//! definitions that other stratum crates depend on: the enrichment job
//! model, the four knowledge-element kinds and their lineage edges, and
//! the repository/backend interfaces that stratum-db, stratum-inference,
//! and the pipeline crates implement.

pub mod defaults;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use ids::{derivation_key, element_id, session_ref, transcript_ref};
pub use models::*;
pub use traits::*;
