//! Layered distillation: raw conversational units → facts → themes →
//! insights → dossier documents, with full lineage at every step.
//!
//! This crate holds the layer algorithms ([`layers::Pipeline`]), the
//! per-session enricher the worker pool calls ([`enrich::Enricher`]),
//! the in-memory synthesis scheduler with trailing-edge debounce
//! ([`scheduler::SynthesisScheduler`]), and the transcript directory
//! watcher ([`watcher::TranscriptWatcher`]).

pub mod enrich;
pub mod layers;
pub mod scheduler;
pub mod watcher;

pub use enrich::Enricher;
pub use layers::{Pipeline, DOSSIER_PROFILES, PROJECT_TRACKER_PROFILE};
pub use scheduler::{SchedulerConfig, SynthesisHandler, SynthesisScheduler};
pub use watcher::{TranscriptWatcher, WatcherConfig};
