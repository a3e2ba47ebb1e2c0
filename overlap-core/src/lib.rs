//! # overlap-core
//!
//! Core library for overlap - team awareness for coding-agent sessions.
//!
//! This library provides:
//! - A resumable, crash-safe tailer over append-only agent journals
//! - Typed activity-event derivation with per-session accumulators
//! - Routing of sessions to team instances via repo rosters
//! - Batched at-least-once delivery with backoff and auth suspension
//! - A team-state mirror and the synchronous overlap probe
//!
//! ## Architecture
//!
//! The tracer daemon owns a single cooperative loop: journal bytes flow
//! through the reader, the agent adapter, symbol enrichment, and the repo
//! matcher into per-team sender queues. Durable byte offsets only advance
//! once every routed team has acknowledged the derived events. The probe is
//! a separate short-lived entry point that queries team instances directly
//! and falls back to the daemon's mirrored team state.

// Re-export commonly used items at the crate root
pub use config::{Config, TeamConfig, TracerConfig};
pub use error::{Error, Result};
pub use tracer::{Tracer, TracerOptions};
pub use types::*;

// Public modules
pub mod client;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod paths;
pub mod probe;
pub mod repos;
pub mod sender;
pub mod state;
pub mod symbols;
pub mod teamstate;
pub mod tracer;
pub mod types;
