//! Shared data structures and utilities for the orchestration system
//!
//! This crate contains the task model and its state machine, the event
//! envelope, the store abstraction used by both the manager and the workers,
//! and the wire types exchanged over their HTTP APIs.

pub mod api;
pub mod stats;
pub mod store;
pub mod task;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::ErrResponse;
pub use stats::Stats;
pub use store::{MemoryStore, SqliteStore, Store};
pub use task::{valid_transition, Event, State, Task, TaskSpec};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the orchestration system
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: task::State, to: task::State },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no candidate nodes available for task {0}")]
    NoCandidates(uuid::Uuid),
}
