//! Persistent task graph for the gantry execution core.
//!
//! A [`TaskStore`] owns task lists and their tasks in SQLite, with a
//! time-boxed read cache and a single writer lock. Readiness is
//! computed by the pure [`resolver`] module: in sequential mode a task
//! is ready only when every dependency is completed; a graph that can
//! make no progress is surfaced as a [`resolver::StallReport`], never
//! silently ignored.

pub mod model;
pub mod resolver;
pub mod store;

pub use model::{
    StepAction, Task, TaskList, TaskMetadata, TaskPriority, TaskStatus,
};
pub use resolver::{diagnose_stall, ready_tasks, StallReport};
pub use store::{ListStatus, TaskStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Task list not found: {0}")]
    ListNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] gantry_core::CoreError),
}

pub type Result<T> = std::result::Result<T, TaskStoreError>;
