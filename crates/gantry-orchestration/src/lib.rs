//! Execution layer of the gantry core.
//!
//! Three tightly coupled pieces:
//! - [`ApprovalGateway`] — risk-gated decision broker with rule-based
//!   auto-decisions, blocking waits, and a background expiry sweep
//! - [`RunExecutor`] — drives one plan through a step-by-step lifecycle
//!   with timeouts, artifacts, manifest persistence, and typed events
//! - [`WorkflowExecutor`] — the thin adapter that turns objectives into
//!   task graph entries and task callbacks into tool dispatches
//!
//! The executor consults the gateway before risky steps and drives the
//! task graph forward on completion.

pub mod approval;
pub mod events;
pub mod executor;
pub mod manifest;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use approval::{
    ApprovalGateway, ApprovalRequest, ApprovalRule, ApprovalSpec, ApprovalStatus,
    RuleDisposition,
};
pub use events::{EventHandlers, RunEvent};
pub use executor::{ExecuteOptions, RunExecutor, RunSummary};
pub use manifest::{PlanStep, RunManifest, RunStatus, StepExecutionResult, StepStatus};
pub use workflow::{TaskOutcome, WorkflowCompletion, WorkflowExecutor, WorkflowStep};

use std::path::PathBuf;
use thiserror::Error;

use gantry_tasks::StallReport;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Workflow {list_id} stalled: {report}")]
    Stalled {
        list_id: String,
        report: StallReport,
    },

    #[error("Task store error: {0}")]
    Store(#[from] gantry_tasks::TaskStoreError),

    #[error("Core error: {0}")]
    Core(#[from] gantry_core::CoreError),
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
