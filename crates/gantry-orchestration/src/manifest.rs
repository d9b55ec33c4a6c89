//! Run manifests: the durable record of one execution attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use gantry_core::RiskLevel;

/// Status of an execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    /// Cooperatively suspended between steps; re-enters `Running`
    Paused,
    Success,
    Failed,
    Aborted,
    Timeout,
}

impl RunStatus {
    /// Terminal statuses are immutable once `completed_at` is set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Aborted | RunStatus::Timeout
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Created => write!(f, "created"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Paused => write!(f, "paused"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// How a single step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Approval denied or timed out before dispatch
    Skipped,
    /// Dry-run synthetic execution
    Simulated,
    Timeout,
}

/// Immutable record of one step's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Where the full output was spilled, if it exceeded the inline
    /// threshold
    pub artifact_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
}

impl StepExecutionResult {
    /// Build a result spanning `started_at`..now.
    pub fn finish(
        step_id: impl Into<String>,
        status: StepStatus,
        started_at: DateTime<Utc>,
        success: bool,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            step_id: step_id.into(),
            status,
            started_at,
            completed_at,
            duration_ms,
            success,
            output: None,
            error: None,
            artifact_path: None,
            exit_code: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// One step of a plan handed to the run executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            tool_name: tool_name.into(),
            parameters: serde_json::Value::Null,
            timeout_secs: default_step_timeout_secs(),
            requires_approval: false,
            risk_level: RiskLevel::Low,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_approval(mut self, risk_level: RiskLevel) -> Self {
        self.requires_approval = true;
        self.risk_level = risk_level;
        self
    }
}

fn default_step_timeout_secs() -> u64 {
    300
}

/// Complete record of one execution attempt of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// 1-based index of the step currently executing
    pub current_step: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,

    pub step_results: Vec<StepExecutionResult>,
    pub artifacts: Vec<PathBuf>,
    pub cost_estimate: f64,
    pub actual_cost: f64,

    // Execution configuration, frozen at plan-start.
    pub dry_run: bool,
    pub auto_approve: bool,
    pub step_range: Option<String>,
    pub continue_on_failure: bool,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RunManifest {
    pub fn new(
        run_id: impl Into<String>,
        plan_id: impl Into<String>,
        total_steps: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            plan_id: plan_id.into(),
            status: RunStatus::Created,
            started_at: Utc::now(),
            completed_at: None,
            current_step: 0,
            total_steps,
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            step_results: Vec::new(),
            artifacts: Vec::new(),
            cost_estimate: 0.0,
            actual_cost: 0.0,
            dry_run: false,
            auto_approve: false,
            step_range: None,
            continue_on_failure: false,
            metadata: HashMap::new(),
        }
    }

    /// Total execution duration, once the run has completed.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    /// Completed steps as a percentage of the total.
    pub fn success_rate(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.completed_steps as f64 / self.total_steps as f64) * 100.0
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
