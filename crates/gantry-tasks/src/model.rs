//! Task and task list data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, TaskStoreError};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskStoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(TaskStoreError::Validation(format!(
                "Unknown task status: {}",
                other
            ))),
        }
    }
}

/// Priority of a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = TaskStoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(TaskStoreError::Validation(format!(
                "Unknown task priority: {}",
                other
            ))),
        }
    }
}

/// Executable action carried in a task's metadata.
///
/// A closed set of action kinds: an unknown kind fails when the
/// metadata is deserialized, not when the task is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Invoke a registered tool
    Tool {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Run a shell command (routed through the shell execution tool)
    Shell { command: String },
    /// Run a named validation
    Validation {
        #[serde(rename = "name")]
        kind: String,
    },
    /// User-defined action with an opaque payload
    Custom {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl StepAction {
    /// The action's display name.
    pub fn name(&self) -> &str {
        match self {
            StepAction::Tool { name, .. } => name,
            StepAction::Shell { .. } => "shell_execute",
            StepAction::Validation { kind } => kind,
            StepAction::Custom { name, .. } => name,
        }
    }
}

/// Dispatch instructions attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// The action to perform
    pub action: StepAction,
    /// Wall-clock timeout for the action
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry attempts on failure
    #[serde(default)]
    pub retry_count: u32,
    /// Optional post-execution validation hook
    #[serde(default)]
    pub validation: Option<StepAction>,
    /// Optional rollback hook run when the task fails
    #[serde(default)]
    pub rollback: Option<StepAction>,
}

impl TaskMetadata {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            timeout_secs: default_timeout_secs(),
            retry_count: 0,
            validation: None,
            rollback: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_validation(mut self, action: StepAction) -> Self {
        self.validation = Some(action);
        self
    }

    pub fn with_rollback(mut self, action: StepAction) -> Self {
        self.rollback = Some(action);
        self
    }
}

fn default_timeout_secs() -> u64 {
    300
}

/// A single task in a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the owning list
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,

    /// Ids of tasks that must complete before this one (forward
    /// references to not-yet-existing tasks are tolerated)
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Inverse edges, advisory only
    #[serde(default)]
    pub blocks: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration: Option<Duration>,

    #[serde(default)]
    pub tags: Vec<String>,
    /// Typed dispatch payload; `None` for plain bookkeeping tasks
    #[serde(default)]
    pub metadata: Option<TaskMetadata>,

    pub success: Option<bool>,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl Task {
    /// Create a new `todo` task. Empty ids and titles are rejected.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let title = title.into();

        if id.is_empty() {
            return Err(TaskStoreError::Validation(
                "Task id cannot be empty".to_string(),
            ));
        }
        if title.is_empty() {
            return Err(TaskStoreError::Validation(
                "Task title cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            id,
            title,
            description: String::new(),
            status: TaskStatus::Todo,
            priority: TaskPriority::default(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration: None,
            tags: Vec::new(),
            metadata: None,
            success: None,
            result_data: None,
            error_message: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A list of tasks executed as one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,

    /// If true, readiness requires every dependency completed; if
    /// false, any `todo` task is ready
    pub sequential_mode: bool,
    pub auto_start_next: bool,
    pub stop_on_failure: bool,

    pub active: bool,
    pub current_task_id: Option<String>,

    // Cached counters, recomputed from the task set on load; never a
    // source of truth.
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

impl TaskList {
    /// Create a new task list. Empty ids and titles are rejected.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let title = title.into();

        if id.is_empty() {
            return Err(TaskStoreError::Validation(
                "TaskList id cannot be empty".to_string(),
            ));
        }
        if title.is_empty() {
            return Err(TaskStoreError::Validation(
                "TaskList title cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            id,
            title,
            description: String::new(),
            created_at: Utc::now(),
            sequential_mode: true,
            auto_start_next: true,
            stop_on_failure: true,
            active: false,
            current_task_id: None,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_modes(mut self, sequential: bool, auto_start: bool) -> Self {
        self.sequential_mode = sequential;
        self.auto_start_next = auto_start;
        self
    }

    /// Completion progress as a percentage of the task count.
    pub fn progress_percent(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        (self.completed_tasks as f64 / self.total_tasks as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.total_tasks > 0 && self.completed_tasks == self.total_tasks
    }

    pub fn has_failures(&self) -> bool {
        self.failed_tasks > 0
    }
}
