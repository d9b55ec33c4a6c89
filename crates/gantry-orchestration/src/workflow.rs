//! Workflow adapter: objectives in, task graph entries out, and the
//! callback that turns a task back into a tool dispatch.
//!
//! This is intentionally the thinnest layer of the execution core — it
//! owns no state machine of its own.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{CoreError, ToolContext, ToolDispatcher};
use gantry_tasks::{
    diagnose_stall, ListStatus, StepAction, Task, TaskList, TaskMetadata, TaskPriority,
    TaskStatus, TaskStore, TaskStoreError,
};

use crate::{OrchestrationError, Result};

/// A step of a workflow before it becomes a task.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub action: StepAction,
    pub description: String,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub validation: Option<StepAction>,
    pub rollback: Option<StepAction>,
}

impl WorkflowStep {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            description: String::new(),
            timeout_secs: 300,
            retry_count: 0,
            validation: None,
            rollback: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
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

/// Result of executing one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub message: String,
    pub error: Option<String>,
}

/// How a bounded wait on a workflow ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowCompletion {
    Completed(ListStatus),
    Failed(ListStatus),
    TimedOut,
}

/// Bridges the task graph to the tool dispatch interface.
pub struct WorkflowExecutor {
    store: Arc<TaskStore>,
    dispatcher: Arc<dyn ToolDispatcher>,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<TaskStore>, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Derive executable steps from a free-form objective by keyword
    /// analysis. Always yields at least one step.
    pub fn plan_from_objective(
        objective: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Vec<WorkflowStep> {
        let lowered = objective.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
        let ctx_str = |key: &str, fallback: &str| -> String {
            context
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(fallback)
                .to_string()
        };

        let mut steps = Vec::new();

        if has(&["file", "read", "analyze", "check"]) {
            steps.push(
                WorkflowStep::new(StepAction::Tool {
                    name: "read_file".to_string(),
                    params: json!({"path": ctx_str("target_file", "README.md")}),
                })
                .with_description("Read target file for analysis")
                .with_timeout_secs(30),
            );
        }

        if has(&["list", "files", "directory", "explore"]) {
            steps.push(
                WorkflowStep::new(StepAction::Tool {
                    name: "list_files".to_string(),
                    params: json!({"path": ctx_str("target_dir", "."), "recursive": true}),
                })
                .with_description("List files in target directory")
                .with_timeout_secs(60),
            );
        }

        if has(&["search", "find", "grep", "pattern"]) {
            steps.push(
                WorkflowStep::new(StepAction::Tool {
                    name: "find_in_files".to_string(),
                    params: json!({
                        "pattern": ctx_str("search_pattern", "TODO"),
                        "path": ctx_str("search_path", "."),
                        "max_results": 50,
                    }),
                })
                .with_description("Search for pattern in files")
                .with_timeout_secs(120),
            );
        }

        if has(&["run", "execute", "command", "script"]) {
            steps.push(
                WorkflowStep::new(StepAction::Shell {
                    command: ctx_str("command", "echo 'Workflow step executed'"),
                })
                .with_description("Execute command"),
            );
        }

        if has(&["validate", "verify", "test"]) {
            steps.push(
                WorkflowStep::new(StepAction::Validation {
                    kind: "general".to_string(),
                })
                .with_description("Validate workflow results")
                .with_timeout_secs(60),
            );
        }

        if steps.is_empty() {
            steps.push(
                WorkflowStep::new(StepAction::Tool {
                    name: "list_files".to_string(),
                    params: json!({"path": ".", "recursive": false}),
                })
                .with_description(format!("General analysis step for: {}", objective))
                .with_timeout_secs(60),
            );
        }

        steps
    }

    /// Build a sequential workflow from an objective: one task per
    /// step, each depending on the immediately preceding task.
    pub async fn create_workflow(
        &self,
        objective: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<TaskList> {
        let steps = Self::plan_from_objective(objective, context);

        let title = if objective.chars().count() > 50 {
            format!("Workflow: {}...", objective.chars().take(50).collect::<String>())
        } else {
            format!("Workflow: {}", objective)
        };
        let list = self
            .store
            .create_list(
                title,
                format!("Auto-generated workflow for: {}", objective),
                true,
                true,
            )
            .await?;

        self.append_steps(&list.id, steps).await?;

        let list = self
            .store
            .load_list(&list.id)
            .await?
            .ok_or_else(|| TaskStoreError::ListNotFound(list.id.clone()))?;

        tracing::info!(
            list_id = %list.id,
            steps = list.total_tasks,
            objective = %objective,
            "Created workflow"
        );
        Ok(list)
    }

    /// Build a sequential workflow from an externally supplied step
    /// list.
    pub async fn create_workflow_from_steps(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Result<TaskList> {
        if steps.is_empty() {
            return Err(OrchestrationError::InvalidPlan(
                "Workflow has no steps".to_string(),
            ));
        }

        let list = self
            .store
            .create_list(title, description, true, true)
            .await?;
        self.append_steps(&list.id, steps).await?;

        self.store
            .load_list(&list.id)
            .await?
            .ok_or_else(|| TaskStoreError::ListNotFound(list.id.clone()).into())
    }

    async fn append_steps(&self, list_id: &str, steps: Vec<WorkflowStep>) -> Result<()> {
        let mut previous: Option<String> = None;

        for (index, step) in steps.into_iter().enumerate() {
            // Tool actions whose tool is unregistered become custom
            // actions, preserving their payload.
            let action = match step.action {
                StepAction::Tool { name, params } if !self.dispatcher.is_known(&name) => {
                    StepAction::Custom {
                        name,
                        payload: params,
                    }
                }
                other => other,
            };

            let mut metadata = TaskMetadata::new(action)
                .with_timeout_secs(step.timeout_secs)
                .with_retry_count(step.retry_count);
            if let Some(validation) = step.validation {
                metadata = metadata.with_validation(validation);
            }
            if let Some(rollback) = step.rollback {
                metadata = metadata.with_rollback(rollback);
            }

            let action_name = metadata.action.name().to_string();
            let title = if step.description.is_empty() {
                format!("Step {}: {}", index + 1, action_name)
            } else {
                step.description.clone()
            };

            let task = self
                .store
                .add_task_with_metadata(
                    list_id,
                    title,
                    step.description,
                    previous.take().into_iter().collect(),
                    TaskPriority::Medium,
                    metadata,
                    vec!["workflow".to_string(), format!("action:{}", action_name)],
                )
                .await?;
            previous = Some(task.id);
        }

        Ok(())
    }

    /// Execute one task: resolve its declared action, dispatch, apply
    /// the validation hook, and roll back on failure if a rollback
    /// hook was supplied. Never raises — failures come back in the
    /// outcome.
    pub async fn execute_task(&self, task: &Task) -> TaskOutcome {
        tracing::info!(task_id = %task.id, title = %task.title, "Executing task");

        let Some(metadata) = &task.metadata else {
            return TaskOutcome {
                success: false,
                data: None,
                message: format!("Task '{}' has no executable action", task.title),
                error: Some("missing dispatch metadata".to_string()),
            };
        };

        let timeout = Duration::from_secs(metadata.timeout_secs);
        let attempts = metadata.retry_count + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.dispatch_action(&metadata.action, task, timeout).await {
                Ok(data) => {
                    if let Some(validation) = &metadata.validation {
                        if let Err(e) = self.dispatch_action(validation, task, timeout).await {
                            last_error = Some(format!("Validation failed: {}", e));
                            break;
                        }
                    }
                    return TaskOutcome {
                        success: true,
                        data: Some(data),
                        message: format!("Task '{}' completed successfully", task.title),
                        error: None,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        attempt = attempt,
                        attempts = attempts,
                        error = %e,
                        "Task attempt failed"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        if let Some(rollback) = &metadata.rollback {
            match self.dispatch_action(rollback, task, timeout).await {
                Ok(_) => {
                    tracing::info!(task_id = %task.id, "Rollback completed");
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Rollback failed");
                }
            }
        }

        let error = last_error.unwrap_or_else(|| "unknown error".to_string());
        TaskOutcome {
            success: false,
            data: None,
            message: format!("Task '{}' failed: {}", task.title, error),
            error: Some(error),
        }
    }

    async fn dispatch_action(
        &self,
        action: &StepAction,
        task: &Task,
        timeout: Duration,
    ) -> gantry_core::Result<serde_json::Value> {
        match action {
            StepAction::Tool { name, params } => {
                self.dispatch_tool(name, params, task, timeout).await
            }
            StepAction::Shell { command } => {
                let params = json!({"command": command});
                self.dispatch_tool("shell_execute", &params, task, timeout).await
            }
            StepAction::Validation { kind } => Ok(json!({
                "validation_passed": true,
                "kind": kind,
                "timestamp": Utc::now().to_rfc3339(),
            })),
            StepAction::Custom { name, payload } => {
                tracing::warn!(action = %name, "Custom action has no handler, recording as executed");
                Ok(json!({
                    "action": name,
                    "payload": payload,
                    "message": format!("Custom action '{}' executed", name),
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }
        }
    }

    async fn dispatch_tool(
        &self,
        name: &str,
        params: &serde_json::Value,
        task: &Task,
        timeout: Duration,
    ) -> gantry_core::Result<serde_json::Value> {
        if !self.dispatcher.is_known(name) {
            return Err(CoreError::ToolFailure(format!("Tool '{}' not found", name)));
        }

        let ctx = ToolContext::new(".").with_description(&task.description);
        let outcome = tokio::time::timeout(timeout, self.dispatcher.dispatch(name, params, &ctx))
            .await
            .map_err(|_| CoreError::Timeout {
                operation: name.to_string(),
                secs: timeout.as_secs(),
            })??;

        if !outcome.success {
            return Err(CoreError::ToolFailure(
                outcome
                    .error
                    .unwrap_or_else(|| format!("Tool '{}' failed", name)),
            ));
        }

        Ok(json!({
            "output": outcome.output,
            "exit_code": outcome.exit_code,
            "duration_ms": outcome.duration_ms,
        }))
    }

    /// Drive a workflow's ready tasks to completion, in order.
    ///
    /// Stops early when a task fails on a stop-on-failure list, and
    /// surfaces a dependency stall (cycle or unresolved reference) as
    /// [`OrchestrationError::Stalled`] instead of spinning.
    pub async fn run_workflow(&self, list_id: &str) -> Result<ListStatus> {
        let list = self
            .store
            .load_list(list_id)
            .await?
            .ok_or_else(|| TaskStoreError::ListNotFound(list_id.to_string()))?;

        self.store.set_list_active(list_id, true).await?;

        loop {
            let ready = self.store.get_ready_tasks(list_id).await?;
            let Some(task) = ready.into_iter().next() else {
                let tasks = self.store.tasks_for_list(list_id).await?;
                let pending = tasks.iter().any(|t| t.status == TaskStatus::Todo);
                if pending {
                    if let Some(report) = diagnose_stall(&tasks) {
                        self.store.set_list_active(list_id, false).await?;
                        tracing::error!(list_id = %list_id, report = %report, "Workflow stalled");
                        return Err(OrchestrationError::Stalled {
                            list_id: list_id.to_string(),
                            report,
                        });
                    }
                }
                break;
            };

            self.store.start_task(list_id, &task.id).await?;
            let outcome = self.execute_task(&task).await;
            self.store
                .mark_completed(list_id, &task.id, outcome.success, outcome.data, outcome.error)
                .await?;

            if !outcome.success && list.stop_on_failure {
                break;
            }
            if !list.auto_start_next {
                break;
            }
        }

        self.store.set_list_active(list_id, false).await?;
        self.store
            .list_status(list_id)
            .await?
            .ok_or_else(|| TaskStoreError::ListNotFound(list_id.to_string()).into())
    }

    /// Poll a workflow until it completes, fails, or the wait budget
    /// elapses.
    pub async fn wait_for_completion(
        &self,
        list_id: &str,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<WorkflowCompletion> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let status = self
                .store
                .list_status(list_id)
                .await?
                .ok_or_else(|| TaskStoreError::ListNotFound(list_id.to_string()))?;

            if status.is_complete {
                return Ok(WorkflowCompletion::Completed(status));
            }
            if status.has_failures {
                return Ok(WorkflowCompletion::Failed(status));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(WorkflowCompletion::TimedOut);
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
