//! The run executor: drives one plan through a step-by-step lifecycle.
//!
//! State machine per run: `created -> running -> {success | failed |
//! aborted | timeout}`, with `paused` as a cooperative sub-state of
//! `running` checked between steps. Each run owns a live manifest
//! (observable mid-run) and a control token; steps dispatch through
//! the external tool seam under an enforced wall-clock timeout.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use gantry_core::{short_id, ExecutorConfig, ToolContext, ToolDispatcher};

use crate::approval::{ApprovalGateway, ApprovalSpec};
use crate::events::{EventHandlers, RunEvent};
use crate::manifest::{PlanStep, RunManifest, RunStatus, StepExecutionResult, StepStatus};
use crate::{OrchestrationError, Result};

/// Cooperative control state of a run, one token per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Running,
    Paused,
    Stopped,
}

struct RunEntry {
    manifest: Arc<RwLock<RunManifest>>,
    control: watch::Sender<ControlState>,
}

/// Per-run execution configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Simulate steps without external side effects
    pub dry_run: bool,
    /// Skip the approval gateway for risky steps
    pub auto_approve: bool,
    /// `"N"` or `"N-M"` (1-based, inclusive); unparsable input degrades
    /// to the full list
    pub step_range: Option<String>,
    /// Keep executing after a failed or skipped step
    pub continue_on_failure: bool,
}

impl ExecuteOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn with_auto_approve(mut self) -> Self {
        self.auto_approve = true;
        self
    }

    pub fn with_step_range(mut self, range: impl Into<String>) -> Self {
        self.step_range = Some(range.into());
        self
    }

    pub fn with_continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Condensed run listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    /// `completed/total`
    pub progress: String,
    pub success_rate: f64,
    pub duration_ms: Option<u64>,
}

impl From<&RunManifest> for RunSummary {
    fn from(manifest: &RunManifest) -> Self {
        Self {
            run_id: manifest.run_id.clone(),
            plan_id: manifest.plan_id.clone(),
            status: manifest.status,
            started_at: manifest.started_at,
            completed_at: manifest.completed_at,
            progress: format!("{}/{}", manifest.completed_steps, manifest.total_steps),
            success_rate: manifest.success_rate(),
            duration_ms: manifest.duration_ms(),
        }
    }
}

/// Executes plans: approval gating, dispatch under timeout, artifact
/// capture, manifest persistence, event emission.
#[derive(Clone)]
pub struct RunExecutor {
    runs_dir: PathBuf,
    artifacts_dir: PathBuf,
    config: ExecutorConfig,
    dispatcher: Arc<dyn ToolDispatcher>,
    gateway: Arc<ApprovalGateway>,
    active: Arc<RwLock<HashMap<String, RunEntry>>>,
    handlers: Arc<std::sync::RwLock<EventHandlers>>,
}

impl RunExecutor {
    pub fn new(
        runs_dir: impl Into<PathBuf>,
        artifacts_dir: impl Into<PathBuf>,
        config: ExecutorConfig,
        dispatcher: Arc<dyn ToolDispatcher>,
        gateway: Arc<ApprovalGateway>,
    ) -> Result<Self> {
        let runs_dir = runs_dir.into();
        let artifacts_dir = artifacts_dir.into();
        for dir in [runs_dir.as_path(), artifacts_dir.as_path()] {
            std::fs::create_dir_all(dir).map_err(|source| OrchestrationError::Persistence {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        Ok(Self {
            runs_dir,
            artifacts_dir,
            config,
            dispatcher,
            gateway,
            active: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(std::sync::RwLock::new(EventHandlers::new())),
        })
    }

    /// Register an event handler for every run this executor drives.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&RunEvent) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(handler);
    }

    fn emit(&self, event: &RunEvent) {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .emit(event);
    }

    /// Execute a plan to completion.
    ///
    /// The returned manifest is terminal. Mid-run progress is
    /// observable through [`RunExecutor::get_run_status`] and the event
    /// hooks — the live manifest is updated and persisted after every
    /// step.
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        steps: Vec<PlanStep>,
        options: ExecuteOptions,
    ) -> Result<RunManifest> {
        let run_id = format!("RUN_{}_{}", Utc::now().timestamp(), short_id());
        let steps = filter_steps_by_range(steps, options.step_range.as_deref());

        let mut manifest = RunManifest::new(&run_id, plan_id, steps.len());
        manifest.dry_run = options.dry_run;
        manifest.auto_approve = options.auto_approve;
        manifest.step_range = options.step_range.clone();
        manifest.continue_on_failure = options.continue_on_failure;

        let (control_tx, control_rx) = watch::channel(ControlState::Running);
        let live = Arc::new(RwLock::new(manifest));
        {
            let mut active = self.active.write().await;
            active.insert(
                run_id.clone(),
                RunEntry {
                    manifest: Arc::clone(&live),
                    control: control_tx,
                },
            );
        }

        let outcome = self
            .run_loop(&run_id, plan_id, &steps, &options, &live, control_rx)
            .await;

        self.active.write().await.remove(&run_id);

        match outcome {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                // Never leave an orphaned "running" record behind.
                let snapshot = {
                    let mut m = live.write().await;
                    if !m.status.is_terminal() {
                        m.status = RunStatus::Failed;
                        m.completed_at = Some(Utc::now());
                    }
                    m.clone()
                };
                if let Err(persist_err) = self.persist_manifest(&snapshot).await {
                    tracing::error!(
                        run_id = %run_id,
                        error = %persist_err,
                        "Failed to persist manifest for failed run"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        run_id: &str,
        plan_id: &str,
        steps: &[PlanStep],
        options: &ExecuteOptions,
        live: &Arc<RwLock<RunManifest>>,
        mut control_rx: watch::Receiver<ControlState>,
    ) -> Result<RunManifest> {
        tracing::info!(
            run_id = %run_id,
            plan_id = %plan_id,
            steps = steps.len(),
            dry_run = options.dry_run,
            "Run started"
        );

        let started_snapshot = {
            let mut m = live.write().await;
            m.status = RunStatus::Running;
            m.clone()
        };
        self.persist_manifest(&started_snapshot).await?;
        self.emit(&RunEvent::RunStarted {
            run_id: run_id.to_string(),
            manifest: started_snapshot,
        });

        let mut aborted = false;
        let mut halted = false;

        for (index, step) in steps.iter().enumerate() {
            // Cooperative control point: stop aborts, pause suspends
            // until resumed or stopped. Never interrupts a step in
            // flight.
            loop {
                let state = *control_rx.borrow_and_update();
                match state {
                    ControlState::Stopped => {
                        aborted = true;
                        break;
                    }
                    ControlState::Running => break,
                    ControlState::Paused => {
                        if control_rx.changed().await.is_err() {
                            aborted = true;
                            break;
                        }
                    }
                }
            }
            if aborted {
                break;
            }

            {
                live.write().await.current_step = index + 1;
            }

            let result = self.execute_step(run_id, plan_id, step, options).await?;

            let snapshot = {
                let mut m = live.write().await;
                if result.status == StepStatus::Skipped {
                    m.skipped_steps += 1;
                    if !options.continue_on_failure {
                        halted = true;
                    }
                } else if result.success {
                    m.completed_steps += 1;
                } else {
                    m.failed_steps += 1;
                    if !options.continue_on_failure {
                        halted = true;
                    }
                }
                if let Some(path) = &result.artifact_path {
                    m.artifacts.push(path.clone());
                }
                m.step_results.push(result.clone());
                m.clone()
            };
            self.persist_manifest(&snapshot).await?;

            let event = if result.success {
                RunEvent::StepCompleted {
                    run_id: run_id.to_string(),
                    step_id: step.id.clone(),
                    result,
                }
            } else {
                RunEvent::StepFailed {
                    run_id: run_id.to_string(),
                    step_id: step.id.clone(),
                    result,
                }
            };
            self.emit(&event);

            if halted {
                break;
            }
        }

        let final_manifest = {
            let mut m = live.write().await;
            m.completed_at = Some(Utc::now());
            m.status = if aborted {
                RunStatus::Aborted
            } else if m.failed_steps > 0 {
                RunStatus::Failed
            } else if halted {
                // Halted on a denied/skipped step: the plan did not
                // complete.
                RunStatus::Failed
            } else {
                RunStatus::Success
            };
            m.clone()
        };
        self.persist_manifest(&final_manifest).await?;

        let event = if final_manifest.status == RunStatus::Success {
            RunEvent::RunCompleted {
                run_id: run_id.to_string(),
                manifest: final_manifest.clone(),
            }
        } else {
            RunEvent::RunFailed {
                run_id: run_id.to_string(),
                manifest: final_manifest.clone(),
            }
        };
        self.emit(&event);

        tracing::info!(run_id = %run_id, status = %final_manifest.status, "Run finished");
        Ok(final_manifest)
    }

    async fn execute_step(
        &self,
        run_id: &str,
        plan_id: &str,
        step: &PlanStep,
        options: &ExecuteOptions,
    ) -> Result<StepExecutionResult> {
        let started_at = Utc::now();

        tracing::info!(run_id = %run_id, step_id = %step.id, tool = %step.tool_name, "Executing step");
        self.emit(&RunEvent::StepStarted {
            run_id: run_id.to_string(),
            step_id: step.id.clone(),
            tool_name: step.tool_name.clone(),
        });

        if step.requires_approval && step.risk_level.requires_gate() && !options.auto_approve {
            let operation = if step.description.is_empty() {
                step.tool_name.clone()
            } else {
                step.description.clone()
            };
            let request_id = self
                .gateway
                .request_approval(ApprovalSpec::new(
                    &step.id,
                    plan_id,
                    &step.tool_name,
                    operation,
                    step.risk_level,
                    &step.description,
                ))
                .await?;

            if !self.gateway.wait_for_approval(&request_id).await {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %step.id,
                    request_id = %request_id,
                    "Step skipped: approval not granted"
                );
                return Ok(StepExecutionResult::finish(
                    &step.id,
                    StepStatus::Skipped,
                    started_at,
                    false,
                )
                .with_error("Approval required but not granted"));
            }
        }

        if options.dry_run {
            return Ok(StepExecutionResult::finish(
                &step.id,
                StepStatus::Simulated,
                started_at,
                true,
            )
            .with_output(format!(
                "[DRY RUN] Would execute {} with parameters: {}",
                step.tool_name, step.parameters
            )));
        }

        let timeout_secs = if step.timeout_secs == 0 {
            self.config.default_step_timeout_secs
        } else {
            step.timeout_secs
        };
        let ctx = ToolContext::new(".").with_description(&step.description);

        let dispatched = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.dispatcher.dispatch(&step.tool_name, &step.parameters, &ctx),
        )
        .await;

        match dispatched {
            Err(_) => {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %step.id,
                    timeout_secs = timeout_secs,
                    "Step timed out"
                );
                Ok(StepExecutionResult::finish(
                    &step.id,
                    StepStatus::Timeout,
                    started_at,
                    false,
                )
                .with_error(format!("Step timed out after {} seconds", timeout_secs)))
            }
            Ok(Err(e)) => Ok(StepExecutionResult::finish(
                &step.id,
                StepStatus::Failed,
                started_at,
                false,
            )
            .with_error(e.to_string())),
            Ok(Ok(outcome)) => {
                let status = if outcome.success {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                };
                let mut result =
                    StepExecutionResult::finish(&step.id, status, started_at, outcome.success);
                result.output = outcome.output.clone();
                result.error = outcome.error.clone();
                result.exit_code = outcome.exit_code;

                if outcome.success && outcome.output_len() > self.config.artifact_threshold_bytes {
                    match self.write_artifact(run_id, step, &outcome).await {
                        Ok(path) => result.artifact_path = Some(path),
                        Err(e) => {
                            tracing::error!(
                                run_id = %run_id,
                                step_id = %step.id,
                                error = %e,
                                "Failed to write step artifact"
                            );
                        }
                    }
                }

                Ok(result)
            }
        }
    }

    async fn write_artifact(
        &self,
        run_id: &str,
        step: &PlanStep,
        outcome: &gantry_core::ToolOutcome,
    ) -> Result<PathBuf> {
        let run_dir = self.artifacts_dir.join(run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|source| OrchestrationError::Persistence {
                path: run_dir.clone(),
                source,
            })?;

        let timestamp = Utc::now().timestamp();
        let path = run_dir.join(format!("{}_{}_{}.json", step.id, step.tool_name, timestamp));

        let artifact = serde_json::json!({
            "step_id": step.id,
            "tool_name": step.tool_name,
            "timestamp": timestamp,
            "success": outcome.success,
            "output": outcome.output,
            "error": outcome.error,
            "exit_code": outcome.exit_code,
            "metadata": {
                "run_id": run_id,
                "output_size": outcome.output_len(),
            },
        });

        tokio::fs::write(&path, serde_json::to_string_pretty(&artifact)?)
            .await
            .map_err(|source| OrchestrationError::Persistence {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "Wrote step artifact");
        Ok(path)
    }

    /// Suspend a run at its next step boundary. False for unknown or
    /// finished runs.
    pub async fn pause_execution(&self, run_id: &str) -> Result<bool> {
        let Some((live, control)) = self.entry_parts(run_id).await else {
            return Ok(false);
        };

        let _ = control.send(ControlState::Paused);
        let snapshot = {
            let mut m = live.write().await;
            if m.status == RunStatus::Running {
                m.status = RunStatus::Paused;
            }
            m.clone()
        };
        self.persist_manifest(&snapshot).await?;

        tracing::info!(run_id = %run_id, "Run paused");
        Ok(true)
    }

    /// Resume a paused run.
    pub async fn resume_execution(&self, run_id: &str) -> Result<bool> {
        let Some((live, control)) = self.entry_parts(run_id).await else {
            return Ok(false);
        };

        let _ = control.send(ControlState::Running);
        let snapshot = {
            let mut m = live.write().await;
            if m.status == RunStatus::Paused {
                m.status = RunStatus::Running;
            }
            m.clone()
        };
        self.persist_manifest(&snapshot).await?;

        tracing::info!(run_id = %run_id, "Run resumed");
        Ok(true)
    }

    /// Abort a run at its next step boundary. An in-flight step still
    /// obeys its own timeout.
    pub async fn stop_execution(&self, run_id: &str) -> Result<bool> {
        let Some((live, control)) = self.entry_parts(run_id).await else {
            return Ok(false);
        };

        let _ = control.send(ControlState::Stopped);
        let snapshot = {
            let mut m = live.write().await;
            m.status = RunStatus::Aborted;
            m.completed_at = Some(Utc::now());
            m.clone()
        };
        self.persist_manifest(&snapshot).await?;

        tracing::info!(run_id = %run_id, "Run stopped");
        Ok(true)
    }

    async fn entry_parts(
        &self,
        run_id: &str,
    ) -> Option<(Arc<RwLock<RunManifest>>, watch::Sender<ControlState>)> {
        let active = self.active.read().await;
        active
            .get(run_id)
            .map(|entry| (Arc::clone(&entry.manifest), entry.control.clone()))
    }

    /// Current manifest: live registry first, then storage.
    pub async fn get_run_status(&self, run_id: &str) -> Option<RunManifest> {
        {
            let active = self.active.read().await;
            if let Some(entry) = active.get(run_id) {
                return Some(entry.manifest.read().await.clone());
            }
        }
        self.load_manifest(run_id).await
    }

    /// Load a persisted manifest. `None` for unknown runs.
    pub async fn load_manifest(&self, run_id: &str) -> Option<RunManifest> {
        read_manifest_file(&self.runs_dir.join(format!("{}.json", run_id))).await
    }

    /// List runs, newest first, merging live runs with storage.
    pub async fn list_runs(
        &self,
        plan_filter: Option<&str>,
        status_filter: Option<RunStatus>,
        limit: usize,
    ) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        {
            let active = self.active.read().await;
            for entry in active.values() {
                let manifest = entry.manifest.read().await;
                seen.insert(manifest.run_id.clone());
                summaries.push(RunSummary::from(&*manifest));
            }
        }

        if let Ok(mut dir) = tokio::fs::read_dir(&self.runs_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(manifest) = read_manifest_file(&path).await {
                    if seen.insert(manifest.run_id.clone()) {
                        summaries.push(RunSummary::from(&manifest));
                    }
                }
            }
        }

        summaries.retain(|s| {
            plan_filter.map(|p| s.plan_id == p).unwrap_or(true)
                && status_filter.map(|f| s.status == f).unwrap_or(true)
        });
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries.truncate(limit);
        summaries
    }

    /// Delete a run's manifest and artifact subtree.
    pub async fn delete_run(&self, run_id: &str) -> bool {
        let manifest_path = self.runs_dir.join(format!("{}.json", run_id));
        let existed = tokio::fs::remove_file(&manifest_path).await.is_ok();

        let artifact_dir = self.artifacts_dir.join(run_id);
        if let Err(e) = tokio::fs::remove_dir_all(&artifact_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(run_id = %run_id, error = %e, "Failed to delete run artifacts");
            }
        }

        self.active.write().await.remove(run_id);

        if existed {
            tracing::info!(run_id = %run_id, "Deleted run");
        }
        existed
    }

    async fn persist_manifest(&self, manifest: &RunManifest) -> Result<()> {
        let path = self.runs_dir.join(format!("{}.json", manifest.run_id));
        let body = serde_json::to_string_pretty(manifest)?;

        tokio::fs::write(&path, body).await.map_err(|source| {
            tracing::error!(
                run_id = %manifest.run_id,
                path = %path.display(),
                error = %source,
                "Failed to save run manifest"
            );
            OrchestrationError::Persistence { path, source }
        })
    }
}

async fn read_manifest_file(path: &Path) -> Option<RunManifest> {
    let body = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&body) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to parse run manifest");
            None
        }
    }
}

/// Apply a `"N"` / `"N-M"` step range (1-based, inclusive).
/// Unparsable input degrades to the full list, never a hard failure.
fn filter_steps_by_range(steps: Vec<PlanStep>, range: Option<&str>) -> Vec<PlanStep> {
    let Some(range) = range else {
        return steps;
    };

    let parsed = if let Some((start, end)) = range.split_once('-') {
        match (start.trim().parse::<usize>(), end.trim().parse::<usize>()) {
            (Ok(start), Ok(end)) => Some((start, end)),
            _ => None,
        }
    } else {
        match range.trim().parse::<usize>() {
            Ok(n) => Some((n, n)),
            Err(_) => None,
        }
    };

    match parsed {
        None => {
            tracing::warn!(range = %range, "Invalid step range, using all steps");
            steps
        }
        Some((start, end)) => {
            let from = start.saturating_sub(1);
            let to = end.min(steps.len());
            if from >= to {
                Vec::new()
            } else {
                steps[from..to].to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalRule, RuleDisposition};
    use crate::test_support::{ScriptedDispatcher, ToolBehavior};
    use gantry_core::{ApprovalConfig, RiskLevel};
    use std::sync::Mutex;

    fn executor_with(
        dir: &Path,
        dispatcher: ScriptedDispatcher,
    ) -> (RunExecutor, Arc<ApprovalGateway>) {
        crate::test_support::init_tracing();
        let gateway = Arc::new(
            ApprovalGateway::new(dir.join("approvals"), &ApprovalConfig::default()).unwrap(),
        );
        let executor = RunExecutor::new(
            dir.join("runs"),
            dir.join("artifacts"),
            ExecutorConfig::default(),
            Arc::new(dispatcher),
            Arc::clone(&gateway),
        )
        .unwrap();
        (executor, gateway)
    }

    #[tokio::test]
    async fn test_successful_run_emits_events_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("read_file", ToolBehavior::Succeed("short".to_string()))
            .with_tool("list_files", ToolBehavior::Succeed("also short".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            executor.on_event(move |event| {
                events.lock().unwrap().push(event.name().to_string());
                Ok(())
            });
        }

        let steps = vec![
            PlanStep::new("s1", "read_file"),
            PlanStep::new("s2", "list_files"),
        ];
        let manifest = executor
            .execute_plan("plan-1", steps, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Success);
        assert_eq!(manifest.completed_steps, 2);
        assert_eq!(manifest.failed_steps, 0);
        assert!(manifest.completed_at.is_some());
        assert_eq!(manifest.step_results.len(), 2);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "run_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "run_completed",
            ]
        );

        // Persist/reload round trip is field-for-field.
        let loaded = executor.load_manifest(&manifest.run_id).await.unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn test_first_failure_halts_run() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("breaks", ToolBehavior::Fail("no such file".to_string()))
            .with_tool("never_runs", ToolBehavior::Succeed("x".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher.clone());

        let steps = vec![
            PlanStep::new("s1", "breaks"),
            PlanStep::new("s2", "never_runs"),
        ];
        let manifest = executor
            .execute_plan("plan-1", steps, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Failed);
        assert_eq!(manifest.completed_steps, 0);
        assert_eq!(manifest.failed_steps, 1);
        assert_eq!(manifest.step_results.len(), 1);
        assert_eq!(manifest.step_results[0].status, StepStatus::Failed);

        // Step 2 was never attempted.
        assert_eq!(dispatcher.calls(), vec!["breaks".to_string()]);
    }

    #[tokio::test]
    async fn test_continue_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("breaks", ToolBehavior::Fail("nope".to_string()))
            .with_tool("still_runs", ToolBehavior::Succeed("ok".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher.clone());

        let steps = vec![
            PlanStep::new("s1", "breaks"),
            PlanStep::new("s2", "still_runs"),
        ];
        let manifest = executor
            .execute_plan(
                "plan-1",
                steps,
                ExecuteOptions::default().with_continue_on_failure(),
            )
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Failed);
        assert_eq!(manifest.completed_steps, 1);
        assert_eq!(manifest.failed_steps, 1);
        assert_eq!(dispatcher.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_has_no_external_effect() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("shell_execute", ToolBehavior::Succeed("x".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher.clone());

        let steps = vec![PlanStep::new("s1", "shell_execute")
            .with_parameters(serde_json::json!({"command": "rm file"}))];
        let manifest = executor
            .execute_plan("plan-1", steps, ExecuteOptions::dry_run())
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Success);
        assert_eq!(manifest.step_results[0].status, StepStatus::Simulated);
        assert!(manifest.step_results[0]
            .output
            .as_deref()
            .unwrap()
            .starts_with("[DRY RUN]"));
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_large_output_spills_to_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let big_output = "x".repeat(150);
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("list_files", ToolBehavior::Succeed(big_output.clone()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let manifest = executor
            .execute_plan(
                "plan-1",
                vec![PlanStep::new("s1", "list_files")],
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let artifact_path = manifest.step_results[0].artifact_path.clone().unwrap();
        assert_eq!(manifest.artifacts, vec![artifact_path.clone()]);

        // Reading the artifact back reproduces the recorded output.
        let body = tokio::fs::read_to_string(&artifact_path).await.unwrap();
        let artifact: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(artifact["output"], serde_json::json!(big_output));
        assert_eq!(artifact["step_id"], serde_json::json!("s1"));
        assert_eq!(artifact["metadata"]["output_size"], serde_json::json!(150));
    }

    #[tokio::test]
    async fn test_small_output_stays_inline() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("read_file", ToolBehavior::Succeed("tiny".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let manifest = executor
            .execute_plan(
                "plan-1",
                vec![PlanStep::new("s1", "read_file")],
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        assert!(manifest.step_results[0].artifact_path.is_none());
        assert!(manifest.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_is_terminal_not_a_hang() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new().with_tool(
            "slow_tool",
            ToolBehavior::Hang(Duration::from_secs(5)),
        );
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let steps = vec![PlanStep::new("s1", "slow_tool").with_timeout_secs(1)];
        let manifest = executor
            .execute_plan("plan-1", steps, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Failed);
        assert_eq!(manifest.step_results[0].status, StepStatus::Timeout);
        assert!(manifest.step_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn test_step_range_selection_and_degradation() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("t1", ToolBehavior::Succeed("1".to_string()))
            .with_tool("t2", ToolBehavior::Succeed("2".to_string()))
            .with_tool("t3", ToolBehavior::Succeed("3".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher.clone());

        let steps = || {
            vec![
                PlanStep::new("s1", "t1"),
                PlanStep::new("s2", "t2"),
                PlanStep::new("s3", "t3"),
            ]
        };

        // Single step.
        let manifest = executor
            .execute_plan(
                "plan-1",
                steps(),
                ExecuteOptions::default().with_step_range("2"),
            )
            .await
            .unwrap();
        assert_eq!(manifest.total_steps, 1);
        assert_eq!(dispatcher.calls(), vec!["t2".to_string()]);

        // Inclusive range.
        let manifest = executor
            .execute_plan(
                "plan-1",
                steps(),
                ExecuteOptions::default().with_step_range("1-2"),
            )
            .await
            .unwrap();
        assert_eq!(manifest.total_steps, 2);

        // Unparsable range degrades to the full list.
        let manifest = executor
            .execute_plan(
                "plan-1",
                steps(),
                ExecuteOptions::default().with_step_range("two-ish"),
            )
            .await
            .unwrap();
        assert_eq!(manifest.total_steps, 3);
        assert_eq!(manifest.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_denied_approval_skips_step() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("deploy", ToolBehavior::Succeed("deployed".to_string()));
        let (executor, gateway) = executor_with(dir.path(), dispatcher.clone());

        gateway.add_rule(
            ApprovalRule::new("no_deploys", "No deploys", RuleDisposition::AutoDeny)
                .with_tool_patterns(vec!["^deploy$".to_string()])
                .with_priority(0),
        );

        let steps = vec![PlanStep::new("s1", "deploy").with_approval(RiskLevel::High)];
        let manifest = executor
            .execute_plan("plan-1", steps, ExecuteOptions::default())
            .await
            .unwrap();

        // Denied: recorded as skipped, not failed; the run itself did
        // not complete.
        assert_eq!(manifest.status, RunStatus::Failed);
        assert_eq!(manifest.skipped_steps, 1);
        assert_eq!(manifest.failed_steps, 0);
        assert_eq!(manifest.step_results[0].status, StepStatus::Skipped);
        assert!(dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_approve_bypasses_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("deploy", ToolBehavior::Succeed("deployed".to_string()));
        let (executor, gateway) = executor_with(dir.path(), dispatcher.clone());

        gateway.add_rule(
            ApprovalRule::new("no_deploys", "No deploys", RuleDisposition::AutoDeny)
                .with_tool_patterns(vec!["^deploy$".to_string()])
                .with_priority(0),
        );

        let steps = vec![PlanStep::new("s1", "deploy").with_approval(RiskLevel::High)];
        let manifest = executor
            .execute_plan(
                "plan-1",
                steps,
                ExecuteOptions::default().with_auto_approve(),
            )
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Success);
        assert_eq!(dispatcher.calls(), vec!["deploy".to_string()]);
    }

    #[tokio::test]
    async fn test_pause_and_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new().with_tool(
            "steady",
            ToolBehavior::Hang(Duration::from_millis(100)),
        );
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let run_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        {
            let run_id = Arc::clone(&run_id);
            executor.on_event(move |event| {
                if let RunEvent::RunStarted { run_id: id, .. } = event {
                    *run_id.lock().unwrap() = Some(id.clone());
                }
                Ok(())
            });
        }

        let steps = vec![
            PlanStep::new("s1", "steady"),
            PlanStep::new("s2", "steady"),
            PlanStep::new("s3", "steady"),
        ];
        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute_plan("plan-1", steps, ExecuteOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let run_id = run_id.lock().unwrap().clone().unwrap();

        assert!(executor.pause_execution(&run_id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        let paused = executor.get_run_status(&run_id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        // At most the in-flight step finished while pausing.
        assert!(paused.step_results.len() <= 1);

        assert!(executor.resume_execution(&run_id).await.unwrap());
        let manifest = handle.await.unwrap().unwrap();
        assert_eq!(manifest.status, RunStatus::Success);
        assert_eq!(manifest.completed_steps, 3);

        // Controls on a finished run are refused.
        assert!(!executor.pause_execution(&run_id).await.unwrap());
        assert!(!executor.stop_execution(&run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_aborts_between_steps() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new().with_tool(
            "steady",
            ToolBehavior::Hang(Duration::from_millis(100)),
        );
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let run_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        {
            let run_id = Arc::clone(&run_id);
            executor.on_event(move |event| {
                if let RunEvent::RunStarted { run_id: id, .. } = event {
                    *run_id.lock().unwrap() = Some(id.clone());
                }
                Ok(())
            });
        }

        let steps = vec![
            PlanStep::new("s1", "steady"),
            PlanStep::new("s2", "steady"),
            PlanStep::new("s3", "steady"),
        ];
        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute_plan("plan-1", steps, ExecuteOptions::default())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let run_id = run_id.lock().unwrap().clone().unwrap();
        assert!(executor.stop_execution(&run_id).await.unwrap());

        let manifest = handle.await.unwrap().unwrap();
        assert_eq!(manifest.status, RunStatus::Aborted);
        assert!(manifest.completed_at.is_some());
        assert!(manifest.step_results.len() < 3);

        // The persisted manifest is terminal too.
        let loaded = executor.load_manifest(&run_id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_list_and_delete_runs() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = ScriptedDispatcher::new()
            .with_tool("ok", ToolBehavior::Succeed("fine".to_string()))
            .with_tool("bad", ToolBehavior::Fail("broken".to_string()));
        let (executor, _gateway) = executor_with(dir.path(), dispatcher);

        let good = executor
            .execute_plan(
                "plan-a",
                vec![PlanStep::new("s1", "ok")],
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let bad = executor
            .execute_plan(
                "plan-b",
                vec![PlanStep::new("s1", "bad")],
                ExecuteOptions::default(),
            )
            .await
            .unwrap();

        let all = executor.list_runs(None, None, 50).await;
        assert_eq!(all.len(), 2);

        let failed = executor.list_runs(None, Some(RunStatus::Failed), 50).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].run_id, bad.run_id);

        let by_plan = executor.list_runs(Some("plan-a"), None, 50).await;
        assert_eq!(by_plan.len(), 1);
        assert_eq!(by_plan[0].progress, "1/1");

        assert!(executor.delete_run(&good.run_id).await);
        assert!(!executor.delete_run(&good.run_id).await);
        assert!(executor.get_run_status(&good.run_id).await.is_none());
    }

    #[test]
    fn test_filter_steps_by_range_edges() {
        let steps: Vec<PlanStep> = (1..=4)
            .map(|i| PlanStep::new(format!("s{}", i), "t"))
            .collect();

        let ids = |steps: &[PlanStep]| -> Vec<String> {
            steps.iter().map(|s| s.id.clone()).collect()
        };

        assert_eq!(
            ids(&filter_steps_by_range(steps.clone(), None)),
            vec!["s1", "s2", "s3", "s4"]
        );
        assert_eq!(ids(&filter_steps_by_range(steps.clone(), Some("3"))), vec!["s3"]);
        assert_eq!(
            ids(&filter_steps_by_range(steps.clone(), Some("2-3"))),
            vec!["s2", "s3"]
        );
        // Clamped to the list length.
        assert_eq!(
            ids(&filter_steps_by_range(steps.clone(), Some("3-9"))),
            vec!["s3", "s4"]
        );
        // Out of range yields an empty plan.
        assert!(filter_steps_by_range(steps.clone(), Some("9")).is_empty());
        assert!(filter_steps_by_range(steps.clone(), Some("3-2")).is_empty());
        // Garbage degrades to the full list.
        assert_eq!(filter_steps_by_range(steps, Some("x-y")).len(), 4);
    }
}
