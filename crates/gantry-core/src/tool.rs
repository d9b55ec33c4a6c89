//! The tool dispatch seam.
//!
//! The run executor and workflow adapter treat every external
//! capability (shell execution, file I/O, git, HTTP, ...) as an opaque
//! [`ToolDispatcher`] call bounded by the caller's own timeout wrapper.
//! Implementations live outside this workspace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::Result;

/// Context handed to a tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Working directory for the invocation
    pub working_dir: PathBuf,
    /// Free-text description of the task driving this invocation
    pub task_description: String,
    /// Session-scoped data shared across invocations
    pub session_data: HashMap<String, serde_json::Value>,
}

impl ToolContext {
    /// Create a context rooted at the given working directory.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            task_description: String::new(),
            session_data: HashMap::new(),
        }
    }

    /// Set the driving task description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.task_description = description.into();
        self
    }

    /// Add a session value.
    pub fn with_session_value(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.session_data.insert(key.into(), value);
        self
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the tool reported success
    pub success: bool,
    /// Captured output, if any
    pub output: Option<String>,
    /// Error message, if any
    pub error: Option<String>,
    /// Process exit code, for tools that run subprocesses
    pub exit_code: Option<i32>,
    /// Wall-clock execution time in milliseconds
    pub duration_ms: u64,
}

impl ToolOutcome {
    /// Build a successful outcome.
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            exit_code: Some(0),
            duration_ms,
        }
    }

    /// Build a failed outcome.
    pub fn failure(error: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            exit_code,
            duration_ms: 0,
        }
    }

    /// Length in bytes of the captured output.
    pub fn output_len(&self) -> usize {
        self.output.as_deref().map(str::len).unwrap_or(0)
    }
}

/// Dispatch interface to the external tool ecosystem.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Invoke the named tool with a parameter mapping.
    ///
    /// An `Err` means the dispatch machinery itself broke; a tool that
    /// ran and failed returns `Ok` with `success == false`.
    async fn dispatch(
        &self,
        tool_name: &str,
        params: &serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome>;

    /// Whether the named tool is registered and enabled.
    fn is_known(&self, tool_name: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        let ok = ToolOutcome::success("done", 12);
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.output_len(), 4);

        let bad = ToolOutcome::failure("boom", Some(1));
        assert!(!bad.success);
        assert_eq!(bad.error.as_deref(), Some("boom"));
        assert_eq!(bad.output_len(), 0);
    }

    #[test]
    fn test_context_builder() {
        let ctx = ToolContext::new("/tmp/work")
            .with_description("read the readme")
            .with_session_value("attempt", serde_json::json!(1));

        assert_eq!(ctx.working_dir, PathBuf::from("/tmp/work"));
        assert_eq!(ctx.task_description, "read the readme");
        assert_eq!(ctx.session_data.get("attempt"), Some(&serde_json::json!(1)));
    }

    struct EchoDispatcher;

    #[async_trait]
    impl ToolDispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            tool_name: &str,
            params: &serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome> {
            Ok(ToolOutcome::success(format!("{}: {}", tool_name, params), 1))
        }

        fn is_known(&self, tool_name: &str) -> bool {
            tool_name == "echo"
        }
    }

    #[tokio::test]
    async fn test_dispatcher_contract() {
        let dispatcher = EchoDispatcher;
        assert!(dispatcher.is_known("echo"));
        assert!(!dispatcher.is_known("shell_execute"));

        let outcome = dispatcher
            .dispatch("echo", &serde_json::json!({"msg": "hi"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.output.unwrap().starts_with("echo:"));
    }
}
