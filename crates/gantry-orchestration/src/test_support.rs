//! Shared test doubles for the orchestration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_core::{CoreError, ToolContext, ToolDispatcher, ToolOutcome};

/// Initialize test logging once per process; honors `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a scripted tool does when invoked.
#[derive(Debug, Clone)]
pub(crate) enum ToolBehavior {
    /// Succeed with the given output
    Succeed(String),
    /// Fail with the given error message (exit code 1)
    Fail(String),
    /// Sleep for the given duration, then succeed
    Hang(Duration),
}

/// A dispatcher whose tools are scripted per name. Clones share the
/// recorded call log.
#[derive(Clone, Default)]
pub(crate) struct ScriptedDispatcher {
    behaviors: HashMap<String, ToolBehavior>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: impl Into<String>, behavior: ToolBehavior) -> Self {
        self.behaviors.insert(name.into(), behavior);
        self
    }

    /// Tool names dispatched so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        tool_name: &str,
        _params: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> gantry_core::Result<ToolOutcome> {
        self.calls.lock().unwrap().push(tool_name.to_string());

        match self.behaviors.get(tool_name) {
            None => Err(CoreError::ToolFailure(format!(
                "Tool '{}' not found",
                tool_name
            ))),
            Some(ToolBehavior::Succeed(output)) => Ok(ToolOutcome::success(output.clone(), 5)),
            Some(ToolBehavior::Fail(error)) => Ok(ToolOutcome::failure(error.clone(), Some(1))),
            Some(ToolBehavior::Hang(duration)) => {
                tokio::time::sleep(*duration).await;
                Ok(ToolOutcome::success("done", duration.as_millis() as u64))
            }
        }
    }

    fn is_known(&self, tool_name: &str) -> bool {
        self.behaviors.contains_key(tool_name)
    }
}
