//! Typed run lifecycle events.
//!
//! Handlers are notification-only: errors are logged and swallowed,
//! never propagated into the run loop.

use serde::Serialize;

use crate::manifest::{RunManifest, StepExecutionResult};

/// A named lifecycle hook with its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        manifest: RunManifest,
    },
    StepStarted {
        run_id: String,
        step_id: String,
        tool_name: String,
    },
    StepCompleted {
        run_id: String,
        step_id: String,
        result: StepExecutionResult,
    },
    StepFailed {
        run_id: String,
        step_id: String,
        result: StepExecutionResult,
    },
    RunCompleted {
        run_id: String,
        manifest: RunManifest,
    },
    RunFailed {
        run_id: String,
        manifest: RunManifest,
    },
}

impl RunEvent {
    /// Hook name, as exposed to monitoring integrations.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::StepCompleted { .. } => "step_completed",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }

    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. } => run_id,
        }
    }
}

type HandlerError = Box<dyn std::error::Error + Send + Sync>;
type Handler = Box<dyn Fn(&RunEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Registry of event handlers.
#[derive(Default)]
pub struct EventHandlers {
    handlers: Vec<Handler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every event.
    pub fn register<F>(&mut self, handler: F)
    where
        F: Fn(&RunEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Invoke all handlers; failures are logged, never raised.
    pub fn emit(&self, event: &RunEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler(event) {
                tracing::warn!(
                    event = event.name(),
                    run_id = event.run_id(),
                    error = %e,
                    "Event handler error"
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_emit_reaches_all_handlers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut handlers = EventHandlers::new();

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            handlers.register(move |event| {
                assert_eq!(event.name(), "step_started");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        handlers.emit(&RunEvent::StepStarted {
            run_id: "r1".to_string(),
            step_id: "s1".to_string(),
            tool_name: "read_file".to_string(),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_error_is_swallowed() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut handlers = EventHandlers::new();

        handlers.register(|_| Err("observer broke".into()));
        {
            let seen = Arc::clone(&seen);
            handlers.register(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        // The failing handler must not stop the second one.
        handlers.emit(&RunEvent::RunFailed {
            run_id: "r1".to_string(),
            manifest: crate::manifest::RunManifest::new("r1", "p1", 0),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
