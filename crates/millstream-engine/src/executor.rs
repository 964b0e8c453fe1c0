//! Action executor contract.
//!
//! Action implementations live outside the engine. The engine submits work
//! through [`ActionExecutor::run`] and receives completions back through
//! [`Engine::on_action_complete`](crate::engine::Engine::on_action_complete)
//! / `on_action_update`, at least once; completion is idempotent on the
//! engine side.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Errors reported by an executor when accepting work.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor refused the action (unknown action, bad input).
    #[error("action rejected: {0}")]
    Rejected(String),

    /// The executor cannot take work right now.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// A unit of work handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDispatch {
    pub action_execution_id: Uuid,
    pub action_name: String,
    pub input: Value,
    pub is_sync: bool,

    /// Absolute deadline derived from the task's timeout policy, if any.
    pub deadline: Option<DateTime<Utc>>,
}

/// Result of an action execution, reported through `on_action_complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub output: Value,
    pub error: Option<String>,

    /// Typed marker for deadline expiry; replaces matching on the error
    /// message text.
    pub timed_out: bool,

    pub cancelled: bool,
}

impl ActionResult {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            error: None,
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            error: Some(message.into()),
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            error: Some(message.into()),
            timed_out: true,
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            output: Value::Null,
            error: None,
            timed_out: false,
            cancelled: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Executor contract consumed by the engine.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    /// Submit an action for execution. Returning `Ok` only acknowledges
    /// acceptance; the result arrives later via `on_action_complete`.
    async fn run(&self, dispatch: ActionDispatch) -> Result<(), ExecutorError>;

    /// Ask the executor to interrupt a running action. Cooperative: the
    /// engine does not wait for the interrupt to take effect.
    async fn interrupt(&self, action_execution_id: Uuid) -> Result<(), ExecutorError>;
}

/// An executor that queues dispatches instead of executing them.
///
/// Embedders (and the test suite) drain the queue and feed results back via
/// `on_action_complete`, which makes action timing fully controllable.
#[derive(Default)]
pub struct QueueExecutor {
    dispatched: parking_lot::Mutex<VecDeque<ActionDispatch>>,
    interrupted: parking_lot::Mutex<Vec<Uuid>>,
}

impl QueueExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest pending dispatch, if any.
    pub fn next_dispatch(&self) -> Option<ActionDispatch> {
        self.dispatched.lock().pop_front()
    }

    /// Number of dispatches waiting to be driven.
    pub fn pending(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Actions the engine asked to interrupt.
    pub fn interrupted(&self) -> Vec<Uuid> {
        self.interrupted.lock().clone()
    }
}

#[async_trait]
impl ActionExecutor for QueueExecutor {
    async fn run(&self, dispatch: ActionDispatch) -> Result<(), ExecutorError> {
        self.dispatched.lock().push_back(dispatch);
        Ok(())
    }

    async fn interrupt(&self, action_execution_id: Uuid) -> Result<(), ExecutorError> {
        self.interrupted.lock().push(action_execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_result_classification() {
        assert!(ActionResult::ok(json!("x")).is_success());
        assert!(!ActionResult::error("boom").is_success());
        assert!(!ActionResult::cancelled().is_success());

        let timed_out = ActionResult::timed_out("deadline exceeded");
        assert!(timed_out.timed_out);
        assert!(!timed_out.is_success());
    }

    #[tokio::test]
    async fn test_queue_executor_records_dispatches() {
        let executor = QueueExecutor::new();
        let dispatch = ActionDispatch {
            action_execution_id: Uuid::now_v7(),
            action_name: "std.echo".into(),
            input: json!({"output": "A"}),
            is_sync: true,
            deadline: None,
        };

        executor.run(dispatch.clone()).await.expect("should accept");
        assert_eq!(executor.pending(), 1);
        assert_eq!(executor.next_dispatch(), Some(dispatch));
        assert_eq!(executor.pending(), 0);

        let id = Uuid::now_v7();
        executor.interrupt(id).await.expect("should accept");
        assert_eq!(executor.interrupted(), vec![id]);
    }
}
