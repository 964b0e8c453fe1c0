//! Post-commit command queue.
//!
//! Side effects produced inside a transaction (dispatching actions,
//! scheduling follow-up work, interrupting actions) must never be sent for
//! states the database never persisted. Handlers buffer them here; the
//! engine drains the buffer in FIFO order after a successful commit and
//! discards it on rollback. Drained commands run outside any transaction;
//! failures are logged, never retried; the at-least-once safety net for a
//! lost command is the integrity monitor.

use serde_json::Value;
use uuid::Uuid;

use crate::executor::ActionDispatch;
use crate::persistence::ScheduledJob;

/// A deferred side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Hand an action execution to the executor.
    RunAction { dispatch: ActionDispatch },

    /// Start a sub-workflow for a task iteration.
    StartSubWorkflow {
        task_execution_id: Uuid,
        workflow: String,
        namespace: String,
        input: Value,
        index: u32,
        attempt: u32,
    },

    /// Schedule evaluation of a task after one of its children finished.
    ScheduleOnActionComplete {
        child_id: Uuid,

        /// Whether the child is a sub-workflow execution rather than an
        /// action execution.
        workflow_child: bool,
    },

    /// Schedule a workflow completion check.
    CheckAndComplete { workflow_execution_id: Uuid },

    /// Ask the executor to interrupt a running action.
    InterruptAction { action_execution_id: Uuid },

    /// Persist a scheduler job.
    ScheduleJob { job: ScheduledJob },
}

/// Per-transaction buffer of deferred commands.
///
/// Never shared between transactions: each handler entry creates its own
/// queue and the engine consumes it right after the commit.
#[derive(Debug, Default)]
pub struct PostCommitQueue {
    commands: Vec<Command>,
}

impl PostCommitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Take all buffered commands in FIFO order.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = PostCommitQueue::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        queue.push(Command::CheckAndComplete {
            workflow_execution_id: a,
        });
        queue.push(Command::InterruptAction {
            action_execution_id: b,
        });

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0],
            Command::CheckAndComplete { workflow_execution_id } if workflow_execution_id == a
        ));
        assert!(matches!(
            drained[1],
            Command::InterruptAction { action_execution_id } if action_execution_id == b
        ));
        assert!(queue.is_empty());
    }
}
