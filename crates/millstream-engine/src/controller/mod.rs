//! Workflow controllers.
//!
//! A controller is a pure function over the workflow spec and the current
//! task set: given what has run, which tasks are runnable now? It creates
//! nothing itself; the task handler materializes the selections, with the
//! unique-key constraint as the store-level backstop against double
//! emission under races.

mod direct;
mod reverse;

pub use direct::DirectController;
pub use reverse::ReverseController;

use crate::error::EngineError;
use crate::persistence::{TaskExecution, WorkflowExecution};
use crate::spec::WorkflowType;

/// A task the controller wants materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSelection {
    pub name: String,

    /// Create in WAITING only: a join target with fired but insufficient
    /// inbound routes.
    pub waiting: bool,
}

impl TaskSelection {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            waiting: false,
        }
    }

    pub fn waiting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            waiting: true,
        }
    }
}

/// Strategy deciding which tasks run next.
pub trait WorkflowController: Send + Sync {
    /// Compute the next selections for a workflow given its current task
    /// executions. Must be deterministic and side-effect free.
    fn next_tasks(
        &self,
        wf_ex: &WorkflowExecution,
        task_execs: &[TaskExecution],
    ) -> Result<Vec<TaskSelection>, EngineError>;
}

static DIRECT: DirectController = DirectController;
static REVERSE: ReverseController = ReverseController;

/// Controller for a workflow type.
pub fn controller_for(workflow_type: WorkflowType) -> &'static dyn WorkflowController {
    match workflow_type {
        WorkflowType::Direct => &DIRECT,
        WorkflowType::Reverse => &REVERSE,
    }
}
