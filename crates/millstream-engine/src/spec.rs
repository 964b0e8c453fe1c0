//! Workflow specification tree.
//!
//! The engine consumes an immutable, already-validated spec tree produced by
//! the external workflow-language parser. Everything here is plain data;
//! expression strings inside it are opaque to the engine and handed to the
//! [`Evaluator`](crate::expr::Evaluator) together with a context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Routing strategy of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Routed by on-success/on-error/on-complete edges from starts to ends
    Direct,

    /// Routed from declared target tasks backward along `requires` edges
    Reverse,
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Action,
    Workflow,
}

/// A declared workflow input parameter, optionally with a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl InputParam {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// Immutable workflow specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(rename = "type", default = "WorkflowSpec::default_type")]
    pub workflow_type: WorkflowType,

    /// Declared input parameters.
    #[serde(default)]
    pub input: Vec<InputParam>,

    /// Output expression evaluated against the final context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Workflow variables, evaluated once at start against the input.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,

    /// Tasks by name.
    pub tasks: BTreeMap<String, TaskSpec>,
}

impl WorkflowSpec {
    fn default_type() -> WorkflowType {
        WorkflowType::Direct
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    /// Names of predecessors routing into `name`, with the triggering event.
    pub fn incoming_edges(&self, name: &str) -> Vec<(&str, TaskEvent)> {
        let mut edges = Vec::new();

        for (pred_name, pred) in &self.tasks {
            if pred.on_success.iter().any(|t| t == name) {
                edges.push((pred_name.as_str(), TaskEvent::OnSuccess));
            }
            if pred.on_error.iter().any(|t| t == name) {
                edges.push((pred_name.as_str(), TaskEvent::OnError));
            }
            if pred.on_complete.iter().any(|t| t == name) {
                edges.push((pred_name.as_str(), TaskEvent::OnComplete));
            }
        }

        edges
    }

    /// Tasks with no incoming routing edges (the start set of a direct
    /// workflow).
    pub fn start_tasks(&self) -> Vec<&TaskSpec> {
        self.tasks
            .values()
            .filter(|t| self.incoming_edges(&t.name).is_empty())
            .collect()
    }
}

/// Event that fires a routing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskEvent {
    OnSuccess,
    OnError,
    OnComplete,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnSuccess => write!(f, "on-success"),
            Self::OnError => write!(f, "on-error"),
            Self::OnComplete => write!(f, "on-complete"),
        }
    }
}

/// Specification of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,

    /// Action to invoke; mutually exclusive with `workflow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Sub-workflow to start; mutually exclusive with `action`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,

    /// Input expressions for the action / sub-workflow.
    #[serde(default)]
    pub input: BTreeMap<String, Value>,

    /// Variables published into the workflow context on success.
    #[serde(default)]
    pub publish: BTreeMap<String, Value>,

    /// Variables published into the workflow context on error.
    #[serde(default)]
    pub publish_on_error: BTreeMap<String, Value>,

    /// Iteration clause: one action execution per item tuple.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<WithItemsSpec>,

    /// Concurrency bound for with-items: an integer or an expression
    /// evaluating to one. Absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Value>,

    /// Retry policy applied to failed action executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Seconds to wait before the task starts doing work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,

    /// Seconds after which a dispatched action is considered timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub on_success: Vec<String>,

    #[serde(default)]
    pub on_error: Vec<String>,

    #[serde(default)]
    pub on_complete: Vec<String>,

    /// Join mode: wait for all / one / N incoming edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,

    /// Prerequisite tasks (reverse workflows only).
    #[serde(default)]
    pub requires: Vec<String>,
}

impl TaskSpec {
    /// Minimal task running a named action.
    pub fn action(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Some(action.into()),
            workflow: None,
            input: BTreeMap::new(),
            publish: BTreeMap::new(),
            publish_on_error: BTreeMap::new(),
            with_items: None,
            concurrency: None,
            retry: None,
            wait: None,
            timeout: None,
            on_success: Vec::new(),
            on_error: Vec::new(),
            on_complete: Vec::new(),
            join: None,
            requires: Vec::new(),
        }
    }

    /// Minimal task starting a sub-workflow.
    pub fn sub_workflow(name: impl Into<String>, workflow: impl Into<String>) -> Self {
        let mut spec = Self::action(name, "");
        spec.action = None;
        spec.workflow = Some(workflow.into());
        spec
    }

    pub fn task_type(&self) -> TaskType {
        if self.workflow.is_some() {
            TaskType::Workflow
        } else {
            TaskType::Action
        }
    }

    /// Next-task names for the given completion event.
    pub fn next_on(&self, event: TaskEvent) -> &[String] {
        match event {
            TaskEvent::OnSuccess => &self.on_success,
            TaskEvent::OnError => &self.on_error,
            TaskEvent::OnComplete => &self.on_complete,
        }
    }
}

/// `with-items` clause: parallel bindings over equally indexed collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithItemsSpec {
    pub bindings: Vec<ItemsBinding>,
}

impl WithItemsSpec {
    /// Single binding `var in <expression-or-list>`.
    pub fn new(var: impl Into<String>, items: Value) -> Self {
        Self {
            bindings: vec![ItemsBinding {
                var: var.into(),
                items,
            }],
        }
    }
}

/// One `var in collection` binding of a with-items clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsBinding {
    pub var: String,

    /// A literal JSON array or an expression evaluating to one.
    pub items: Value,
}

/// Join requirement of a task with multiple inbound routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinSpec {
    /// `join: all` / `join: one`
    Mode(JoinMode),

    /// `join: N`: wait for N predecessors
    Count(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    All,
    One,
}

impl JoinSpec {
    /// Number of fired inbound routes required, given the total edge count.
    pub fn required(&self, total_edges: usize) -> usize {
        match self {
            Self::Mode(JoinMode::All) => total_edges,
            Self::Mode(JoinMode::One) => 1,
            Self::Count(n) => (*n as usize).min(total_edges),
        }
    }
}

/// Retry policy of a task.
///
/// A failed action execution is retried up to `count` times with `delay`
/// seconds between attempts, unless `break_on` evaluates to true or
/// `continue_on` (when present) evaluates to false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub count: u32,

    /// Delay between attempts, in seconds.
    #[serde(default)]
    pub delay: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<String>,
}

impl RetrySpec {
    pub fn new(count: u32, delay: u64) -> Self {
        Self {
            count,
            delay,
            break_on: None,
            continue_on: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_spec() -> WorkflowSpec {
        let mut task1 = TaskSpec::action("task1", "std.echo");
        task1.on_success.push("task2".to_string());
        let task2 = TaskSpec::action("task2", "std.echo");

        WorkflowSpec {
            name: "wf".to_string(),
            workflow_type: WorkflowType::Direct,
            input: vec![],
            output: None,
            vars: BTreeMap::new(),
            tasks: BTreeMap::from([
                ("task1".to_string(), task1),
                ("task2".to_string(), task2),
            ]),
        }
    }

    #[test]
    fn test_start_tasks() {
        let spec = linear_spec();
        let starts = spec.start_tasks();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].name, "task1");
    }

    #[test]
    fn test_incoming_edges() {
        let spec = linear_spec();
        let edges = spec.incoming_edges("task2");
        assert_eq!(edges, vec![("task1", TaskEvent::OnSuccess)]);
        assert!(spec.incoming_edges("task1").is_empty());
    }

    #[test]
    fn test_task_type() {
        assert_eq!(TaskSpec::action("t", "a").task_type(), TaskType::Action);
        assert_eq!(
            TaskSpec::sub_workflow("t", "sub").task_type(),
            TaskType::Workflow
        );
    }

    #[test]
    fn test_join_required() {
        assert_eq!(JoinSpec::Mode(JoinMode::All).required(3), 3);
        assert_eq!(JoinSpec::Mode(JoinMode::One).required(3), 1);
        assert_eq!(JoinSpec::Count(2).required(3), 2);
        assert_eq!(JoinSpec::Count(5).required(3), 3);
    }

    #[test]
    fn test_join_spec_deserialization() {
        let all: JoinSpec = serde_json::from_value(json!("all")).expect("should parse");
        assert_eq!(all, JoinSpec::Mode(JoinMode::All));

        let count: JoinSpec = serde_json::from_value(json!(2)).expect("should parse");
        assert_eq!(count, JoinSpec::Count(2));
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = linear_spec();
        let value = serde_json::to_value(&spec).expect("should serialize");
        let parsed: WorkflowSpec = serde_json::from_value(value).expect("should parse");
        assert_eq!(parsed, spec);
    }
}
