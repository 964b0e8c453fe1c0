//! Direct workflow controller.

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::persistence::{TaskExecution, WorkflowExecution};
use crate::spec::TaskEvent;
use crate::state::State;

use super::{TaskSelection, WorkflowController};

/// Routes tasks along `on-success` / `on-error` / `on-complete` edges from
/// the start set towards the ends.
///
/// Join targets are emitted WAITING as soon as one inbound route fires and
/// READY once enough distinct predecessors have fired (`all`, `one` or a
/// count). At most one selection is produced per task name.
pub struct DirectController;

impl WorkflowController for DirectController {
    fn next_tasks(
        &self,
        wf_ex: &WorkflowExecution,
        task_execs: &[TaskExecution],
    ) -> Result<Vec<TaskSelection>, EngineError> {
        let by_name: HashMap<&str, &TaskExecution> = task_execs
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        let mut selections = Vec::new();

        for (name, _spec) in &wf_ex.spec.tasks {
            // Tasks that already ran (anything but a WAITING placeholder)
            // are never re-emitted.
            if let Some(existing) = by_name.get(name.as_str()) {
                if existing.state != State::Waiting {
                    continue;
                }
            }

            let edges = wf_ex.spec.incoming_edges(name);

            if edges.is_empty() {
                // Start task: runnable exactly once, at the beginning.
                if !by_name.contains_key(name.as_str()) {
                    selections.push(TaskSelection::ready(name));
                }
                continue;
            }

            let mut fired: HashSet<&str> = HashSet::new();
            for (pred_name, event) in &edges {
                let Some(pred) = by_name.get(pred_name) else {
                    continue;
                };
                if !pred.state.is_completed() || !pred.processed {
                    continue;
                }

                let fires = match event {
                    TaskEvent::OnSuccess => pred.state == State::Success,
                    TaskEvent::OnError => pred.state == State::Error,
                    TaskEvent::OnComplete => {
                        matches!(pred.state, State::Success | State::Error)
                    }
                };
                if fires {
                    fired.insert(pred_name);
                }
            }

            if fired.is_empty() {
                continue;
            }

            let spec = wf_ex
                .spec
                .task(name)
                .expect("iterating the spec's own tasks");

            match &spec.join {
                None => selections.push(TaskSelection::ready(name)),
                Some(join) => {
                    let distinct_preds: HashSet<&str> =
                        edges.iter().map(|(p, _)| *p).collect();
                    let required = join.required(distinct_preds.len());

                    if fired.len() >= required {
                        selections.push(TaskSelection::ready(name));
                    } else {
                        selections.push(TaskSelection::waiting(name));
                    }
                }
            }
        }

        Ok(selections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{ExecutionParams, WorkflowExecution};
    use crate::spec::{JoinMode, JoinSpec, TaskSpec, WorkflowSpec, WorkflowType};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn workflow(tasks: Vec<TaskSpec>) -> WorkflowExecution {
        let spec = WorkflowSpec {
            name: "wf".into(),
            workflow_type: WorkflowType::Direct,
            input: vec![],
            output: None,
            vars: BTreeMap::new(),
            tasks: tasks.into_iter().map(|t| (t.name.clone(), t)).collect(),
        };
        WorkflowExecution::new(spec, json!({}), ExecutionParams::default())
    }

    fn completed_task(
        wf_ex: &WorkflowExecution,
        name: &str,
        state: State,
    ) -> TaskExecution {
        let spec = wf_ex.spec.task(name).expect("task must exist").clone();
        let mut task = TaskExecution::new(wf_ex.id, spec, json!({}));
        task.state = state;
        task.processed = true;
        task
    }

    fn linear() -> WorkflowExecution {
        let mut task1 = TaskSpec::action("task1", "std.echo");
        task1.on_success.push("task2".into());
        let task2 = TaskSpec::action("task2", "std.echo");
        workflow(vec![task1, task2])
    }

    #[test]
    fn test_initial_selection_is_start_set() {
        let wf = linear();
        let selections = DirectController
            .next_tasks(&wf, &[])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("task1")]);
    }

    #[test]
    fn test_on_success_routes_forward() {
        let wf = linear();
        let task1 = completed_task(&wf, "task1", State::Success);

        let selections = DirectController
            .next_tasks(&wf, &[task1])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("task2")]);
    }

    #[test]
    fn test_on_success_does_not_fire_for_error() {
        let wf = linear();
        let task1 = completed_task(&wf, "task1", State::Error);

        let selections = DirectController
            .next_tasks(&wf, &[task1])
            .expect("should compute");
        assert!(selections.is_empty());
    }

    #[test]
    fn test_on_error_route() {
        let mut task1 = TaskSpec::action("task1", "std.fail");
        task1.on_error.push("recover".into());
        let recover = TaskSpec::action("recover", "std.echo");
        let wf = workflow(vec![task1, recover]);

        let task1 = completed_task(&wf, "task1", State::Error);
        let selections = DirectController
            .next_tasks(&wf, &[task1])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("recover")]);
    }

    #[test]
    fn test_completed_tasks_not_reemitted() {
        let wf = linear();
        let task1 = completed_task(&wf, "task1", State::Success);
        let task2 = completed_task(&wf, "task2", State::Success);

        let selections = DirectController
            .next_tasks(&wf, &[task1, task2])
            .expect("should compute");
        assert!(selections.is_empty());
    }

    fn join_workflow(join: JoinSpec) -> WorkflowExecution {
        let mut a = TaskSpec::action("a", "std.echo");
        a.on_success.push("join_task".into());
        let mut b = TaskSpec::action("b", "std.echo");
        b.on_success.push("join_task".into());
        let mut join_task = TaskSpec::action("join_task", "std.echo");
        join_task.join = Some(join);
        workflow(vec![a, b, join_task])
    }

    #[test]
    fn test_join_all_waits_for_every_predecessor() {
        let wf = join_workflow(JoinSpec::Mode(JoinMode::All));
        let a = completed_task(&wf, "a", State::Success);

        let selections = DirectController
            .next_tasks(&wf, &[a.clone()])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::waiting("join_task")]);

        let b = completed_task(&wf, "b", State::Success);
        let selections = DirectController
            .next_tasks(&wf, &[a, b])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("join_task")]);
    }

    #[test]
    fn test_join_one_fires_on_first_predecessor() {
        let wf = join_workflow(JoinSpec::Mode(JoinMode::One));
        let a = completed_task(&wf, "a", State::Success);

        let selections = DirectController
            .next_tasks(&wf, &[a])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("join_task")]);
    }

    #[test]
    fn test_waiting_join_task_upgrades_to_ready() {
        let wf = join_workflow(JoinSpec::Mode(JoinMode::All));
        let a = completed_task(&wf, "a", State::Success);
        let b = completed_task(&wf, "b", State::Success);

        let mut waiting = completed_task(&wf, "join_task", State::Success);
        waiting.state = State::Waiting;
        waiting.processed = false;

        let selections = DirectController
            .next_tasks(&wf, &[a, b, waiting])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("join_task")]);
    }

    #[test]
    fn test_at_most_one_selection_per_target() {
        // Two routes firing into the same plain target still emit once.
        let mut a = TaskSpec::action("a", "std.echo");
        a.on_success.push("sink".into());
        let mut b = TaskSpec::action("b", "std.echo");
        b.on_success.push("sink".into());
        let sink = TaskSpec::action("sink", "std.echo");
        let wf = workflow(vec![a, b, sink]);

        let a = completed_task(&wf, "a", State::Success);
        let b = completed_task(&wf, "b", State::Success);

        let selections = DirectController
            .next_tasks(&wf, &[a, b])
            .expect("should compute");
        assert_eq!(selections, vec![TaskSelection::ready("sink")]);
    }
}
