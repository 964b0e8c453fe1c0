//! Reverse workflow controller.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::EngineError;
use crate::persistence::{TaskExecution, WorkflowExecution};
use crate::state::State;

use super::{TaskSelection, WorkflowController};

/// Routes a DAG backward from declared target tasks along `requires`
/// edges: a task becomes runnable once all of its prerequisites succeeded,
/// and only tasks inside the dependency closure of the targets run at all.
///
/// The target comes from the execution's `task_name` start parameter; with
/// none given, every task nothing else depends on is a target.
pub struct ReverseController;

impl WorkflowController for ReverseController {
    fn next_tasks(
        &self,
        wf_ex: &WorkflowExecution,
        task_execs: &[TaskExecution],
    ) -> Result<Vec<TaskSelection>, EngineError> {
        let by_name: HashMap<&str, &TaskExecution> = task_execs
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        let targets = self.targets(wf_ex)?;
        let needed = self.dependency_closure(wf_ex, &targets)?;

        let mut selections = Vec::new();

        for (name, spec) in &wf_ex.spec.tasks {
            if !needed.contains(name.as_str()) || by_name.contains_key(name.as_str()) {
                continue;
            }

            let satisfied = spec.requires.iter().all(|dep| {
                by_name
                    .get(dep.as_str())
                    .map(|t| t.state == State::Success && t.processed)
                    .unwrap_or(false)
            });

            if satisfied {
                selections.push(TaskSelection::ready(name));
            }
        }

        Ok(selections)
    }
}

impl ReverseController {
    fn targets<'a>(&self, wf_ex: &'a WorkflowExecution) -> Result<Vec<&'a str>, EngineError> {
        if let Some(target) = &wf_ex.params.task_name {
            if wf_ex.spec.task(target).is_none() {
                return Err(EngineError::InvalidModel(format!(
                    "target task '{}' is not defined in workflow '{}'",
                    target, wf_ex.spec.name
                )));
            }
            return Ok(vec![target.as_str()]);
        }

        // No explicit target: every task that nothing depends on.
        let required_by_someone: HashSet<&str> = wf_ex
            .spec
            .tasks
            .values()
            .flat_map(|t| t.requires.iter().map(String::as_str))
            .collect();

        Ok(wf_ex
            .spec
            .tasks
            .keys()
            .map(String::as_str)
            .filter(|name| !required_by_someone.contains(name))
            .collect())
    }

    fn dependency_closure<'a>(
        &self,
        wf_ex: &'a WorkflowExecution,
        targets: &[&'a str],
    ) -> Result<HashSet<&'a str>, EngineError> {
        let mut needed: HashSet<&str> = HashSet::new();
        let mut frontier: VecDeque<&str> = targets.iter().copied().collect();

        while let Some(name) = frontier.pop_front() {
            if !needed.insert(name) {
                continue;
            }

            let spec = wf_ex.spec.task(name).ok_or_else(|| {
                EngineError::InvalidModel(format!(
                    "task '{}' requires undefined task in workflow '{}'",
                    name, wf_ex.spec.name
                ))
            })?;

            for dep in &spec.requires {
                frontier.push_back(dep);
            }
        }

        Ok(needed)
    }
}
