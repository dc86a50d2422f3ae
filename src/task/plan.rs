//! 计划解析：模型返回的 `plan` 动作 → 主任务 + 子任务列表

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{extract_action, Action};
use crate::core::{OrchestratorError, Result};

pub const PLAN_ACTIONS: &[&str] = &["plan"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub name: String,
    pub goal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub main_task: String,
    pub main_task_goal: String,
    pub tasks: Vec<SubtaskSpec>,
}

fn subtask_of(obj: &Map<String, Value>) -> Option<SubtaskSpec> {
    let field = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| obj.get(*k).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string)
    };
    let name = field(&["subtask_name", "name"])?;
    let goal = field(&["subtask_goal", "goal"]).unwrap_or_else(|| name.clone());
    Some(SubtaskSpec { name, goal })
}

fn subtasks_of(action: &Action) -> Result<Vec<SubtaskSpec>> {
    let raw = action.get_object_array("tasks");
    let tasks: Vec<SubtaskSpec> = raw.iter().filter_map(subtask_of).collect();
    if tasks.len() < raw.len() {
        tracing::warn!(
            dropped = raw.len() - tasks.len(),
            "plan contains sub-tasks without a name"
        );
    }
    if tasks.is_empty() {
        return Err(OrchestratorError::PlanError(
            "plan contains no sub-tasks, `tasks` must list at least one {subtask_name, subtask_goal}"
                .to_string(),
        ));
    }
    Ok(tasks)
}

impl PlanSpec {
    pub fn from_action(action: &Action) -> Result<Self> {
        let main_task = action.get_string("main_task").trim().to_string();
        if main_task.is_empty() {
            return Err(OrchestratorError::PlanError(
                "plan is missing `main_task`".to_string(),
            ));
        }
        let main_task_goal = action.get_string_or("main_task_goal", &main_task);
        Ok(Self {
            main_task,
            main_task_goal,
            tasks: subtasks_of(action)?,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::from_action(&extract_action(text, PLAN_ACTIONS)?)
    }
}

/// 重新规划只关心新增的子任务
pub fn parse_replan(text: &str) -> Result<Vec<SubtaskSpec>> {
    subtasks_of(&extract_action(text, PLAN_ACTIONS)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_wrapped_in_prose() {
        let text = r#"Here is my plan:
{"@action":"plan","main_task":"m","main_task_goal":"g","tasks":[{"subtask_name":"a","subtask_goal":"ga"},{"subtask_name":"b","subtask_goal":"gb"}]}
Let me know."#;
        let plan = PlanSpec::parse(text).unwrap();
        assert_eq!(plan.main_task, "m");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1], SubtaskSpec { name: "b".into(), goal: "gb".into() });
    }

    #[test]
    fn test_empty_plan_is_error() {
        let err = PlanSpec::parse(r#"{"@action":"plan","main_task":"m","tasks":[]}"#).unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_replan_ignores_main_task_and_unnamed_entries() {
        let tasks = parse_replan(
            r#"{"@action":"plan","tasks":[{"subtask_goal":"no name"},{"name":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(tasks, vec![SubtaskSpec { name: "x".into(), goal: "x".into() }]);
    }
}
