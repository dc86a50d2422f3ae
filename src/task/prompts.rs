//! 决策循环与协调器使用的提示模板
//!
//! 占位符形如 `{goal}`，由 [`render`] 逐个替换；模板末尾都约定了期望的 `@action`。

pub const PLAN_PROMPT: &str = r#"# Task Planning
You are the planner of an autonomous agent. Break the user goal below into an ordered list of
sub-tasks that can each be completed with the available tools.

<user-goal>
{goal}
</user-goal>

<tools>
{tools}
</tools>

<timeline>
{timeline}
</timeline>

Respond with:
{"@action": "plan", "main_task": "<short name>", "main_task_goal": "<goal>",
 "tasks": [{"subtask_name": "<name>", "subtask_goal": "<goal>"}]}
"#;

pub const REPLAN_PROMPT: &str = r#"# Adjust Plan
The reviewer asked to adjust the plan at task [{index}] {name}: {task_goal}

Reviewer notes:
{extra}

Current progress:
{progress}

List the additional sub-tasks to run under this task.
Respond with:
{"@action": "plan", "tasks": [{"subtask_name": "<name>", "subtask_goal": "<goal>"}]}
"#;

pub const TASK_STEP_PROMPT: &str = r#"# Current Task
Overall goal: {goal}

Progress:
{progress}

You are working on task [{index}] {name}: {task_goal}
{extra}
<tools>
{tools}
</tools>

A call-tool action must match this schema:
{call_tool_schema}

<timeline>
{timeline}
</timeline>

Decide the next step. Respond with exactly one of:
{"@action": "call-tool", "tool": "<tool name>", "params": {...}}
{"@action": "require-tool", "tool": "<tool name>"}
{"@action": "require-user-interact", "prompt": "<question>", "options": ["<option>"]}
{"@action": "finished", "summary": "<what was achieved>"}
"#;

pub const TOOL_PARAMS_PROMPT: &str = r#"# Tool Parameters
Task [{index}] {name}: {task_goal}

Generate the parameters for tool `{tool}`: {description}
Parameter schema:
{schema}

<timeline>
{timeline}
</timeline>

Respond with:
{"@action": "call-tool", "tool": "{tool}", "params": {...}}
"#;

pub const TOOL_DECISION_PROMPT: &str = r#"# Tool Result Review
Task [{index}] {name}: {task_goal}

The last tool call returned:
{result}

Decide how the task continues. Respond with exactly one of:
{"@action": "continue-current-task"}
{"@action": "finished", "summary": "<what was achieved>"}
{"@action": "task-skipped", "reason": "<why>"}
{"@action": "task-failed", "reason": "<why>"}
"#;

pub const TASK_SUMMARY_PROMPT: &str = r#"# Task Summary
Task [{index}] {name}: {task_goal}
Outcome: {outcome}

<timeline>
{timeline}
</timeline>

Summarize what this task did. Respond with:
{"@action": "summary", "short_summary": "<one line>", "long_summary": "<details>"}
"#;

/// 依次替换 `{key}` 占位符
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}
