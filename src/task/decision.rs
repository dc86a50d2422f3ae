//! 叶子任务的决策循环
//!
//! 每一轮先问模型下一步（调用工具 / 申请工具 / 询问用户 / 完成），调用工具后再问一次
//! 「结果之后怎么走」。工具结果和用户回答都写入时间线，下一轮提示从时间线渲染上下文。
//! 参数校验失败和审阅否决只记录不中断；工具不存在、重试耗尽和取消作为错误向上返回。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::action::{extract_action, extract_any_action, Action};
use crate::checkpoint::CheckpointKind;
use crate::config::CoordinatorSection;
use crate::core::{OrchestratorError, Result, SequenceGenerator};
use crate::endpoint::{Params, ReviewGate, Suspension};
use crate::events::{Emitter, EventKind};
use crate::llm::AiInvoker;
use crate::memory::{InteractionStage, Timeline};
use crate::task::prompts::{
    render, TASK_STEP_PROMPT, TASK_SUMMARY_PROMPT, TOOL_DECISION_PROMPT, TOOL_PARAMS_PROMPT,
};
use crate::task::TaskOutcome;
use crate::tools::{
    call_tool_schema_json, Tool, ToolCallOutcome, ToolCallStatus, ToolCaller, ToolRegistry,
    ToolResult,
};

pub const STEP_ACTIONS: &[&str] = &["call-tool", "require-tool", "require-user-interact", "finished"];
pub const CALL_TOOL_ACTIONS: &[&str] = &["call-tool"];
pub const SUMMARY_ACTIONS: &[&str] = &["summary"];

/// 决策循环依赖的协调器级服务
pub struct TaskServices {
    pub ai: Arc<AiInvoker>,
    pub tools: Arc<ToolRegistry>,
    pub caller: Arc<ToolCaller>,
    pub gate: Arc<ReviewGate>,
    pub timeline: Arc<Timeline>,
    pub ids: Arc<SequenceGenerator>,
    pub emitter: Emitter,
    pub config: CoordinatorSection,
}

/// 本次运行的任务描述（由协调器从任务树渲染）
#[derive(Debug, Clone, Default)]
pub struct TaskBrief {
    pub index: String,
    pub name: String,
    pub goal: String,
    pub user_goal: String,
    pub progress: String,
    /// 审阅方要求重跑时附带的说明
    pub extra_prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    pub short_summary: String,
    pub long_summary: String,
    pub tool_results: Vec<i64>,
    pub iterations: usize,
}

enum Step {
    Continue,
    Done(TaskOutcome, Option<String>),
}

fn summary_of(action: &Action) -> Option<String> {
    let s = action.get_first_string(&["summary", "short_summary"]);
    (!s.is_empty()).then_some(s)
}

fn reason_of(action: &Action) -> String {
    action.get_first_string(&["reason", "summary"])
}

impl TaskServices {
    /// 运行一个叶子任务直到模型给出结论或达到轮数上限
    pub async fn run_task(&self, brief: &TaskBrief) -> Result<TaskReport> {
        let emitter = self.emitter.with_task_index(&brief.index);
        let max = self.config.max_task_iterations.max(1);
        let mut tool_results = Vec::new();
        let mut decided = None;
        let mut iterations = 0;

        while iterations < max {
            iterations += 1;
            let action = self.next_step(brief).await?;
            tracing::debug!(task = %brief.index, iteration = iterations, action = %action.name(), "task step");

            let step = if action.is(&["finished"]) {
                Step::Done(TaskOutcome::Finished, summary_of(&action))
            } else if action.is(&["require-user-interact"]) {
                self.interact(brief, &emitter, &action).await?;
                Step::Continue
            } else {
                let name = action.get_string("tool");
                let tool = self.lookup(&name, &emitter)?;
                let params = if action.is(&["require-tool"]) {
                    self.tool_params(brief, tool.as_ref()).await?
                } else {
                    Value::Object(action.get_object("params"))
                };
                self.call_tool(brief, &emitter, tool, params, &mut tool_results)
                    .await?
            };
            if let Step::Done(outcome, summary) = step {
                decided = Some((outcome, summary));
                break;
            }
        }

        let (outcome, summary) = decided.unwrap_or_else(|| {
            tracing::warn!(task = %brief.index, max, "task reached the iteration limit");
            emitter.warn(format!("task {} reached {max} iterations without a decision", brief.index));
            (
                TaskOutcome::Failed(format!("no decision after {max} iterations")),
                None,
            )
        });
        emitter.info(format!("task {} {}", brief.index, outcome_label(&outcome)));

        let (short_summary, long_summary) = match summary {
            Some(s) => (s.clone(), s),
            None if self.config.task_summary => self.summarize(brief, &outcome).await?,
            None => (outcome_label(&outcome), String::new()),
        };
        self.timeline
            .push_text(
                "task-summary",
                &format!("[{}] {}: {}", brief.index, brief.name, short_summary),
            )
            .await;

        Ok(TaskReport {
            outcome,
            short_summary,
            long_summary,
            tool_results,
            iterations,
        })
    }

    fn lookup(&self, name: &str, emitter: &Emitter) -> Result<Arc<dyn Tool>> {
        self.tools.get(name).ok_or_else(|| {
            let err = OrchestratorError::ToolNotFound(name.to_string());
            emitter.error(&err);
            err
        })
    }

    fn task_vars<'a>(&self, brief: &'a TaskBrief) -> Vec<(&'static str, &'a str)> {
        vec![
            ("index", brief.index.as_str()),
            ("name", brief.name.as_str()),
            ("task_goal", brief.goal.as_str()),
        ]
    }

    async fn next_step(&self, brief: &TaskBrief) -> Result<Action> {
        let tools = self.tools.to_schema_json();
        let call_tool_schema = call_tool_schema_json();
        let timeline = self.timeline.dump();
        let extra = if brief.extra_prompt.is_empty() {
            String::new()
        } else {
            format!("\nReviewer notes for this attempt:\n{}\n", brief.extra_prompt)
        };
        let mut vars = self.task_vars(brief);
        vars.extend([
            ("goal", brief.user_goal.as_str()),
            ("progress", brief.progress.as_str()),
            ("extra", extra.as_str()),
            ("tools", tools.as_str()),
            ("call_tool_schema", call_tool_schema.as_str()),
            ("timeline", timeline.as_str()),
        ]);
        let prompt = render(TASK_STEP_PROMPT, &vars);
        self.ai
            .transaction("task-step", &prompt, Some(&brief.index), |text| {
                extract_action(text, STEP_ACTIONS)
            })
            .await
    }

    /// require-tool 之后单独要参数
    async fn tool_params(&self, brief: &TaskBrief, tool: &dyn Tool) -> Result<Value> {
        let schema = serde_json::to_string_pretty(&tool.parameters_schema())
            .unwrap_or_else(|_| "{}".to_string());
        let timeline = self.timeline.dump();
        let mut vars = self.task_vars(brief);
        vars.extend([
            ("tool", tool.name()),
            ("description", tool.description()),
            ("schema", schema.as_str()),
            ("timeline", timeline.as_str()),
        ]);
        let prompt = render(TOOL_PARAMS_PROMPT, &vars);
        let action = self
            .ai
            .transaction("tool-params", &prompt, Some(&brief.index), |text| {
                extract_action(text, CALL_TOOL_ACTIONS)
            })
            .await?;
        Ok(Value::Object(action.get_object("params")))
    }

    async fn call_tool(
        &self,
        brief: &TaskBrief,
        emitter: &Emitter,
        tool: Arc<dyn Tool>,
        params: Value,
        tool_results: &mut Vec<i64>,
    ) -> Result<Step> {
        let name = tool.name().to_string();
        match self.caller.call(tool, params.clone(), Some(&brief.index)).await {
            Err(err @ OrchestratorError::InvalidToolParams { .. }) => {
                let failed = ToolResult::failed(self.ids.next(), &name, params, err.to_string());
                tool_results.push(failed.id);
                self.timeline.push_tool_result(failed).await;
                Ok(Step::Continue)
            }
            Err(err) => Err(err),
            Ok(ToolCallOutcome::WrongTool {
                tool,
                params,
                suggested_tool,
                extra_prompt,
            }) => {
                let mut answer = match suggested_tool {
                    Some(t) => format!("use tool `{t}` instead"),
                    None => "choose a different tool".to_string(),
                };
                if !extra_prompt.is_empty() {
                    answer.push_str(&format!(": {extra_prompt}"));
                }
                self.timeline
                    .push_user_interaction(
                        InteractionStage::Review,
                        &format!("reviewer rejected tool `{tool}` with params {params}"),
                        &answer,
                    )
                    .await;
                Ok(Step::Continue)
            }
            Ok(ToolCallOutcome::Completed(result)) => {
                tool_results.push(result.id);
                let cancelled = result.status == ToolCallStatus::Cancelled;
                let rendered = result.render();
                self.timeline.push_tool_result(result).await;
                if cancelled {
                    let err = OrchestratorError::Cancelled;
                    emitter.error(&err);
                    return Err(err);
                }
                self.decide(brief, &rendered).await
            }
        }
    }

    async fn decide(&self, brief: &TaskBrief, rendered: &str) -> Result<Step> {
        let mut vars = self.task_vars(brief);
        vars.push(("result", rendered));
        let prompt = render(TOOL_DECISION_PROMPT, &vars);
        let action = self
            .ai
            .transaction("tool-decision", &prompt, Some(&brief.index), extract_any_action)
            .await?;

        let step = if action.is(&["continue-current-task"]) {
            Step::Continue
        } else if action.is(&["finished"]) {
            Step::Done(TaskOutcome::Finished, summary_of(&action))
        } else if action.is(&["task-skipped"]) {
            Step::Done(TaskOutcome::Skipped, Some(reason_of(&action)).filter(|s| !s.is_empty()))
        } else if action.is(&["task-failed"]) {
            Step::Done(TaskOutcome::Failed(reason_of(&action)), None)
        } else {
            tracing::warn!(task = %brief.index, action = %action.name(), "unknown decision, continuing");
            self.emitter
                .with_task_index(&brief.index)
                .warn(format!("unknown decision '{}', continuing current task", action.name()));
            Step::Continue
        };
        Ok(step)
    }

    /// require-user-interact：挂起等用户回答，回答记为 free-input 交互
    async fn interact(&self, brief: &TaskBrief, emitter: &Emitter, action: &Action) -> Result<()> {
        let prompt = action.get_string("prompt");
        let options = action.get_string_array("options");
        let mut defaults = Params::new();
        defaults.insert("suggestion".into(), json!("continue"));
        let outcome = self
            .gate
            .suspend(
                emitter,
                Suspension {
                    kind: CheckpointKind::Interaction,
                    event: EventKind::RequireUserInteractive,
                    request: json!({ "prompt": prompt, "options": options }),
                    materials: json!({
                        "task_index": brief.index,
                        "prompt": prompt,
                        "options": options,
                    }),
                    defaults,
                },
            )
            .await?;

        let answer = ["answer", "extra_prompt", "selected"]
            .iter()
            .filter_map(|k| outcome.params.get(*k).and_then(|v| v.as_str()))
            .find(|s| !s.is_empty())
            .unwrap_or("(no answer, continue with best judgement)")
            .to_string();
        self.timeline
            .push_user_interaction(InteractionStage::FreeInput, &prompt, &answer)
            .await;
        Ok(())
    }

    async fn summarize(&self, brief: &TaskBrief, outcome: &TaskOutcome) -> Result<(String, String)> {
        let timeline = self.timeline.dump();
        let label = outcome_label(outcome);
        let mut vars = self.task_vars(brief);
        vars.extend([("outcome", label.as_str()), ("timeline", timeline.as_str())]);
        let prompt = render(TASK_SUMMARY_PROMPT, &vars);
        let action = self
            .ai
            .transaction("task-summary", &prompt, Some(&brief.index), |text| {
                extract_action(text, SUMMARY_ACTIONS)
            })
            .await?;
        let short = action.get_string_or("short_summary", &label);
        let long = action.get_string("long_summary");
        Ok((short, long))
    }
}

pub fn outcome_label(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Finished => "finished".to_string(),
        TaskOutcome::Skipped => "skipped".to_string(),
        TaskOutcome::Failed(reason) if reason.is_empty() => "failed".to_string(),
        TaskOutcome::Failed(reason) => format!("failed: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::config::TimelineSection;
    use crate::endpoint::{AgreeConfig, AgreePolicy, AgreeResolver, EndpointManager};
    use crate::events::CollectingSink;
    use crate::llm::{AiRequest, MockAi, RetryPolicy};
    use crate::memory::TimelineEntry;
    use crate::tools::{EchoTool, OutputLimiter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        services: TaskServices,
        ai: Arc<MockAi>,
        sink: CollectingSink,
        _spill: tempfile::TempDir,
    }

    fn fixture(ai: MockAi) -> Fixture {
        let cancel = CancellationToken::new();
        let sink = CollectingSink::new();
        let emitter = Emitter::new("c1", Arc::new(sink.clone()));
        let ids = Arc::new(SequenceGenerator::new());
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let ai = Arc::new(ai);
        let invoker = Arc::new(AiInvoker::new(
            ai.clone(),
            store.clone(),
            ids.clone(),
            emitter.clone(),
            RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
            cancel.clone(),
        ));
        let agree = Arc::new(AgreeResolver::new(
            AgreeConfig {
                policy: AgreePolicy::Yolo,
                ..AgreeConfig::default()
            },
            None,
            store.clone(),
            "c1",
        ));
        let gate = Arc::new(ReviewGate::new(
            EndpointManager::new(ids.clone(), cancel.clone()),
            agree,
            store.clone(),
            ids.clone(),
            cancel.clone(),
        ));
        let spill = tempfile::tempdir().unwrap();
        let caller = Arc::new(ToolCaller::new(
            emitter.clone(),
            gate.clone(),
            store.clone(),
            ids.clone(),
            OutputLimiter::new(4096, spill.path().to_path_buf()),
            Duration::from_secs(5),
            cancel,
        ));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(EchoTool);
        let timeline = Arc::new(
            Timeline::new(&TimelineSection::default(), ids.clone()).with_ai(invoker.clone()),
        );
        Fixture {
            services: TaskServices {
                ai: invoker,
                tools,
                caller,
                gate,
                timeline,
                ids,
                emitter,
                config: CoordinatorSection {
                    max_task_iterations: 3,
                    ..CoordinatorSection::default()
                },
            },
            ai,
            sink,
            _spill: spill,
        }
    }

    fn brief() -> TaskBrief {
        TaskBrief {
            index: "1-1".into(),
            name: "greet".into(),
            goal: "say hi".into(),
            user_goal: "demo".into(),
            ..TaskBrief::default()
        }
    }

    /// 按 kind 路由；task-step 依次返回 `steps` 中的响应
    fn routed(steps: Vec<&'static str>, decision: &'static str) -> MockAi {
        let n = AtomicUsize::new(0);
        MockAi::new(move |req: &AiRequest| match req.kind.as_str() {
            "task-step" => {
                let i = n.fetch_add(1, Ordering::SeqCst).min(steps.len() - 1);
                Ok(steps[i].to_string())
            }
            "tool-params" => {
                Ok(r#"{"@action": "call-tool", "tool": "echo", "params": {"text": "from params"}}"#.into())
            }
            "tool-decision" => Ok(decision.to_string()),
            "task-summary" => Ok(
                r#"{"@action": "summary", "short_summary": "s", "long_summary": "l"}"#.into(),
            ),
            other => Err(format!("unexpected {other}")),
        })
    }

    const ECHO: &str = r#"{"@action": "call-tool", "tool": "echo", "params": {"text": "hi"}}"#;
    const FINISHED: &str = r#"{"@action": "finished", "summary": "said hi"}"#;

    #[tokio::test]
    async fn test_call_tool_then_finish() {
        let fx = fixture(routed(vec![ECHO], FINISHED));
        let report = fx.services.run_task(&brief()).await.unwrap();

        assert_eq!(report.outcome, TaskOutcome::Finished);
        assert_eq!(report.short_summary, "said hi");
        assert_eq!(report.tool_results.len(), 1);
        assert_eq!(report.iterations, 1);
        // 决策已带摘要，不再单独要摘要
        assert_eq!(fx.ai.calls_of("task-summary"), 0);
        let result = fx.services.timeline.tool_result(report.tool_results[0]).unwrap();
        assert_eq!(result.data.stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_invalid_params_recorded_and_loop_continues() {
        let bad = r#"{"@action": "call-tool", "tool": "echo", "params": {}}"#;
        let fx = fixture(routed(vec![bad, ECHO], FINISHED));
        let report = fx.services.run_task(&brief()).await.unwrap();

        assert_eq!(report.tool_results.len(), 2);
        let failed = fx.services.timeline.tool_result(report.tool_results[0]).unwrap();
        assert!(!failed.success);
        assert!(failed.error.contains("text"));
        assert_eq!(fx.sink.of_kind(EventKind::ToolCallStart).len(), 1);
        assert_eq!(report.outcome, TaskOutcome::Finished);
    }

    #[tokio::test]
    async fn test_require_tool_asks_for_params() {
        let fx = fixture(routed(
            vec![r#"{"@action": "require-tool", "tool": "echo"}"#],
            FINISHED,
        ));
        let report = fx.services.run_task(&brief()).await.unwrap();
        assert_eq!(fx.ai.calls_of("tool-params"), 1);
        let result = fx.services.timeline.tool_result(report.tool_results[0]).unwrap();
        assert_eq!(result.params["text"], "from params");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fatal() {
        let fx = fixture(routed(
            vec![r#"{"@action": "call-tool", "tool": "rm_rf", "params": {}}"#],
            FINISHED,
        ));
        let err = fx.services.run_task(&brief()).await.unwrap_err();
        assert_eq!(err, OrchestratorError::ToolNotFound("rm_rf".into()));
        assert!(!err.is_retryable());
        assert_eq!(fx.sink.of_kind(EventKind::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_decision_continues_until_limit() {
        let fx = fixture(routed(vec![ECHO], r#"{"@action": "dance"}"#));
        let report = fx.services.run_task(&brief()).await.unwrap();

        assert_eq!(report.iterations, 3);
        assert!(matches!(report.outcome, TaskOutcome::Failed(_)));
        assert!(fx.sink.of_kind(EventKind::Warning).len() >= 3);
        // 没有现成摘要，走 task-summary
        assert_eq!(fx.ai.calls_of("task-summary"), 1);
        assert_eq!(report.short_summary, "s");
    }

    #[tokio::test]
    async fn test_task_failed_is_an_outcome() {
        let fx = fixture(routed(
            vec![ECHO],
            r#"{"@action": "task-failed", "reason": "file missing"}"#,
        ));
        let report = fx.services.run_task(&brief()).await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Failed("file missing".into()));
        assert_eq!(report.long_summary, "l");
    }

    #[tokio::test]
    async fn test_user_interaction_recorded_as_free_input() {
        let ask = r#"{"@action": "require-user-interact", "prompt": "which file?", "options": ["a", "b"]}"#;
        let fx = fixture(routed(vec![ask, FINISHED], FINISHED));
        let report = fx.services.run_task(&brief()).await.unwrap();

        assert_eq!(report.outcome, TaskOutcome::Finished);
        assert_eq!(fx.sink.of_kind(EventKind::RequireUserInteractive).len(), 1);
        let asked = fx
            .services
            .timeline
            .outputs()
            .into_iter()
            .find_map(|item| match item.entry {
                TimelineEntry::UserInteraction(u) => Some(u),
                _ => None,
            })
            .unwrap();
        assert_eq!(asked.stage, InteractionStage::FreeInput);
        assert_eq!(asked.system_prompt, "which file?");
    }
}
