//! 协调器运行时
//!
//! 生成计划 → 构建任务树 → 先序深度优先遍历。有子任务的节点依次执行子任务，
//! 任一子任务出错即中止整棵子树并把错误交给调用方；叶子任务跑决策循环，
//! 之后经过任务审阅门（continue / inaccurate / end / adjust_plan）。
//! 任务树只在遍历所在的这一条执行流中修改。

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
use crate::config::AppConfig;
use crate::core::{OrchestratorError, Result};
use crate::endpoint::{EndpointManager, Params, Suspension};
use crate::events::{AsyncGuardian, Emitter, EventKind};
use crate::memory::{InteractionStage, Timeline};
use crate::task::prompts::{render, PLAN_PROMPT, REPLAN_PROMPT};
use crate::task::{
    outcome_label, parse_replan, PlanSpec, SubtaskSpec, TaskBrief, TaskId, TaskReviewSuggestion,
    TaskServices, TaskStatus, TaskTree,
};

/// 供外部（UI / 审阅方）释放挂起点和取消运行的句柄
#[derive(Clone)]
pub struct CoordinatorHandle {
    endpoints: Arc<EndpointManager>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    /// 按端点 id 释放；未知 id 返回 false
    pub fn feed(&self, id: &str, params: Params) -> bool {
        self.endpoints.feed(id, params)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct Coordinator {
    id: String,
    config: AppConfig,
    services: TaskServices,
    checkpoints: Arc<dyn CheckpointStore>,
    endpoints: Arc<EndpointManager>,
    guardian: Arc<AsyncGuardian>,
    guardian_cancel: CancellationToken,
    cancel: CancellationToken,
    tree: Option<TaskTree>,
    user_goal: String,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        config: AppConfig,
        services: TaskServices,
        checkpoints: Arc<dyn CheckpointStore>,
        endpoints: Arc<EndpointManager>,
        guardian: Arc<AsyncGuardian>,
        guardian_cancel: CancellationToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            config,
            services,
            checkpoints,
            endpoints,
            guardian,
            guardian_cancel,
            cancel,
            tree: None,
            user_goal: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn emitter(&self) -> &Emitter {
        &self.services.emitter
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.services.timeline
    }

    /// 计划生成之前为 None
    pub fn tree(&self) -> Option<&TaskTree> {
        self.tree.as_ref()
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            endpoints: self.endpoints.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 等待 Guardian 处理完此前发出的事件
    pub async fn settle(&self) {
        self.guardian.settle().await;
    }

    /// 本协调器 seq 最大的未完成检查点
    pub async fn recovery_point(&self) -> Result<Option<Checkpoint>> {
        self.checkpoints.latest_unfinished(&self.id).await
    }

    /// 执行用户目标直到整棵任务树走完
    pub async fn run(&mut self, goal: &str) -> Result<()> {
        self.user_goal = goal.to_string();
        tracing::info!(coordinator = %self.id, "coordinator run started");
        self.services
            .timeline
            .push_user_interaction(InteractionStage::BeforePlan, "user goal", goal)
            .await;

        let result = self.plan_and_walk(goal).await;
        let tree = self.tree.as_ref().map(TaskTree::to_json);
        match &result {
            Ok(()) => {
                tracing::info!(coordinator = %self.id, "coordinator run finished");
                self.emitter()
                    .emit(EventKind::Done, json!({ "status": "finished", "tree": tree }));
            }
            Err(err) => {
                tracing::warn!(coordinator = %self.id, error = %err, "coordinator run aborted");
                let status = match err {
                    OrchestratorError::Cancelled => "cancelled",
                    _ => "failed",
                };
                self.emitter().emit(
                    EventKind::Done,
                    json!({ "status": status, "error": err.to_string(), "tree": tree }),
                );
            }
        }
        result
    }

    async fn plan_and_walk(&mut self, goal: &str) -> Result<()> {
        let tools = self.services.tools.to_schema_json();
        let timeline = self.services.timeline.dump();
        let prompt = render(
            PLAN_PROMPT,
            &[
                ("goal", goal),
                ("tools", tools.as_str()),
                ("timeline", timeline.as_str()),
            ],
        );
        let plan = self
            .services
            .ai
            .transaction("plan", &prompt, None, PlanSpec::parse)
            .await?;

        let tree = TaskTree::from_plan(&plan);
        let root = tree.root();
        self.emitter().emit(
            EventKind::PlanCreated,
            json!({ "main_task": plan.main_task, "tree": tree.to_json() }),
        );
        self.tree = Some(tree);
        self.execute_task(root).await
    }

    fn tree_mut(&mut self) -> Result<&mut TaskTree> {
        self.tree
            .as_mut()
            .ok_or_else(|| OrchestratorError::PlanError("no task tree".to_string()))
    }

    fn tree_ref(&self) -> Result<&TaskTree> {
        self.tree
            .as_ref()
            .ok_or_else(|| OrchestratorError::PlanError("no task tree".to_string()))
    }

    fn set_status(&mut self, id: TaskId, status: TaskStatus) -> Result<()> {
        let node = self
            .tree_mut()?
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::PlanError(format!("unknown task {id}")))?;
        node.status = status;
        let content = json!({
            "index": node.index,
            "name": node.name,
            "status": node.status,
            "outcome": node.outcome,
        });
        let index = node.index.clone();
        self.emitter()
            .with_task_index(&index)
            .emit(EventKind::TaskStatus, content);
        Ok(())
    }

    fn execute_task(&mut self, id: TaskId) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.tree_ref()?.children(id).is_empty() {
                self.execute_leaf(id).await
            } else {
                self.set_status(id, TaskStatus::Executing)?;
                self.execute_sub_task(id).await?;
                self.set_status(id, TaskStatus::Executed)
            }
        }
        .boxed()
    }

    /// 依次执行子任务；子列表每步重新读取，遍历中的截断和追加都生效
    async fn execute_sub_task(&mut self, parent: TaskId) -> Result<()> {
        let mut i = 0;
        while let Some(child) = self.tree_ref()?.child_at(parent, i) {
            self.execute_task(child).await?;
            i += 1;
        }
        Ok(())
    }

    fn brief(&self, id: TaskId, extra_prompt: &str) -> Result<TaskBrief> {
        let tree = self.tree_ref()?;
        let node = tree
            .get(id)
            .ok_or_else(|| OrchestratorError::PlanError(format!("unknown task {id}")))?;
        Ok(TaskBrief {
            index: node.index.clone(),
            name: node.name.clone(),
            goal: node.goal.clone(),
            user_goal: self.user_goal.clone(),
            progress: tree.render_progress(Some(id)),
            extra_prompt: extra_prompt.to_string(),
        })
    }

    async fn execute_leaf(&mut self, id: TaskId) -> Result<()> {
        let mut extra_prompt = String::new();
        let mut reruns = 0;
        loop {
            self.set_status(id, TaskStatus::Executing)?;
            let brief = self.brief(id, &extra_prompt)?;
            let report = self.services.run_task(&brief).await?;
            if let Some(node) = self.tree_mut()?.get_mut(id) {
                node.outcome = Some(report.outcome.clone());
                node.short_summary = report.short_summary.clone();
                node.long_summary = report.long_summary.clone();
                node.tool_results.extend(report.tool_results.iter().copied());
            }
            self.set_status(id, TaskStatus::Executed)?;

            let suggestion = self.review_task(id, &brief).await?;
            let emitter = self.emitter().with_task_index(&brief.index);
            match suggestion {
                TaskReviewSuggestion::Continue => return Ok(()),
                TaskReviewSuggestion::Unknown(other) => {
                    tracing::warn!(task = %brief.index, suggestion = %other, "unknown task review suggestion");
                    emitter.warn(format!("unknown task review suggestion '{other}', continuing"));
                    return Ok(());
                }
                TaskReviewSuggestion::Inaccurate { extra_prompt: extra } => {
                    if reruns >= self.config.coordinator.max_task_rerun {
                        emitter.warn(format!(
                            "task {} reached the rerun limit ({reruns}), moving on",
                            brief.index
                        ));
                        return Ok(());
                    }
                    reruns += 1;
                    self.set_status(id, TaskStatus::NeedsRerun)?;
                    extra_prompt = extra;
                }
                TaskReviewSuggestion::End => {
                    let dropped = self.tree_mut()?.truncate_after(id);
                    tracing::info!(task = %brief.index, dropped, "remaining sibling tasks truncated");
                    emitter.info(format!("stopped after task {}, {dropped} sibling task(s) dropped", brief.index));
                    return Ok(());
                }
                TaskReviewSuggestion::AdjustPlan { extra_prompt: extra } => {
                    let subtasks = self.replan(&brief, &extra).await?;
                    let tree = self.tree_mut()?;
                    tree.insert_children(id, &subtasks);
                    let snapshot = tree.to_json();
                    emitter.emit(
                        EventKind::PlanCreated,
                        json!({ "replanned": brief.index, "tree": snapshot }),
                    );
                    self.set_status(id, TaskStatus::Executing)?;
                    self.execute_sub_task(id).await?;
                    return self.set_status(id, TaskStatus::Executed);
                }
            }
        }
    }

    /// 任务审阅门
    async fn review_task(&self, id: TaskId, brief: &TaskBrief) -> Result<TaskReviewSuggestion> {
        let node = self
            .tree_ref()?
            .get(id)
            .ok_or_else(|| OrchestratorError::PlanError(format!("unknown task {id}")))?
            .clone();
        let tool_results: Vec<_> = node
            .tool_results
            .iter()
            .filter_map(|r| self.services.timeline.tool_result(*r))
            .map(|r| json!({ "id": r.id, "tool": r.name, "status": r.status, "params": r.params }))
            .collect();

        let mut defaults = Params::new();
        defaults.insert("suggestion".into(), json!("continue"));
        let emitter = self.emitter().with_task_index(&brief.index);
        let outcome = self
            .services
            .gate
            .suspend(
                &emitter,
                Suspension {
                    kind: CheckpointKind::Review,
                    event: EventKind::TaskReviewRequire,
                    request: json!({ "task_index": node.index, "outcome": node.outcome }),
                    materials: json!({
                        "selectors": TaskReviewSuggestion::selectors(),
                        "task": {
                            "index": node.index,
                            "name": node.name,
                            "goal": node.goal,
                            "outcome": node.outcome.as_ref().map(outcome_label),
                        },
                        "short_summary": node.short_summary,
                        "long_summary": node.long_summary,
                        "tool_results": tool_results,
                    }),
                    defaults,
                },
            )
            .await?;

        let suggestion = TaskReviewSuggestion::from_params(&outcome.params);
        if suggestion != TaskReviewSuggestion::Continue {
            let answer = serde_json::Value::Object(outcome.params).to_string();
            self.services
                .timeline
                .push_user_interaction(
                    InteractionStage::Review,
                    &format!("review of task [{}] {}", node.index, node.name),
                    &answer,
                )
                .await;
        }
        Ok(suggestion)
    }

    async fn replan(&self, brief: &TaskBrief, extra: &str) -> Result<Vec<SubtaskSpec>> {
        let prompt = render(
            REPLAN_PROMPT,
            &[
                ("index", brief.index.as_str()),
                ("name", brief.name.as_str()),
                ("task_goal", brief.goal.as_str()),
                ("extra", extra),
                ("progress", brief.progress.as_str()),
            ],
        );
        self.services
            .ai
            .transaction("re-plan", &prompt, Some(&brief.index), parse_replan)
            .await
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.guardian_cancel.cancel();
    }
}
