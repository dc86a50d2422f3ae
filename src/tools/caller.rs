//! 工具调用器
//!
//! 单次调用的状态机：参数提出 →（可选）审阅 → 校验 → 执行 → 成功 / 失败 / 取消。
//! 校验不通过直接返回错误，永远不会进入执行；取消不是错误，而是带部分输出的独立结果。
//! 每次调用输出一条结构化审计日志。
//! 可选的周期审阅方在工具运行期间定时查看 stdout / stderr 快照，否决即停止该次调用。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::core::{OrchestratorError, Result, SequenceGenerator};
use crate::endpoint::{Params, ReviewGate, Suspension};
use crate::events::{Emitter, EventKind};
use crate::task::ToolReviewSuggestion;
use crate::tools::output::capture;
use crate::tools::{
    validate_params, OutputLimiter, Tool, ToolCallStatus, ToolContext, ToolExecutionData,
    ToolOutput, ToolResult,
};

/// 输出转发任务收尾的等待上限
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    /// 已执行（status 区分成功 / 失败 / 取消）
    Completed(ToolResult),
    /// 审阅方否决了工具选择，交回决策循环
    WrongTool {
        tool: String,
        params: Value,
        suggested_tool: Option<String>,
        extra_prompt: String,
    },
}

/// 运行中工具的周期审阅：返回 false 停止该次调用，返回错误只记日志
#[async_trait]
pub trait IntervalReviewer: Send + Sync {
    async fn review(
        &self,
        tool: &str,
        params: &Value,
        stdout: &str,
        stderr: &str,
    ) -> std::result::Result<bool, String>;
}

struct IntervalReview {
    reviewer: Arc<dyn IntervalReviewer>,
    every: Duration,
}

enum Execution {
    Returned(Value),
    Failed(String),
    TimedOut,
    /// 周期审阅否决
    Stopped,
    Cancelled,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub struct ToolCaller {
    emitter: Emitter,
    gate: Arc<ReviewGate>,
    checkpoints: Arc<dyn CheckpointStore>,
    ids: Arc<SequenceGenerator>,
    limiter: OutputLimiter,
    timeout: Duration,
    interval_review: Option<IntervalReview>,
    cancel: CancellationToken,
}

impl ToolCaller {
    pub fn new(
        emitter: Emitter,
        gate: Arc<ReviewGate>,
        checkpoints: Arc<dyn CheckpointStore>,
        ids: Arc<SequenceGenerator>,
        limiter: OutputLimiter,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            emitter,
            gate,
            checkpoints,
            ids,
            limiter,
            timeout,
            interval_review: None,
            cancel,
        }
    }

    /// 工具运行期间每隔 `every` 把输出快照交给审阅方
    pub fn with_interval_review(
        mut self,
        reviewer: Arc<dyn IntervalReviewer>,
        every: Duration,
    ) -> Self {
        self.interval_review = Some(IntervalReview {
            reviewer,
            every: every.max(Duration::from_millis(1)),
        });
        self
    }

    fn validate(&self, tool: &dyn Tool, params: &Value, emitter: &Emitter) -> Result<()> {
        validate_params(&tool.parameters_schema(), params).map_err(|errors| {
            let err = OrchestratorError::InvalidToolParams {
                tool: tool.name().to_string(),
                reason: errors.join("; "),
            };
            emitter.error(&err);
            err
        })
    }

    /// 完整调用流程
    pub async fn call(
        &self,
        tool: Arc<dyn Tool>,
        params: Value,
        task_index: Option<&str>,
    ) -> Result<ToolCallOutcome> {
        let emitter = match task_index {
            Some(index) => self.emitter.with_task_index(index),
            None => self.emitter.clone(),
        };
        self.validate(tool.as_ref(), &params, &emitter)?;

        let mut params = params;
        if tool.requires_review() {
            match self.review(tool.as_ref(), &params, &emitter).await? {
                ToolReviewSuggestion::Continue => {}
                ToolReviewSuggestion::Unknown(other) => {
                    tracing::warn!(suggestion = %other, "unknown tool review suggestion, continuing");
                    emitter.warn(format!("unknown tool review suggestion '{other}', continuing"));
                }
                ToolReviewSuggestion::WrongParams {
                    suggestion_params, ..
                } => {
                    params = override_params(params, suggestion_params);
                    self.validate(tool.as_ref(), &params, &emitter)?;
                }
                ToolReviewSuggestion::WrongTool {
                    suggested_tool,
                    extra_prompt,
                } => {
                    return Ok(ToolCallOutcome::WrongTool {
                        tool: tool.name().to_string(),
                        params,
                        suggested_tool,
                        extra_prompt,
                    });
                }
            }
        }

        Ok(ToolCallOutcome::Completed(
            self.execute(tool, params, &emitter).await?,
        ))
    }

    /// 工具审阅门：按同意策略等待审阅方对本次调用的意见
    async fn review(
        &self,
        tool: &dyn Tool,
        params: &Value,
        emitter: &Emitter,
    ) -> Result<ToolReviewSuggestion> {
        let mut defaults = Params::new();
        defaults.insert("suggestion".into(), json!("continue"));
        let outcome = self
            .gate
            .suspend(
                emitter,
                Suspension {
                    kind: CheckpointKind::Review,
                    event: EventKind::ToolUseReviewRequire,
                    request: json!({ "tool": tool.name(), "params": params }),
                    materials: json!({
                        "selectors": ToolReviewSuggestion::selectors(),
                        "tool": tool.name(),
                        "tool_description": tool.description(),
                        "params": params,
                    }),
                    defaults,
                },
            )
            .await?;
        Ok(ToolReviewSuggestion::from_params(&outcome.params))
    }

    /// 在可取消的上下文中执行工具并捕获输出
    ///
    /// 已完成的执行记录直接回放，不再重复工具的副作用；取消的调用不写完成标记。
    pub async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        params: Value,
        emitter: &Emitter,
    ) -> Result<ToolResult> {
        let coordinator_id = emitter.coordinator_id().to_string();
        let seq = self.ids.next();
        let id = self.ids.next();
        let cp = self
            .checkpoints
            .get_or_create(&coordinator_id, seq, CheckpointKind::ToolCall)
            .await?;
        if cp.finished {
            if let Some(result) = cp
                .response
                .and_then(|r| serde_json::from_value::<ToolResult>(r).ok())
            {
                tracing::info!(tool = %result.name, seq, "tool call replayed from checkpoint");
                emitter.with_call_tool_id(&result.call_tool_id).emit(
                    EventKind::ToolCallDone,
                    json!({ "tool": result.name, "status": result.status, "replayed": true }),
                );
                return Ok(result);
            }
        }
        self.checkpoints
            .submit_request(
                &coordinator_id,
                seq,
                json!({ "tool": tool.name(), "params": params }),
                None,
            )
            .await?;

        let call_tool_id = uuid::Uuid::new_v4().to_string();
        let emitter = emitter.with_call_tool_id(&call_tool_id);
        let started = Instant::now();
        emitter.emit(
            EventKind::ToolCallStart,
            json!({ "tool": tool.name(), "params": params }),
        );

        let (stdout, stdout_pump) = capture("stdout", &emitter);
        let (stderr, stderr_pump) = capture("stderr", &emitter);
        let tool_cancel = self.cancel.child_token();
        let ctx = ToolContext {
            call_tool_id: call_tool_id.clone(),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            cancel: tool_cancel.clone(),
        };

        let execution = if self.cancel.is_cancelled() {
            drop(ctx);
            Execution::Cancelled
        } else {
            let invoke = tokio::time::timeout(self.timeout, tool.invoke(params.clone(), ctx));
            tokio::pin!(invoke);
            let mut ticker = self.interval_review.as_ref().map(|review| {
                tokio::time::interval_at(tokio::time::Instant::now() + review.every, review.every)
            });
            loop {
                tokio::select! {
                    r = &mut invoke => break match r {
                        Ok(Ok(value)) => Execution::Returned(value),
                        Ok(Err(e)) => Execution::Failed(e),
                        Err(_) => Execution::TimedOut,
                    },
                    _ = self.cancel.cancelled() => break Execution::Cancelled,
                    _ = next_tick(&mut ticker) => {
                        if !self.review_running(tool.as_ref(), &params, &stdout, &stderr).await {
                            tool_cancel.cancel();
                            emitter.warn(format!("tool {} stopped by interval review", tool.name()));
                            break Execution::Stopped;
                        }
                    }
                }
            }
        };

        // 转发任务在所有输出句柄释放后结束；工具自己泄漏了句柄时不无限等待
        let stdout_text = stdout.snapshot();
        let stderr_text = stderr.snapshot();
        drop(stdout);
        drop(stderr);
        for pump in [stdout_pump, stderr_pump] {
            let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await;
        }

        let (status, result_value, error) = match execution {
            Execution::Returned(value) => (ToolCallStatus::Succeeded, value, String::new()),
            Execution::Failed(e) => (
                ToolCallStatus::Failed,
                Value::Null,
                OrchestratorError::ToolExecutionFailed(e).to_string(),
            ),
            Execution::TimedOut => (
                ToolCallStatus::Failed,
                Value::Null,
                OrchestratorError::ToolTimeout(tool.name().to_string()).to_string(),
            ),
            Execution::Stopped => (
                ToolCallStatus::Failed,
                Value::Null,
                OrchestratorError::ToolExecutionFailed(format!(
                    "{} stopped by interval review",
                    tool.name()
                ))
                .to_string(),
            ),
            Execution::Cancelled => (
                ToolCallStatus::Cancelled,
                Value::Null,
                "tool call cancelled".to_string(),
            ),
        };

        let result_value = match serde_json::to_string(&result_value) {
            Ok(serialized) if serialized.len() > self.limiter.limit_bytes() => Value::String(
                self.limiter
                    .apply(&call_tool_id, "result", serialized)
                    .await,
            ),
            _ => result_value,
        };
        let stdout_text = self.limiter.apply(&call_tool_id, "stdout", stdout_text).await;
        let stderr_text = self.limiter.apply(&call_tool_id, "stderr", stderr_text).await;
        let result = ToolResult {
            id,
            call_tool_id: call_tool_id.clone(),
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            params,
            success: status == ToolCallStatus::Succeeded,
            status,
            data: ToolExecutionData {
                stdout: stdout_text,
                stderr: stderr_text,
                result: result_value,
            },
            error,
            shrink_result: None,
            shrink_similar_result: None,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let audit = json!({
            "event": "tool_audit",
            "tool": result.name,
            "call_tool_id": call_tool_id,
            "status": result.status,
            "duration_ms": duration_ms,
            "params_preview": preview(&result.params),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
        let kind = match result.status {
            ToolCallStatus::Succeeded => EventKind::ToolCallResult,
            ToolCallStatus::Failed => EventKind::ToolCallError,
            ToolCallStatus::Cancelled => EventKind::ToolCallCancelled,
        };
        if result.status != ToolCallStatus::Cancelled {
            self.checkpoints
                .submit_response(&coordinator_id, seq, payload.clone())
                .await?;
        }
        emitter.emit(kind, payload);
        emitter.emit(
            EventKind::ToolCallDone,
            json!({ "tool": result.name, "status": result.status, "duration_ms": duration_ms }),
        );
        Ok(result)
    }

    /// 周期审阅一次；审阅方出错时放行
    async fn review_running(
        &self,
        tool: &dyn Tool,
        params: &Value,
        stdout: &ToolOutput,
        stderr: &ToolOutput,
    ) -> bool {
        let Some(review) = &self.interval_review else {
            return true;
        };
        match review
            .reviewer
            .review(tool.name(), params, &stdout.snapshot(), &stderr.snapshot())
            .await
        {
            Ok(keep) => {
                tracing::debug!(tool = %tool.name(), keep, "interval review");
                keep
            }
            Err(e) => {
                tracing::warn!(tool = %tool.name(), error = %e, "interval review failed, tool keeps running");
                true
            }
        }
    }
}

/// 用审阅方给出的参数覆盖同名键
fn override_params(params: Value, overrides: Params) -> Value {
    match params {
        Value::Object(mut map) => {
            for (k, v) in overrides {
                map.insert(k, v);
            }
            Value::Object(map)
        }
        _ => Value::Object(overrides),
    }
}

fn preview(params: &Value) -> String {
    let s = params.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::endpoint::{AgreeConfig, AgreePolicy, AgreeResolver, EndpointManager};
    use crate::events::{CollectingSink, EventKind};
    use crate::tools::{EchoTool, ToolOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 需要 path 参数的工具，记录是否真的执行过
    struct CountingTool {
        runs: Arc<AtomicUsize>,
        stdout_tap: ToolOutput,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "read a file"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        async fn invoke(&self, params: Value, ctx: ToolContext) -> std::result::Result<Value, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.stdout.write("reading");
            self.stdout_tap.write("reading");
            Ok(json!({ "path": params["path"] }))
        }
    }

    /// 写一行后挂起，直到被取消
    struct HangingTool;

    #[async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "hang"
        }
        fn description(&self) -> &str {
            "never returns"
        }
        fn requires_review(&self) -> bool {
            false
        }
        async fn invoke(&self, _params: Value, ctx: ToolContext) -> std::result::Result<Value, String> {
            ctx.stdout.write_line("partial line");
            ctx.stderr.write("warn");
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    struct Fixture {
        caller: ToolCaller,
        sink: CollectingSink,
        manager: Arc<EndpointManager>,
        cancel: CancellationToken,
        _spill: tempfile::TempDir,
    }

    fn fixture(policy: AgreePolicy) -> Fixture {
        let cancel = CancellationToken::new();
        let sink = CollectingSink::new();
        let emitter = Emitter::new("c1", Arc::new(sink.clone()));
        let ids = Arc::new(SequenceGenerator::new());
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let manager = EndpointManager::new(ids.clone(), cancel.clone());
        let agree = Arc::new(AgreeResolver::new(
            AgreeConfig {
                policy,
                ..AgreeConfig::default()
            },
            None,
            store.clone(),
            "c1",
        ));
        let gate = Arc::new(ReviewGate::new(
            manager.clone(),
            agree,
            store.clone(),
            ids.clone(),
            cancel.clone(),
        ));
        let spill = tempfile::tempdir().unwrap();
        let caller = ToolCaller::new(
            emitter,
            gate,
            store,
            ids,
            OutputLimiter::new(64, spill.path().to_path_buf()),
            Duration::from_secs(5),
            cancel.clone(),
        );
        Fixture {
            caller,
            sink,
            manager,
            cancel,
            _spill: spill,
        }
    }

    #[tokio::test]
    async fn test_validation_gate_never_executes() {
        let fx = fixture(AgreePolicy::Yolo);
        let runs = Arc::new(AtomicUsize::new(0));
        let tap = ToolOutput::detached();
        let tool = Arc::new(CountingTool {
            runs: runs.clone(),
            stdout_tap: tap.clone(),
        });

        let err = fx.caller.call(tool, json!({}), None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidToolParams { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(tap.write_count(), 0);
        assert!(fx.sink.of_kind(EventKind::ToolCallStart).is_empty());
        assert_eq!(fx.sink.of_kind(EventKind::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_yolo_call_succeeds_with_captured_stdout() {
        let fx = fixture(AgreePolicy::Yolo);
        let outcome = fx
            .caller
            .call(Arc::new(EchoTool), json!({"text": "hello"}), Some("1-1"))
            .await
            .unwrap();
        let ToolCallOutcome::Completed(result) = outcome else {
            panic!("expected completed");
        };
        assert!(result.success);
        assert_eq!(result.data.stdout, "hello\n");
        assert_eq!(result.data.result["text"], "hello");

        // 审阅请求在释放事件之前，工具执行在释放之后
        let kinds: Vec<EventKind> = fx.sink.events().iter().map(|e| e.kind).collect();
        let pos = |k| kinds.iter().position(|x| *x == k).unwrap();
        assert!(pos(EventKind::ToolUseReviewRequire) < pos(EventKind::InteractiveRelease));
        assert!(pos(EventKind::InteractiveRelease) < pos(EventKind::ToolCallStart));
        assert!(pos(EventKind::ToolCallResult) < pos(EventKind::ToolCallDone));
        assert!(fx
            .sink
            .of_kind(EventKind::ToolCallStart)
            .iter()
            .all(|e| e.task_index.as_deref() == Some("1-1")));
    }

    #[tokio::test]
    async fn test_wrong_params_overrides_before_execution() {
        let fx = fixture(AgreePolicy::Manual);
        let manager = fx.manager.clone();
        let sink = fx.sink.clone();
        let reviewer = tokio::spawn(async move {
            loop {
                if let Some(event) = sink.of_kind(EventKind::ToolUseReviewRequire).first() {
                    let id = event.content["id"].as_str().unwrap().to_string();
                    let params = json!({
                        "suggestion": "wrong_params",
                        "suggestion_params": {"text": "corrected"}
                    });
                    manager.feed(&id, params.as_object().cloned().unwrap());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let outcome = fx
            .caller
            .call(Arc::new(EchoTool), json!({"text": "typo"}), None)
            .await
            .unwrap();
        reviewer.await.unwrap();
        let ToolCallOutcome::Completed(result) = outcome else {
            panic!("expected completed");
        };
        assert_eq!(result.params["text"], "corrected");
        assert_eq!(result.data.stdout, "corrected\n");
    }

    #[tokio::test]
    async fn test_wrong_tool_returns_to_loop() {
        let fx = fixture(AgreePolicy::Manual);
        let manager = fx.manager.clone();
        let sink = fx.sink.clone();
        tokio::spawn(async move {
            loop {
                if let Some(event) = sink.of_kind(EventKind::ToolUseReviewRequire).first() {
                    let id = event.content["id"].as_str().unwrap().to_string();
                    let params = json!({"suggestion": "wrong_tool", "suggestion_tool": "grep"});
                    manager.feed(&id, params.as_object().cloned().unwrap());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let outcome = fx
            .caller
            .call(Arc::new(EchoTool), json!({"text": "x"}), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ToolCallOutcome::WrongTool {
                tool: "echo".into(),
                params: json!({"text": "x"}),
                suggested_tool: Some("grep".into()),
                extra_prompt: String::new(),
            }
        );
        assert!(fx.sink.of_kind(EventKind::ToolCallStart).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_returns_partial_capture() {
        let fx = fixture(AgreePolicy::Yolo);
        let cancel = fx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let outcome = fx
            .caller
            .call(Arc::new(HangingTool), json!({}), None)
            .await
            .unwrap();
        let ToolCallOutcome::Completed(result) = outcome else {
            panic!("expected completed");
        };
        assert_eq!(result.status, ToolCallStatus::Cancelled);
        assert!(!result.success);
        assert_eq!(result.data.stdout, "partial line\n");
        assert_eq!(result.data.stderr, "warn");
        assert_eq!(fx.sink.of_kind(EventKind::ToolCallCancelled).len(), 1);
    }

    #[tokio::test]
    async fn test_large_stdout_is_spilled() {
        let fx = fixture(AgreePolicy::Yolo);
        let text = "y".repeat(500);
        let outcome = fx
            .caller
            .call(Arc::new(EchoTool), json!({ "text": text }), None)
            .await
            .unwrap();
        let ToolCallOutcome::Completed(result) = outcome else {
            panic!("expected completed");
        };
        assert!(result.data.stdout.contains("full content saved in file"));
        // 结果序列化后同样超限，独立截断
        assert!(result.data.result.as_str().unwrap().contains("result truncated"));
        assert!(result.data.stderr.is_empty());
    }

    /// 每 5ms 写一次 tick，直到被取消；把收到的取消令牌交给测试观察
    struct TickingTool {
        token: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    }

    #[async_trait]
    impl Tool for TickingTool {
        fn name(&self) -> &str {
            "ticker"
        }
        fn description(&self) -> &str {
            "prints ticks"
        }
        fn requires_review(&self) -> bool {
            false
        }
        async fn invoke(&self, _params: Value, ctx: ToolContext) -> std::result::Result<Value, String> {
            *self.token.lock().unwrap() = Some(ctx.cancel.clone());
            loop {
                ctx.stdout.write("tick ");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    _ = ctx.cancel.cancelled() => return Err("stopped".into()),
                }
            }
        }
    }

    /// 看到足够多的 tick 后否决，记录每次看到的快照
    struct RejectAfterTicks {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IntervalReviewer for RejectAfterTicks {
        async fn review(
            &self,
            tool: &str,
            _params: &Value,
            stdout: &str,
            _stderr: &str,
        ) -> std::result::Result<bool, String> {
            assert_eq!(tool, "ticker");
            let mut seen = self.seen.lock().unwrap();
            seen.push(stdout.to_string());
            Ok(seen.len() < 2)
        }
    }

    #[tokio::test]
    async fn test_interval_review_stops_running_tool() {
        let fx = fixture(AgreePolicy::Yolo);
        let reviewer = Arc::new(RejectAfterTicks {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let caller = fx
            .caller
            .with_interval_review(reviewer.clone(), Duration::from_millis(20));
        let token = Arc::new(std::sync::Mutex::new(None));

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            caller.call(Arc::new(TickingTool { token: token.clone() }), json!({}), None),
        )
        .await
        .expect("interval review must stop the tool")
        .unwrap();
        let ToolCallOutcome::Completed(result) = outcome else {
            panic!("expected completed");
        };

        assert_eq!(result.status, ToolCallStatus::Failed);
        assert!(result.error.contains("interval review"));
        assert!(result.data.stdout.starts_with("tick "));
        let seen = reviewer.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("tick"));
        assert!(token.lock().unwrap().as_ref().unwrap().is_cancelled());
        assert_eq!(fx.sink.of_kind(EventKind::ToolCallError).len(), 1);
        // 否决不等于协调器取消
        assert!(!fx.cancel.is_cancelled());
    }

    struct AlwaysKeep;

    #[async_trait]
    impl IntervalReviewer for AlwaysKeep {
        async fn review(
            &self,
            _tool: &str,
            _params: &Value,
            _stdout: &str,
            _stderr: &str,
        ) -> std::result::Result<bool, String> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_interval_review_keeps_finished_tool() {
        let fx = fixture(AgreePolicy::Yolo);
        let caller = fx
            .caller
            .with_interval_review(Arc::new(AlwaysKeep), Duration::from_millis(1));
        let outcome = caller
            .call(Arc::new(EchoTool), json!({"text": "fine"}), None)
            .await
            .unwrap();
        let ToolCallOutcome::Completed(result) = outcome else {
            panic!("expected completed");
        };
        assert!(result.success);
        assert_eq!(result.data.stdout, "fine\n");
    }
}
