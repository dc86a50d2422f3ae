//! AI 调用器：checkpoint 回放、可取消的流式读取、带失败原因的事务重试
//!
//! 每次调用分配一个序号并建 `ai-call` checkpoint；已完成的记录直接回放输出，
//! 这让重启后的协调器沿着同一条序号路径走回崩溃点而不重复询问模型。

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine, Result, SequenceGenerator};
use crate::events::{Emitter, EventKind};
use crate::llm::{AiCallback, AiRequest};

/// 事务重试参数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

pub struct AiInvoker {
    ai: Arc<dyn AiCallback>,
    checkpoints: Arc<dyn CheckpointStore>,
    ids: Arc<SequenceGenerator>,
    emitter: Emitter,
    retry: RetryPolicy,
    cancel: CancellationToken,
    recovery: RecoveryEngine,
}

impl AiInvoker {
    pub fn new(
        ai: Arc<dyn AiCallback>,
        checkpoints: Arc<dyn CheckpointStore>,
        ids: Arc<SequenceGenerator>,
        emitter: Emitter,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ai,
            checkpoints,
            ids,
            emitter,
            retry,
            cancel,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn coordinator_id(&self) -> &str {
        self.emitter.coordinator_id()
    }

    /// 单次调用（不重试）
    pub async fn call_once(
        &self,
        kind: &str,
        prompt: &str,
        task_index: Option<&str>,
    ) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let emitter = match task_index {
            Some(index) => self.emitter.with_task_index(index),
            None => self.emitter.clone(),
        };

        let seq = self.ids.next();
        let cp = self
            .checkpoints
            .get_or_create(self.coordinator_id(), seq, CheckpointKind::AiCall)
            .await?;
        if cp.finished {
            if let Some(output) = cp
                .response
                .as_ref()
                .and_then(|r| r.get("output"))
                .and_then(|v| v.as_str())
            {
                emitter.emit(EventKind::AiReplay, json!({ "seq": seq, "kind": kind }));
                return Ok(output.to_string());
            }
        }
        self.checkpoints
            .submit_request(
                self.coordinator_id(),
                seq,
                json!({ "kind": kind, "prompt": prompt }),
                None,
            )
            .await?;

        let request = AiRequest {
            prompt: prompt.to_string(),
            kind: kind.to_string(),
            task_index: task_index.map(str::to_string),
            seq,
        };
        let mut response = tokio::select! {
            r = self.ai.call(request) => r.map_err(OrchestratorError::AiCallFailed)?,
            _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        };

        if let Some(reasoning) = response.take_reasoning() {
            pump_reasoning(reasoning, emitter.clone(), self.cancel.clone());
        }

        let mut output = String::new();
        loop {
            tokio::select! {
                chunk = response.next_output() => match chunk {
                    Some(chunk) => {
                        emitter.stream("ai-output", &chunk);
                        output.push_str(&chunk);
                    }
                    None => break,
                },
                _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            }
        }
        if output.trim().is_empty() {
            return Err(OrchestratorError::AiCallFailed(
                "empty response from AI".to_string(),
            ));
        }

        self.checkpoints
            .submit_response(self.coordinator_id(), seq, json!({ "output": output }))
            .await?;
        Ok(output)
    }

    /// AI 事务：调用并交给 `handler` 解析，解析或调用失败时把原因折叠进提示后重试
    pub async fn transaction<T>(
        &self,
        kind: &str,
        prompt: &str,
        task_index: Option<&str>,
        mut handler: impl FnMut(&str) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.retry.attempts.max(1);
        let mut current = prompt.to_string();
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry.backoff) => {}
                    _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                }
            }

            let outcome = match self.call_once(kind, &current, task_index).await {
                Ok(text) => handler(&text),
                Err(e) => Err(e),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.recovery.handle(&err) {
                RecoveryAction::RetryWithPrompt(reason) => {
                    tracing::warn!(kind, attempt, error = %err, "AI transaction attempt failed");
                    self.emitter.warn(format!(
                        "AI transaction {kind} attempt {attempt}/{attempts} failed: {err}"
                    ));
                    current = RecoveryEngine::fold_retry_reason(prompt, &reason);
                    last_err = Some(err);
                }
                RecoveryAction::Abort => {
                    self.emitter.error(&err);
                    return Err(err);
                }
            }
        }

        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        let err = OrchestratorError::AiCallFailed(format!(
            "{kind} failed after {attempts} attempts: {reason}"
        ));
        self.emitter.error(&err);
        Err(err)
    }
}

/// 把推理流转成 Stream 事件；回调不关闭推理流时随取消令牌结束
fn pump_reasoning(
    mut reasoning: mpsc::UnboundedReceiver<String>,
    emitter: Emitter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                chunk = reasoning.recv() => match chunk {
                    Some(chunk) => {
                        emitter.stream("reasoning", &chunk);
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::extract_action;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::events::CollectingSink;
    use crate::llm::MockAi;

    struct Fixture {
        ai: Arc<MockAi>,
        store: Arc<MemoryCheckpointStore>,
        sink: CollectingSink,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(ai: MockAi) -> Self {
            Self {
                ai: Arc::new(ai),
                store: Arc::new(MemoryCheckpointStore::new()),
                sink: CollectingSink::new(),
                cancel: CancellationToken::new(),
            }
        }

        fn invoker(&self) -> AiInvoker {
            AiInvoker::new(
                self.ai.clone(),
                self.store.clone(),
                Arc::new(SequenceGenerator::new()),
                Emitter::new("c1", Arc::new(self.sink.clone())),
                RetryPolicy {
                    attempts: 3,
                    backoff: Duration::from_millis(1),
                },
                self.cancel.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_retry_folds_reason_into_prompt() {
        let fx = Fixture::new(MockAi::scripted(vec![
            "I forgot the json".into(),
            r#"{"@action": "finished"}"#.into(),
        ]));
        let invoker = fx.invoker();
        let action = invoker
            .transaction("tool-decision", "decide", None, |text| {
                extract_action(text, &["finished"])
            })
            .await
            .unwrap();
        assert_eq!(action.name(), "finished");

        let calls = fx.ai.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].prompt, "decide");
        assert!(calls[1].prompt.contains("# Error Handling"));
        assert!(calls[1].prompt.contains("No action found"));
        assert_eq!(fx.sink.of_kind(EventKind::Warning).len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_emit_error() {
        let fx = Fixture::new(MockAi::new(|_| Err("backend down".to_string())));
        let err = fx
            .invoker()
            .transaction("plan", "p", None, |t| Ok(t.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AiCallFailed(_)));
        assert_eq!(fx.ai.calls().len(), 3);
        assert_eq!(fx.sink.of_kind(EventKind::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_finished_checkpoint_replays_without_calling_ai() {
        let fx = Fixture::new(MockAi::scripted(vec!["first".into()]));
        assert_eq!(fx.invoker().call_once("k", "p", None).await.unwrap(), "first");

        // 同一 coordinator 重新从 1000 开始分配序号，命中已完成记录
        let replay = fx.invoker().call_once("k", "p", None).await.unwrap();
        assert_eq!(replay, "first");
        assert_eq!(fx.ai.calls().len(), 1);
        assert_eq!(fx.sink.of_kind(EventKind::AiReplay).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_first_byte() {
        let fx = Fixture::new(
            MockAi::scripted(vec!["late".into()]).with_first_byte_delay(Duration::from_secs(5)),
        );
        let invoker = fx.invoker();
        let cancel = fx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let err = invoker.call_once("k", "p", None).await.unwrap_err();
        assert_eq!(err, OrchestratorError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));

        let cp = fx.store.latest_unfinished("c1").await.unwrap().unwrap();
        assert_eq!(cp.seq, 1000);
    }

    #[tokio::test]
    async fn test_reasoning_pump_stops_on_cancel() {
        let sink = CollectingSink::new();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = pump_reasoning(rx, Emitter::new("c1", Arc::new(sink.clone())), cancel.clone());

        tx.send("thinking".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        // 发送端仍然存活，只有取消能让转发任务结束
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("reasoning pump outlived cancellation")
            .unwrap();
        assert_eq!(sink.of_kind(EventKind::Stream).len(), 1);
        drop(tx);
    }
}
