//! Mock AI（用于测试与演示，无需真实模型）
//!
//! 按请求用途（`AiRequest::kind`）路由到回调，记录每次请求，便于断言调用次数。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{AiCallback, AiRequest, AiResponse};

type Responder = Box<dyn Fn(&AiRequest) -> Result<String, String> + Send + Sync>;

pub struct MockAi {
    responder: Responder,
    calls: Mutex<Vec<AiRequest>>,
    first_byte_delay: Option<Duration>,
}

impl MockAi {
    pub fn new(
        responder: impl Fn(&AiRequest) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            first_byte_delay: None,
        }
    }

    /// 依次返回给定响应，用完后重复最后一条
    pub fn scripted(responses: Vec<String>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            let mut queue = queue.lock().map_err(|_| "mock poisoned".to_string())?;
            match queue.len() {
                0 => Err("no scripted response".to_string()),
                1 => Ok(queue[0].clone()),
                _ => Ok(queue.pop_front().unwrap_or_default()),
            }
        })
    }

    /// 演示用：一个两步计划，每个子任务调用一次 echo 后结束
    pub fn demo() -> Self {
        Self::new(|req| {
            let text = match req.kind.as_str() {
                "plan" | "re-plan" => r#"{"@action": "plan", "main_task": "demo", "main_task_goal": "show the task loop",
                    "tasks": [
                        {"subtask_name": "greet", "subtask_goal": "echo a greeting"},
                        {"subtask_name": "report", "subtask_goal": "echo a short report"}
                    ]}"#
                .to_string(),
                "task-step" | "tool-params" => format!(
                    r#"{{"@action": "call-tool", "tool": "echo", "params": {{"text": "working on {}"}}}}"#,
                    req.task_index.as_deref().unwrap_or("task")
                ),
                "tool-decision" => r#"{"@action": "finished", "summary": "echo done"}"#.to_string(),
                "task-summary" => {
                    r#"{"@action": "summary", "short_summary": "done", "long_summary": "echo tool ran"}"#
                        .to_string()
                }
                "timeline-shrink" => {
                    r#"{"@action": "timeline-shrink", "persistent": "echo ran"}"#.to_string()
                }
                "timeline-reducer" => {
                    r#"{"@action": "timeline-reducer", "reducer_memory": "earlier echoes"}"#
                        .to_string()
                }
                other => return Err(format!("mock has no answer for {other}")),
            };
            Ok(text)
        })
    }

    /// 首字节前延迟，用于取消测试
    pub fn with_first_byte_delay(mut self, delay: Duration) -> Self {
        self.first_byte_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<AiRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_of(&self, kind: &str) -> usize {
        self.calls().iter().filter(|r| r.kind == kind).count()
    }
}

#[async_trait]
impl AiCallback for MockAi {
    async fn call(&self, request: AiRequest) -> Result<AiResponse, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let text = (self.responder)(&request)?;
        let Some(delay) = self.first_byte_delay else {
            return Ok(AiResponse::from_text(text));
        };

        let (mut writer, response) = AiResponse::channel();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            writer.write_reasoning(format!("mock reasoning for {}", request.kind));
            writer.write_output(text);
            writer.close();
        });
        Ok(response)
    }
}
