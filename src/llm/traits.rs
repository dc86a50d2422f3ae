//! AI 回调抽象
//!
//! 模型调用本身是外部协作方：`(prompt) -> 流式响应`。响应把正文与推理过程分成两条流，
//! 写端 `close` 后两条流的读者都会看到结束。

use async_trait::async_trait;
use tokio::sync::mpsc;

/// 一次模型调用的请求
#[derive(Debug, Clone, PartialEq)]
pub struct AiRequest {
    pub prompt: String,
    /// 请求用途（plan / task-step / timeline-shrink ...），供路由或 mock 使用
    pub kind: String,
    pub task_index: Option<String>,
    /// checkpoint 序号
    pub seq: i64,
}

impl AiRequest {
    pub fn new(kind: &str, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            kind: kind.to_string(),
            task_index: None,
            seq: 0,
        }
    }
}

/// AI 回调 trait
#[async_trait]
pub trait AiCallback: Send + Sync {
    async fn call(&self, request: AiRequest) -> Result<AiResponse, String>;
}

/// 流式响应的读端
pub struct AiResponse {
    output: mpsc::UnboundedReceiver<String>,
    reasoning: Option<mpsc::UnboundedReceiver<String>>,
}

/// 流式响应的写端；drop 等同于 close
pub struct AiResponseWriter {
    output: Option<mpsc::UnboundedSender<String>>,
    reasoning: Option<mpsc::UnboundedSender<String>>,
}

impl AiResponse {
    pub fn channel() -> (AiResponseWriter, AiResponse) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (reasoning_tx, reasoning_rx) = mpsc::unbounded_channel();
        (
            AiResponseWriter {
                output: Some(output_tx),
                reasoning: Some(reasoning_tx),
            },
            AiResponse {
                output: output_rx,
                reasoning: Some(reasoning_rx),
            },
        )
    }

    /// 一次性完整文本
    pub fn from_text(text: impl Into<String>) -> Self {
        let (mut writer, response) = Self::channel();
        writer.write_output(text);
        writer.close();
        response
    }

    /// 下一段正文；流结束返回 None
    pub async fn next_output(&mut self) -> Option<String> {
        self.output.recv().await
    }

    /// 取走推理流，由调用方独立消费
    pub fn take_reasoning(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.reasoning.take()
    }

    /// 读完正文（推理流未被取走时一并读完并丢弃）
    pub async fn read_all(mut self) -> String {
        let mut text = String::new();
        let reasoning = self.reasoning.take();
        let drain = async move {
            if let Some(mut rx) = reasoning {
                while rx.recv().await.is_some() {}
            }
        };
        let read = async {
            while let Some(chunk) = self.output.recv().await {
                text.push_str(&chunk);
            }
        };
        tokio::join!(read, drain);
        text
    }
}

impl AiResponseWriter {
    pub fn write_output(&mut self, chunk: impl Into<String>) {
        if let Some(tx) = &self.output {
            let _ = tx.send(chunk.into());
        }
    }

    pub fn write_reasoning(&mut self, chunk: impl Into<String>) {
        if let Some(tx) = &self.reasoning {
            let _ = tx.send(chunk.into());
        }
    }

    /// 结束两条流
    pub fn close(&mut self) {
        self.output = None;
        self.reasoning = None;
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_ends_both_streams() {
        let (mut writer, mut response) = AiResponse::channel();
        let mut reasoning = response.take_reasoning().unwrap();
        writer.write_reasoning("think");
        writer.write_output("he");
        writer.write_output("llo");
        writer.close();

        assert_eq!(reasoning.recv().await.as_deref(), Some("think"));
        assert!(reasoning.recv().await.is_none());
        assert_eq!(response.read_all().await, "hello");
    }

    #[tokio::test]
    async fn test_from_text() {
        assert_eq!(AiResponse::from_text("x").read_all().await, "x");
    }
}
