//! 事件记录与 Sink

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// 事件类型（序列化为 snake_case，供前端展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Info,
    Warning,
    Error,
    /// 计划生成 / 重新规划后的整棵任务树
    PlanCreated,
    /// 任务状态变化
    TaskStatus,
    TaskReviewRequire,
    ToolUseReviewRequire,
    RequireUserInteractive,
    /// 挂起点已释放（人工或自动）
    InteractiveRelease,
    ToolCallStart,
    ToolCallResult,
    ToolCallDone,
    ToolCallError,
    ToolCallCancelled,
    /// 流式片段（stdout / stderr / 模型输出 / 推理）
    Stream,
    /// 从 checkpoint 回放的 AI 响应
    AiReplay,
    TimelineCompacted,
    /// Guardian 或其它旁路产生的结构化状态
    Structured,
    Done,
}

/// 单条事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 发射顺序号（协调器内全序）
    pub seq: u64,
    pub coordinator_id: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_tool_id: Option<String>,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(coordinator_id: &str, kind: EventKind, content: Value) -> Self {
        Self {
            seq: 0,
            coordinator_id: coordinator_id.to_string(),
            kind,
            task_index: None,
            call_tool_id: None,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Stream 事件的流名
    pub fn stream_name(&self) -> Option<&str> {
        if self.kind != EventKind::Stream {
            return None;
        }
        self.content.get("stream").and_then(|v| v.as_str())
    }

    pub fn stream_chunk(&self) -> Option<&str> {
        if self.kind != EventKind::Stream {
            return None;
        }
        self.content.get("chunk").and_then(|v| v.as_str())
    }
}

/// 外部事件出口；调用发生在发射锁内，实现不应长时间阻塞
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &Event);
}

/// 转发到 mpsc 通道（UI / 传输层消费）
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn handle(&self, event: &Event) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(kind = ?event.kind, "event receiver dropped");
        }
    }
}

/// 收集全部事件，便于断言顺序
#[derive(Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn handle(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// 只写日志
#[derive(Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, event: &Event) {
        match event.kind {
            EventKind::Error => tracing::error!(
                seq = event.seq,
                task = event.task_index.as_deref().unwrap_or("-"),
                content = %event.content,
                "event"
            ),
            EventKind::Stream => tracing::debug!(seq = event.seq, content = %event.content, "stream"),
            kind => tracing::info!(
                seq = event.seq,
                kind = ?kind,
                task = event.task_index.as_deref().unwrap_or("-"),
                content = %event.content,
                "event"
            ),
        }
    }
}
