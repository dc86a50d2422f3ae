//! 事件发射器
//!
//! 每个协调器一个 `EmitterInner`：一把互斥锁覆盖「分配序号 → 交给 Sink → 投递 Guardian」，
//! 因此单个 Sink 观察到的顺序与发射顺序完全一致。克隆出的发射器共享这把锁，
//! 各自的处理器栈只影响自己发出的事件。

use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{json, Value};

use crate::core::OrchestratorError;
use crate::events::{AsyncGuardian, Event, EventKind, EventSink};

type Processor = Arc<dyn Fn(&mut Event) + Send + Sync>;

struct EmitterInner {
    coordinator_id: String,
    sink: Arc<dyn EventSink>,
    next_seq: Mutex<u64>,
    guardian: OnceLock<Arc<AsyncGuardian>>,
}

#[derive(Clone)]
pub struct Emitter {
    inner: Arc<EmitterInner>,
    processors: Vec<Processor>,
    feed_guardian: bool,
}

impl Emitter {
    pub fn new(coordinator_id: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                coordinator_id: coordinator_id.to_string(),
                sink,
                next_seq: Mutex::new(0),
                guardian: OnceLock::new(),
            }),
            processors: Vec::new(),
            feed_guardian: true,
        }
    }

    pub fn coordinator_id(&self) -> &str {
        &self.inner.coordinator_id
    }

    /// 挂接 Guardian（只生效一次）
    pub fn attach_guardian(&self, guardian: Arc<AsyncGuardian>) {
        if self.inner.guardian.set(guardian).is_err() {
            tracing::warn!("guardian already attached");
        }
    }

    /// 不回灌 Guardian 的副本，供 Guardian 回调自己发事件，避免回环
    pub fn detached(&self) -> Self {
        let mut out = self.clone();
        out.feed_guardian = false;
        out
    }

    /// 压入一个处理器，返回新的发射器，原发射器不受影响
    pub fn with_processor(&self, processor: impl Fn(&mut Event) + Send + Sync + 'static) -> Self {
        let mut out = self.clone();
        out.processors.push(Arc::new(processor));
        out
    }

    pub fn with_task_index(&self, index: &str) -> Self {
        let index = index.to_string();
        self.with_processor(move |e| e.task_index = Some(index.clone()))
    }

    pub fn with_call_tool_id(&self, id: &str) -> Self {
        let id = id.to_string();
        self.with_processor(move |e| e.call_tool_id = Some(id.clone()))
    }

    pub fn emit(&self, kind: EventKind, content: Value) -> Event {
        let mut event = Event::new(&self.inner.coordinator_id, kind, content);
        for processor in &self.processors {
            processor(&mut event);
        }

        let mut next = self
            .inner
            .next_seq
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        event.seq = *next;
        *next += 1;
        self.inner.sink.handle(&event);
        if self.feed_guardian {
            if let Some(guardian) = self.inner.guardian.get() {
                guardian.feed(event.clone());
            }
        }
        drop(next);
        event
    }

    pub fn info(&self, message: impl Into<String>) -> Event {
        self.emit(EventKind::Info, json!({ "message": message.into() }))
    }

    pub fn warn(&self, message: impl Into<String>) -> Event {
        self.emit(EventKind::Warning, json!({ "message": message.into() }))
    }

    /// 错误同时返回给调用方与发到 Sink：这里负责后者
    pub fn error(&self, err: &OrchestratorError) -> Event {
        self.emit(
            EventKind::Error,
            json!({
                "error": err.kind(),
                "message": err.to_string(),
                "retryable": err.is_retryable(),
            }),
        )
    }

    pub fn stream(&self, stream: &str, chunk: &str) -> Event {
        self.emit(EventKind::Stream, json!({ "stream": stream, "chunk": chunk }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;

    #[test]
    fn test_sequence_matches_emission_order() {
        let sink = CollectingSink::new();
        let emitter = Emitter::new("c1", Arc::new(sink.clone()));
        let tagged = emitter.with_task_index("1-2");

        emitter.info("a");
        tagged.info("b");
        emitter.warn("c");

        let events = sink.events();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(events[0].task_index, None);
        assert_eq!(events[1].task_index.as_deref(), Some("1-2"));
        assert_eq!(events[2].kind, EventKind::Warning);
    }

    #[test]
    fn test_concurrent_emitters_share_total_order() {
        let sink = CollectingSink::new();
        let emitter = Emitter::new("c1", Arc::new(sink.clone()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let e = emitter.with_call_tool_id(&format!("t{i}"));
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        e.info("x");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let seqs: Vec<u64> = sink.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..200).collect::<Vec<u64>>());
    }

    #[test]
    fn test_error_event_carries_classification() {
        let sink = CollectingSink::new();
        let emitter = Emitter::new("c1", Arc::new(sink.clone()));
        emitter.error(&OrchestratorError::ToolNotFound("ghost".into()));
        let event = &sink.of_kind(EventKind::Error)[0];
        assert_eq!(event.content["error"], "tool_not_found");
        assert_eq!(event.content["retryable"], false);
    }
}
