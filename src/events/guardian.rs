//! 异步 Guardian：旁路观察全部事件
//!
//! 发射器把每个事件无阻塞地投进通道，后台任务按事件类型调用触发器，
//! 并把指定名称的 Stream 片段镜像给订阅回调。回调拿到的是不回灌 Guardian 的发射器，
//! 可以安全地再发状态事件。回调 panic 只记日志。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::events::{Emitter, Event, EventKind};

/// 事件触发器：(事件, 可用于再发事件的发射器)
pub type EventTrigger = Arc<dyn Fn(&Event, &Emitter) + Send + Sync>;

/// 流镜像回调：(片段, 原事件, 发射器)
pub type StreamMirror = Arc<dyn Fn(&str, &Event, &Emitter) + Send + Sync>;

#[derive(Default)]
struct Registry {
    triggers: HashMap<EventKind, Vec<EventTrigger>>,
    mirrors: HashMap<String, Vec<StreamMirror>>,
}

pub struct AsyncGuardian {
    tx: mpsc::UnboundedSender<Event>,
    registry: Arc<RwLock<Registry>>,
    fed: AtomicU64,
    processed: watch::Receiver<u64>,
}

impl AsyncGuardian {
    /// 启动后台任务；`output` 应是 `Emitter::detached()` 的结果
    pub fn spawn(output: Emitter, cancel: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let (processed_tx, processed_rx) = watch::channel(0u64);
        let registry = Arc::new(RwLock::new(Registry::default()));
        let worker_registry = registry.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => {
                        let Some(event) = next else { break };
                        dispatch(&worker_registry, &event, &output);
                        processed_tx.send_modify(|n| *n += 1);
                    }
                }
            }
            tracing::debug!("guardian stopped");
        });

        Arc::new(Self {
            tx,
            registry,
            fed: AtomicU64::new(0),
            processed: processed_rx,
        })
    }

    pub fn register_event_trigger(
        &self,
        kind: EventKind,
        trigger: impl Fn(&Event, &Emitter) + Send + Sync + 'static,
    ) {
        if let Ok(mut reg) = self.registry.write() {
            reg.triggers.entry(kind).or_default().push(Arc::new(trigger));
        }
    }

    pub fn register_stream_mirror(
        &self,
        stream: &str,
        mirror: impl Fn(&str, &Event, &Emitter) + Send + Sync + 'static,
    ) {
        if let Ok(mut reg) = self.registry.write() {
            reg.mirrors
                .entry(stream.to_string())
                .or_default()
                .push(Arc::new(mirror));
        }
    }

    pub(crate) fn feed(&self, event: Event) {
        if self.tx.send(event).is_ok() {
            self.fed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 等待此刻之前投递的事件全部处理完；后台任务已停止时立即返回
    pub async fn settle(&self) {
        let target = self.fed.load(Ordering::SeqCst);
        let mut rx = self.processed.clone();
        while *rx.borrow_and_update() < target {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn dispatch(registry: &RwLock<Registry>, event: &Event, output: &Emitter) {
    let (triggers, mirrors) = match registry.read() {
        Ok(reg) => (
            reg.triggers.get(&event.kind).cloned().unwrap_or_default(),
            event
                .stream_name()
                .and_then(|name| reg.mirrors.get(name).cloned())
                .unwrap_or_default(),
        ),
        Err(_) => return,
    };

    for trigger in triggers {
        if catch_unwind(AssertUnwindSafe(|| trigger(event, output))).is_err() {
            tracing::error!(kind = ?event.kind, "guardian trigger panicked");
        }
    }

    if let Some(chunk) = event.stream_chunk() {
        for mirror in mirrors {
            if catch_unwind(AssertUnwindSafe(|| mirror(chunk, event, output))).is_err() {
                tracing::error!("guardian stream mirror panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;
    use serde_json::json;
    use std::sync::Mutex;

    fn setup() -> (Emitter, Arc<AsyncGuardian>, CollectingSink, CancellationToken) {
        let sink = CollectingSink::new();
        let emitter = Emitter::new("c1", Arc::new(sink.clone()));
        let cancel = CancellationToken::new();
        let guardian = AsyncGuardian::spawn(emitter.detached(), cancel.clone());
        emitter.attach_guardian(guardian.clone());
        (emitter, guardian, sink, cancel)
    }

    #[tokio::test]
    async fn test_trigger_reemits_without_loop() {
        let (emitter, guardian, sink, cancel) = setup();
        guardian.register_event_trigger(EventKind::ToolCallDone, |event, out| {
            out.emit(EventKind::Structured, json!({ "seen": event.seq }));
        });
        // Structured 上的触发器不应被 Guardian 自己发出的事件触发
        let loops = Arc::new(Mutex::new(0));
        let counter = loops.clone();
        guardian.register_event_trigger(EventKind::Structured, move |_, _| {
            *counter.lock().unwrap() += 1;
        });

        emitter.emit(EventKind::ToolCallDone, json!({}));
        guardian.settle().await;

        let structured = sink.of_kind(EventKind::Structured);
        assert_eq!(structured.len(), 1);
        assert_eq!(structured[0].content["seen"], 0);
        assert_eq!(*loops.lock().unwrap(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stream_mirror_filters_by_name() {
        let (emitter, guardian, _sink, cancel) = setup();
        let mirrored = Arc::new(Mutex::new(String::new()));
        let buf = mirrored.clone();
        guardian.register_stream_mirror("stdout", move |chunk, _, _| {
            buf.lock().unwrap().push_str(chunk);
        });

        emitter.stream("stdout", "hello ");
        emitter.stream("stderr", "ignored");
        emitter.stream("stdout", "world");
        guardian.settle().await;

        assert_eq!(mirrored.lock().unwrap().as_str(), "hello world");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_panicking_trigger_is_contained() {
        let (emitter, guardian, sink, cancel) = setup();
        guardian.register_event_trigger(EventKind::Info, |_, _| panic!("boom"));
        guardian.register_event_trigger(EventKind::Info, |_, out| {
            out.emit(EventKind::Structured, json!({ "ok": true }));
        });

        emitter.info("x");
        emitter.info("y");
        guardian.settle().await;

        assert_eq!(sink.of_kind(EventKind::Structured).len(), 2);
        cancel.cancel();
    }
}
