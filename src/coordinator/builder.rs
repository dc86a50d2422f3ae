//! 协调器构建器：统一组装 AI、工具、检查点、事件与同意策略

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use crate::config::{AppConfig, CheckpointBackend};
use crate::coordinator::Coordinator;
use crate::core::{OrchestratorError, Result, SequenceGenerator};
use crate::endpoint::{
    AgreeConfig, AgreeResolver, EndpointManager, ReviewGate, RiskControl,
};
use crate::events::{AsyncGuardian, Emitter, Event, EventKind, EventSink, TracingSink};
use crate::llm::{AiCallback, AiInvoker, RetryPolicy};
use crate::memory::Timeline;
use crate::task::TaskServices;
use crate::tools::{IntervalReviewer, OutputLimiter, Tool, ToolCaller, ToolRegistry};

type Trigger = Box<dyn Fn(&Event, &Emitter) + Send + Sync>;
type Mirror = Box<dyn Fn(&str, &Event, &Emitter) + Send + Sync>;

/// 构建器；`build` 需在 tokio 运行时内调用
pub struct CoordinatorBuilder {
    config: AppConfig,
    id: Option<String>,
    ai: Option<Arc<dyn AiCallback>>,
    tools: Arc<ToolRegistry>,
    sink: Arc<dyn EventSink>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    risk: Option<Arc<dyn RiskControl>>,
    interval_reviewer: Option<Arc<dyn IntervalReviewer>>,
    cancel: CancellationToken,
    triggers: Vec<(EventKind, Trigger)>,
    mirrors: Vec<(String, Mirror)>,
}

impl CoordinatorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            id: None,
            ai: None,
            tools: Arc::new(ToolRegistry::new()),
            sink: Arc::new(TracingSink),
            checkpoints: None,
            risk: None,
            interval_reviewer: None,
            cancel: CancellationToken::new(),
            triggers: Vec::new(),
            mirrors: Vec::new(),
        }
    }

    /// 固定协调器 id；恢复时必须与崩溃前一致
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiCallback>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 不指定时按 `[checkpoint] backend` 创建
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_risk_control(mut self, risk: Arc<dyn RiskControl>) -> Self {
        self.risk = Some(risk);
        self
    }

    /// 运行中工具的周期审阅方，间隔取 `[tools] interval_review_secs`
    pub fn with_interval_reviewer(mut self, reviewer: Arc<dyn IntervalReviewer>) -> Self {
        self.interval_reviewer = Some(reviewer);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_trigger(
        mut self,
        kind: EventKind,
        trigger: impl Fn(&Event, &Emitter) + Send + Sync + 'static,
    ) -> Self {
        self.triggers.push((kind, Box::new(trigger)));
        self
    }

    pub fn with_stream_mirror(
        mut self,
        stream: &str,
        mirror: impl Fn(&str, &Event, &Emitter) + Send + Sync + 'static,
    ) -> Self {
        self.mirrors.push((stream.to_string(), Box::new(mirror)));
        self
    }

    fn build_checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>> {
        if let Some(store) = &self.checkpoints {
            return Ok(store.clone());
        }
        Ok(match self.config.checkpoint.backend {
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
            CheckpointBackend::Sqlite => {
                Arc::new(SqliteCheckpointStore::open(&self.config.checkpoint.db_path)?)
            }
        })
    }

    pub fn build(self) -> Result<Coordinator> {
        let ai = self.ai.clone().ok_or_else(|| {
            OrchestratorError::ConfigError("no AI callback configured".to_string())
        })?;
        let checkpoints = self.build_checkpoint_store()?;
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let config = self.config;

        let emitter = Emitter::new(&id, self.sink);
        let guardian_cancel = self.cancel.child_token();
        let guardian = AsyncGuardian::spawn(emitter.detached(), guardian_cancel.clone());
        for (kind, trigger) in self.triggers {
            guardian.register_event_trigger(kind, trigger);
        }
        for (stream, mirror) in self.mirrors {
            guardian.register_stream_mirror(&stream, mirror);
        }
        emitter.attach_guardian(guardian.clone());

        let ids = Arc::new(SequenceGenerator::new());
        let endpoints = EndpointManager::new(ids.clone(), self.cancel.clone());
        let agree = Arc::new(AgreeResolver::new(
            AgreeConfig::from(&config.agree),
            self.risk,
            checkpoints.clone(),
            &id,
        ));
        let gate = Arc::new(ReviewGate::new(
            endpoints.clone(),
            agree,
            checkpoints.clone(),
            ids.clone(),
            self.cancel.clone(),
        ));
        let invoker = Arc::new(AiInvoker::new(
            ai,
            checkpoints.clone(),
            ids.clone(),
            emitter.clone(),
            RetryPolicy {
                attempts: config.coordinator.ai_retry,
                backoff: config.coordinator.retry_backoff(),
            },
            self.cancel.clone(),
        ));
        let mut caller = ToolCaller::new(
            emitter.clone(),
            gate.clone(),
            checkpoints.clone(),
            ids.clone(),
            OutputLimiter::new(config.tools.output_limit_bytes, config.tools.spill_dir()),
            config.tools.tool_timeout(),
            self.cancel.clone(),
        );
        if let Some(reviewer) = self.interval_reviewer {
            caller = caller.with_interval_review(reviewer, config.tools.interval_review());
        }
        let caller = Arc::new(caller);
        let timeline = Arc::new(
            Timeline::new(&config.timeline, ids.clone())
                .with_ai(invoker.clone())
                .with_emitter(emitter.clone()),
        );

        tracing::info!(
            coordinator = %id,
            policy = ?config.agree.policy,
            tools = self.tools.tool_names().len(),
            "coordinator built"
        );

        let services = TaskServices {
            ai: invoker,
            tools: self.tools,
            caller,
            gate,
            timeline,
            ids,
            emitter,
            config: config.coordinator.clone(),
        };
        Ok(Coordinator::new(
            id,
            config,
            services,
            checkpoints,
            endpoints,
            guardian,
            guardian_cancel,
            self.cancel,
        ))
    }
}
