//! 审阅门：一次「挂起 → 外部决定 → 恢复」的完整流程
//!
//! 顺序固定：分配序号 → 建 checkpoint 并写请求 → 建端点 → 发审阅事件 →
//! 按同意策略等待（释放后写 checkpoint 响应）→ 发释放事件。
//! 工具审阅、任务审阅和用户交互共用这一流程，只是事件类型和材料不同。

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::core::{OrchestratorError, Result, SequenceGenerator};
use crate::endpoint::{AgreeOutcome, AgreeResolver, EndpointManager, Params, ReleaseSource};
use crate::events::{Emitter, EventKind};

/// 一次挂起请求
pub struct Suspension {
    pub kind: CheckpointKind,
    /// 审阅事件类型
    pub event: EventKind,
    /// 写入 checkpoint 的请求快照
    pub request: Value,
    /// 给审阅方的材料（会补上端点 id）
    pub materials: Value,
    /// YOLO / 超时放行时使用的参数
    pub defaults: Params,
}

pub struct ReviewGate {
    endpoints: Arc<EndpointManager>,
    agree: Arc<AgreeResolver>,
    checkpoints: Arc<dyn CheckpointStore>,
    ids: Arc<SequenceGenerator>,
    cancel: CancellationToken,
}

impl ReviewGate {
    pub fn new(
        endpoints: Arc<EndpointManager>,
        agree: Arc<AgreeResolver>,
        checkpoints: Arc<dyn CheckpointStore>,
        ids: Arc<SequenceGenerator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            endpoints,
            agree,
            checkpoints,
            ids,
            cancel,
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }

    /// 挂起直到被释放；取消时发 error 事件并返回 `Cancelled`
    pub async fn suspend(&self, emitter: &Emitter, suspension: Suspension) -> Result<AgreeOutcome> {
        let coordinator_id = emitter.coordinator_id().to_string();
        let seq = self.ids.next();
        let cp = self
            .checkpoints
            .get_or_create(&coordinator_id, seq, suspension.kind)
            .await?;

        let endpoint = self.endpoints.create_endpoint_with_seq(seq);
        endpoint.set_default_params(suspension.defaults);

        let mut materials = match suspension.materials {
            Value::Object(map) => map,
            other => {
                let mut map = Params::new();
                map.insert("materials".into(), other);
                map
            }
        };
        materials.insert("id".into(), json!(endpoint.id()));
        materials.insert("seq".into(), json!(seq));
        let materials = Value::Object(materials);
        endpoint.set_review_materials(materials.clone());

        if !cp.finished {
            self.checkpoints
                .submit_request(
                    &coordinator_id,
                    seq,
                    suspension.request,
                    Some(materials.clone()),
                )
                .await?;
        }
        endpoint.set_checkpoint(cp);
        emitter.emit(suspension.event, materials);

        let outcome = self.agree.resolve(&endpoint, &self.cancel).await?;
        emitter.emit(
            EventKind::InteractiveRelease,
            json!({
                "id": endpoint.id(),
                "seq": seq,
                "params": outcome.params,
                "source": outcome.source,
            }),
        );
        if outcome.source == ReleaseSource::Cancelled {
            let err = OrchestratorError::Cancelled;
            emitter.error(&err);
            return Err(err);
        }
        Ok(outcome)
    }
}
