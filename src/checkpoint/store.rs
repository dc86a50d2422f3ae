//! Checkpoint 记录与存储抽象

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestratorError, Result};

/// 挂起点种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    Review,
    ToolCall,
    AiCall,
    Interaction,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::ToolCall => "tool-call",
            Self::AiCall => "ai-call",
            Self::Interaction => "interaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "review" => Some(Self::Review),
            "tool-call" => Some(Self::ToolCall),
            "ai-call" => Some(Self::AiCall),
            "interaction" => Some(Self::Interaction),
            _ => None,
        }
    }
}

/// 一条持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub coordinator_id: String,
    pub seq: i64,
    pub kind: CheckpointKind,
    pub request: Option<Value>,
    pub response: Option<Value>,
    pub review_materials: Option<Value>,
    pub finished: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(coordinator_id: &str, seq: i64, kind: CheckpointKind) -> Self {
        let now = Utc::now();
        Self {
            coordinator_id: coordinator_id.to_string(),
            seq,
            kind,
            request: None,
            response: None,
            review_materials: None,
            finished: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 持久化协作方：唯一允许跨任务分支并发写的组件，实现必须内部串行化
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 读取已有记录，不存在则创建（原子）
    async fn get_or_create(
        &self,
        coordinator_id: &str,
        seq: i64,
        kind: CheckpointKind,
    ) -> Result<Checkpoint>;

    async fn get(&self, coordinator_id: &str, seq: i64) -> Result<Option<Checkpoint>>;

    /// 写入请求快照与审阅材料（挂起前）
    async fn submit_request(
        &self,
        coordinator_id: &str,
        seq: i64,
        request: Value,
        review_materials: Option<Value>,
    ) -> Result<()>;

    /// 写入响应快照并标记 finished（释放后）
    async fn submit_response(&self, coordinator_id: &str, seq: i64, response: Value)
        -> Result<()>;

    /// seq 最大的未完成记录，即恢复点
    async fn latest_unfinished(&self, coordinator_id: &str) -> Result<Option<Checkpoint>>;

    /// 按 seq 升序列出
    async fn list(&self, coordinator_id: &str) -> Result<Vec<Checkpoint>>;
}

/// 内存实现（测试与不需要崩溃恢复的场景）
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<(String, i64), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, i64), Checkpoint>>> {
        self.records
            .lock()
            .map_err(|_| OrchestratorError::Checkpoint("store lock poisoned".to_string()))
    }
}

fn not_found(coordinator_id: &str, seq: i64) -> OrchestratorError {
    OrchestratorError::Checkpoint(format!("checkpoint {coordinator_id}/{seq} not found"))
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_or_create(
        &self,
        coordinator_id: &str,
        seq: i64,
        kind: CheckpointKind,
    ) -> Result<Checkpoint> {
        let mut records = self.lock()?;
        let cp = records
            .entry((coordinator_id.to_string(), seq))
            .or_insert_with(|| Checkpoint::new(coordinator_id, seq, kind));
        Ok(cp.clone())
    }

    async fn get(&self, coordinator_id: &str, seq: i64) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.get(&(coordinator_id.to_string(), seq)).cloned())
    }

    async fn submit_request(
        &self,
        coordinator_id: &str,
        seq: i64,
        request: Value,
        review_materials: Option<Value>,
    ) -> Result<()> {
        let mut records = self.lock()?;
        let cp = records
            .get_mut(&(coordinator_id.to_string(), seq))
            .ok_or_else(|| not_found(coordinator_id, seq))?;
        cp.request = Some(request);
        if review_materials.is_some() {
            cp.review_materials = review_materials;
        }
        cp.updated_at = Utc::now();
        Ok(())
    }

    async fn submit_response(
        &self,
        coordinator_id: &str,
        seq: i64,
        response: Value,
    ) -> Result<()> {
        let mut records = self.lock()?;
        let cp = records
            .get_mut(&(coordinator_id.to_string(), seq))
            .ok_or_else(|| not_found(coordinator_id, seq))?;
        cp.response = Some(response);
        cp.finished = true;
        cp.updated_at = Utc::now();
        Ok(())
    }

    async fn latest_unfinished(&self, coordinator_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .lock()?
            .values()
            .filter(|cp| cp.coordinator_id == coordinator_id && !cp.finished)
            .max_by_key(|cp| cp.seq)
            .cloned())
    }

    async fn list(&self, coordinator_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self
            .lock()?
            .values()
            .filter(|cp| cp.coordinator_id == coordinator_id)
            .cloned()
            .collect())
    }
}
