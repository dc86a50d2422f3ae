//! Endpoint 与 EndpointManager
//!
//! 每个端点持有一个 `watch` 版本号：feed 更新参数后版本 +1 并广播，
//! 所有当前与之后的等待者都看到同一份参数。已释放的端点可以再次等待，
//! `wait` 阻塞到下一次 feed。管理器的取消令牌触发时，向所有端点强制 feed 空参数。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::core::SequenceGenerator;

/// 释放参数
pub type Params = Map<String, Value>;

#[derive(Default)]
struct EndpointState {
    params: Params,
    default_params: Params,
    review_materials: Option<Value>,
    checkpoint: Option<Checkpoint>,
}

/// 单个挂起点
pub struct Endpoint {
    id: String,
    seq: i64,
    state: Mutex<EndpointState>,
    version: watch::Sender<u64>,
}

impl Endpoint {
    fn new(id: String, seq: i64) -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            id,
            seq,
            state: Mutex::new(EndpointState::default()),
            version,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// 已被 feed 的次数
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn is_resolved(&self) -> bool {
        self.version() > 0
    }

    /// 释放：更新参数并广播；重复 feed 只是覆盖参数再广播一次
    pub fn feed(&self, params: Params) {
        self.state().params = params;
        self.version.send_modify(|v| *v += 1);
    }

    /// 以默认参数释放（YOLO / 超时）
    pub fn release_with_default(&self) {
        let params = self.state().default_params.clone();
        self.feed(params);
    }

    /// 参数深拷贝，等待者与 feed 方互不别名
    pub fn params(&self) -> Params {
        self.state().params.clone()
    }

    pub fn set_default_params(&self, params: Params) {
        self.state().default_params = params;
    }

    pub fn default_params(&self) -> Params {
        self.state().default_params.clone()
    }

    pub fn set_review_materials(&self, materials: Value) {
        self.state().review_materials = Some(materials);
    }

    pub fn review_materials(&self) -> Option<Value> {
        self.state().review_materials.clone()
    }

    pub fn set_checkpoint(&self, checkpoint: Checkpoint) {
        self.state().checkpoint = Some(checkpoint);
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.state().checkpoint.clone()
    }

    /// 阻塞到下一次 feed
    pub async fn wait(&self) {
        self.wait_after(self.version()).await
    }

    /// 阻塞到版本号超过 `seen`；先取版本再等待可以避免错过两者之间的 feed
    pub async fn wait_after(&self, seen: u64) {
        let mut rx = self.version.subscribe();
        loop {
            if *rx.borrow_and_update() > seen {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 超时返回 false
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let seen = self.version();
        tokio::time::timeout(timeout, self.wait_after(seen)).await.is_ok()
    }
}

/// 端点注册表；随取消令牌一起回收
pub struct EndpointManager {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    ids: Arc<SequenceGenerator>,
    cancel: CancellationToken,
}

impl EndpointManager {
    /// 创建管理器并启动取消监听任务（需在 tokio 运行时内调用）
    pub fn new(ids: Arc<SequenceGenerator>, cancel: CancellationToken) -> Arc<Self> {
        let manager = Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            ids,
            cancel: cancel.clone(),
        });
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(manager) = weak.upgrade() {
                manager.release_all();
            }
        });
        manager
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn create_endpoint(&self) -> Arc<Endpoint> {
        let seq = self.ids.next();
        self.create_endpoint_with_seq(seq)
    }

    /// 使用外部分配的序号创建端点（与 checkpoint 共用序号）
    pub fn create_endpoint_with_seq(&self, seq: i64) -> Arc<Endpoint> {
        let endpoint = Arc::new(Endpoint::new(uuid::Uuid::new_v4().to_string(), seq));
        if let Ok(mut map) = self.endpoints.write() {
            map.insert(endpoint.id().to_string(), endpoint.clone());
        }
        // 已取消的管理器不再产生会阻塞的端点
        if self.cancel.is_cancelled() {
            endpoint.feed(Params::new());
        }
        endpoint
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().ok().and_then(|map| map.get(id).cloned())
    }

    /// 按 id 释放；未知 id 返回 false
    pub fn feed(&self, id: &str, params: Params) -> bool {
        match self.get(id) {
            Some(endpoint) => {
                endpoint.feed(params);
                true
            }
            None => {
                tracing::warn!(endpoint = %id, "feed for unknown endpoint");
                false
            }
        }
    }

    /// 阻塞到下一次 feed；未知 id 立即返回 false
    ///
    /// 管理器已取消时立即返回：取消时的强制 feed 只有一次，之后开始的等待不会再被唤醒。
    pub async fn wait(&self, id: &str) -> bool {
        let Some(endpoint) = self.get(id) else {
            return false;
        };
        let seen = endpoint.version();
        tokio::select! {
            _ = endpoint.wait_after(seen) => {}
            _ = self.cancel.cancelled() => {}
        }
        true
    }

    /// 超时返回 false；管理器取消视为已释放
    pub async fn wait_timeout(&self, id: &str, timeout: Duration) -> bool {
        let Some(endpoint) = self.get(id) else {
            return false;
        };
        let seen = endpoint.version();
        let released = async {
            tokio::select! {
                _ = endpoint.wait_after(seen) => {}
                _ = self.cancel.cancelled() => {}
            }
        };
        tokio::time::timeout(timeout, released).await.is_ok()
    }

    pub fn get_params(&self, id: &str) -> Option<Params> {
        self.get(id).map(|endpoint| endpoint.params())
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 向所有端点强制 feed 空参数
    pub fn release_all(&self) {
        let endpoints: Vec<Arc<Endpoint>> = self
            .endpoints
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        tracing::info!(count = endpoints.len(), "releasing all endpoints");
        for endpoint in endpoints {
            endpoint.feed(Params::new());
        }
    }
}
