//! 同意策略：挂起的审阅端点在没有人工输入时如何被释放
//!
//! 风控评分器是外部协作方，永远不允许阻塞或拖垮策略：
//! panic、报错、超时、未设置都折叠成 `RiskVerdict::Skipped`，策略随之降级到人工 / 超时等待。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::AgreeSection;
use crate::core::Result;
use crate::endpoint::{Endpoint, Params};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgreePolicy {
    /// 阻塞到人工 feed
    #[default]
    Manual,
    /// 立即以默认参数放行
    Yolo,
    /// 等待固定间隔后放行
    Auto,
    /// 风控评分达到阈值时延迟放行，否则人工
    Ai,
    /// 同 Ai，但风控不可用或未达阈值时按 Auto 间隔兜底
    AiAuto,
}

impl AgreePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "manual" => Some(Self::Manual),
            "yolo" => Some(Self::Yolo),
            "auto" => Some(Self::Auto),
            "ai" => Some(Self::Ai),
            "ai-auto" | "aiauto" => Some(Self::AiAuto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgreeConfig {
    pub policy: AgreePolicy,
    /// Auto / AiAuto 的等待间隔
    pub interval: Duration,
    /// 评分 >= 阈值时自动放行
    pub ai_score_threshold: f64,
    /// 自动放行前的刻意延迟，让并发的人工输入有机会先到
    pub ai_release_delay: Duration,
    pub risk_timeout: Duration,
}

impl Default for AgreeConfig {
    fn default() -> Self {
        Self::from(&AgreeSection::default())
    }
}

impl From<&AgreeSection> for AgreeConfig {
    fn from(section: &AgreeSection) -> Self {
        Self {
            policy: section.policy,
            interval: Duration::from_secs(section.interval_secs),
            ai_score_threshold: section.ai_score_threshold,
            ai_release_delay: Duration::from_millis(section.ai_release_delay_ms),
            risk_timeout: Duration::from_secs(section.risk_timeout_secs),
        }
    }
}

/// 风控评分结果；分数越高越可以放行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub reason: String,
}

/// 可插拔的风控评分器，入参是待审阅材料
#[async_trait]
pub trait RiskControl: Send + Sync {
    async fn assess(&self, materials: &Value) -> std::result::Result<RiskAssessment, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Assessed(RiskAssessment),
    /// 未启用 / panic / 报错 / 超时
    Skipped(String),
}

/// 调用风控；任何失败都转为 Skipped，绝不向上传播
pub async fn evaluate_risk(
    risk: Option<&Arc<dyn RiskControl>>,
    materials: &Value,
    timeout: Duration,
) -> RiskVerdict {
    let Some(risk) = risk else {
        return RiskVerdict::Skipped("risk control not enabled".to_string());
    };
    let call = AssertUnwindSafe(risk.assess(materials)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => RiskVerdict::Skipped("risk control timed out".to_string()),
        Ok(Err(_)) => {
            tracing::warn!("risk control panicked, treating as not enabled");
            RiskVerdict::Skipped("risk control panicked".to_string())
        }
        Ok(Ok(Err(e))) => RiskVerdict::Skipped(e),
        Ok(Ok(Ok(assessment))) if assessment.score.is_nan() => {
            RiskVerdict::Skipped("risk control returned NaN".to_string())
        }
        Ok(Ok(Ok(assessment))) => RiskVerdict::Assessed(assessment),
    }
}

/// 端点是如何被释放的
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseSource {
    Human,
    /// YOLO 或 Auto 超时
    Auto,
    RiskControl,
    /// 从已完成的 checkpoint 回放
    Replay,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgreeOutcome {
    pub params: Params,
    pub source: ReleaseSource,
    pub risk: Option<RiskAssessment>,
}

/// 按策略解析审阅端点，并在释放后写 checkpoint 响应
pub struct AgreeResolver {
    config: AgreeConfig,
    risk: Option<Arc<dyn RiskControl>>,
    checkpoints: Arc<dyn CheckpointStore>,
    coordinator_id: String,
}

impl AgreeResolver {
    pub fn new(
        config: AgreeConfig,
        risk: Option<Arc<dyn RiskControl>>,
        checkpoints: Arc<dyn CheckpointStore>,
        coordinator_id: &str,
    ) -> Self {
        Self {
            config,
            risk,
            checkpoints,
            coordinator_id: coordinator_id.to_string(),
        }
    }

    pub fn policy(&self) -> AgreePolicy {
        self.config.policy
    }

    /// 等待端点被释放
    ///
    /// 调用方应已写入 checkpoint 请求；本方法返回前写入响应（取消除外），
    /// 调用方随后再发 release 事件，保证「先 checkpoint 后事件」。
    pub async fn resolve(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<AgreeOutcome> {
        if let Some(cp) = endpoint.checkpoint() {
            if cp.finished {
                let params = cp
                    .response
                    .as_ref()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                tracing::info!(seq = cp.seq, "review replayed from checkpoint");
                endpoint.feed(params.clone());
                return Ok(AgreeOutcome {
                    params,
                    source: ReleaseSource::Replay,
                    risk: None,
                });
            }
        }

        // 端点每次审阅新建；从 0 开始等待，审阅事件发出后、进入此处前的 feed 不会丢失
        let seen = 0;
        let mut risk = None;
        let source = match self.config.policy {
            AgreePolicy::Yolo => {
                endpoint.release_with_default();
                ReleaseSource::Auto
            }
            AgreePolicy::Manual => self.wait_human(endpoint, seen, None, cancel).await,
            AgreePolicy::Auto => {
                self.wait_human(endpoint, seen, Some(self.config.interval), cancel)
                    .await
            }
            AgreePolicy::Ai | AgreePolicy::AiAuto => {
                let materials = endpoint.review_materials().unwrap_or(Value::Null);
                let verdict =
                    evaluate_risk(self.risk.as_ref(), &materials, self.config.risk_timeout).await;
                let fallback = match self.config.policy {
                    AgreePolicy::AiAuto => Some(self.config.interval),
                    _ => None,
                };
                match verdict {
                    RiskVerdict::Assessed(assessment)
                        if assessment.score >= self.config.ai_score_threshold =>
                    {
                        tracing::info!(score = assessment.score, "risk control allows auto release");
                        risk = Some(assessment);
                        self.race_delayed_release(endpoint, seen, cancel).await
                    }
                    RiskVerdict::Assessed(assessment) => {
                        tracing::info!(score = assessment.score, "risk control holds for review");
                        risk = Some(assessment);
                        self.wait_human(endpoint, seen, fallback, cancel).await
                    }
                    RiskVerdict::Skipped(reason) => {
                        tracing::debug!(%reason, "risk control skipped");
                        self.wait_human(endpoint, seen, fallback, cancel).await
                    }
                }
            }
        };

        let params = endpoint.params();
        if source != ReleaseSource::Cancelled {
            if let Some(cp) = endpoint.checkpoint() {
                self.checkpoints
                    .submit_response(&self.coordinator_id, cp.seq, Value::Object(params.clone()))
                    .await?;
            }
        }
        Ok(AgreeOutcome {
            params,
            source,
            risk,
        })
    }

    /// 等人工 feed；`timeout` 到期则以默认参数放行
    async fn wait_human(
        &self,
        endpoint: &Endpoint,
        seen: u64,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ReleaseSource {
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = endpoint.wait_after(seen) => {
                if cancel.is_cancelled() {
                    ReleaseSource::Cancelled
                } else {
                    ReleaseSource::Human
                }
            }
            _ = cancel.cancelled() => ReleaseSource::Cancelled,
            _ = deadline => {
                endpoint.release_with_default();
                ReleaseSource::Auto
            }
        }
    }

    async fn race_delayed_release(
        &self,
        endpoint: &Endpoint,
        seen: u64,
        cancel: &CancellationToken,
    ) -> ReleaseSource {
        tokio::select! {
            _ = endpoint.wait_after(seen) => ReleaseSource::Human,
            _ = cancel.cancelled() => ReleaseSource::Cancelled,
            _ = tokio::time::sleep(self.config.ai_release_delay) => {
                endpoint.release_with_default();
                ReleaseSource::RiskControl
            }
        }
    }
}
