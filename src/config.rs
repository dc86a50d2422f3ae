//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORCHESTRA__*` 覆盖
//! （双下划线表示嵌套，如 `ORCHESTRA__AGREE__POLICY=yolo`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::endpoint::AgreePolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub coordinator: CoordinatorSection,
    pub agree: AgreeSection,
    pub timeline: TimelineSection,
    pub tools: ToolsSection,
    pub checkpoint: CheckpointSection,
}

/// [coordinator] 段：AI 事务重试与任务循环上限
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    /// 单个 AI 事务最多尝试次数
    #[serde(default = "default_ai_retry")]
    pub ai_retry: usize,
    /// 两次尝试之间的固定退避（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 单个任务决策循环的最大轮数
    #[serde(default = "default_max_task_iterations")]
    pub max_task_iterations: usize,
    /// 审阅判定 inaccurate 后最多重跑次数
    #[serde(default = "default_max_task_rerun")]
    pub max_task_rerun: usize,
    /// 任务结束后是否单独请求摘要
    #[serde(default = "default_true")]
    pub task_summary: bool,
}

fn default_ai_retry() -> usize {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_task_iterations() -> usize {
    10
}

fn default_max_task_rerun() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            ai_retry: default_ai_retry(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_task_iterations: default_max_task_iterations(),
            max_task_rerun: default_max_task_rerun(),
            task_summary: true,
        }
    }
}

impl CoordinatorSection {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// [agree] 段：审阅端点的自动放行策略
#[derive(Debug, Clone, Deserialize)]
pub struct AgreeSection {
    #[serde(default)]
    pub policy: AgreePolicy,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ai_score_threshold")]
    pub ai_score_threshold: f64,
    #[serde(default = "default_ai_release_delay_ms")]
    pub ai_release_delay_ms: u64,
    #[serde(default = "default_risk_timeout_secs")]
    pub risk_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_ai_score_threshold() -> f64 {
    0.7
}

fn default_ai_release_delay_ms() -> u64 {
    3000
}

fn default_risk_timeout_secs() -> u64 {
    20
}

impl Default for AgreeSection {
    fn default() -> Self {
        Self {
            policy: AgreePolicy::Manual,
            interval_secs: default_interval_secs(),
            ai_score_threshold: default_ai_score_threshold(),
            ai_release_delay_ms: default_ai_release_delay_ms(),
            risk_timeout_secs: default_risk_timeout_secs(),
        }
    }
}

/// [timeline] 段：压缩阈值（按条目数）
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineSection {
    /// 未压缩条目超过此数时 shrink 最旧的一条
    #[serde(default = "default_full_memory_count")]
    pub full_memory_count: usize,
    /// 总条目超过此数时 reduce 前缀；未设置时为 full_memory_count 的 3 倍
    pub max_timeline_count: Option<usize>,
}

fn default_full_memory_count() -> usize {
    10
}

impl Default for TimelineSection {
    fn default() -> Self {
        Self {
            full_memory_count: default_full_memory_count(),
            max_timeline_count: None,
        }
    }
}

impl TimelineSection {
    pub fn max_timeline_count(&self) -> usize {
        self.max_timeline_count
            .unwrap_or(self.full_memory_count * 3)
            .max(self.full_memory_count + 1)
    }
}

/// [tools] 段：工具超时与大输出溢出
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// stdout / stderr / 结果各自超过此字节数时截断并写溢出文件
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    pub spill_dir: Option<PathBuf>,
    /// 设置了周期审阅方时，运行中工具的审阅间隔（秒）
    #[serde(default = "default_interval_review_secs")]
    pub interval_review_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_output_limit_bytes() -> usize {
    10 * 1024
}

fn default_interval_review_secs() -> u64 {
    20
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            output_limit_bytes: default_output_limit_bytes(),
            spill_dir: None,
            interval_review_secs: default_interval_review_secs(),
        }
    }
}

impl ToolsSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn interval_review(&self) -> Duration {
        Duration::from_secs(self.interval_review_secs)
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.spill_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("orchestra-spill"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [checkpoint] 段：持久化后端
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("workspace/checkpoints.db")
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::Memory,
            db_path: default_db_path(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ORCHESTRA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORCHESTRA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORCHESTRA")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
