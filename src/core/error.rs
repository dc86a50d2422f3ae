//! 编排错误类型与恢复动作
//!
//! 错误分四类：解析/校验、瞬时调用失败、不可重试、协作方降级。
//! 与 RecoveryEngine 配合：根据 OrchestratorError 决定 RetryWithPrompt / Abort。

use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("No action found, expected one of [{expected}]")]
    NoActionFound { expected: String },

    #[error("Invalid params for tool '{tool}': {reason}")]
    InvalidToolParams { tool: String, reason: String },

    #[error("Plan error: {0}")]
    PlanError(String),

    #[error("AI call failed: {0}")]
    AiCallFailed(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// 由产生方显式标记为不可重试
    #[error("Non-retryable: {0}")]
    NonRetryable(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,

    /// 风控评分器 panic / 未设置，仅在同意策略内部流转
    #[error("Risk control skipped: {0}")]
    RiskControlSkipped(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 模型输出格式错误、工具参数不符合 schema
    Validation,
    /// AI 回调失败、工具超时
    Transient,
    /// 找不到工具、取消、持久化失败
    NonRetryable,
    /// 风控不可用
    Degraded,
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::JsonParseError(_)
            | Self::NoActionFound { .. }
            | Self::InvalidToolParams { .. }
            | Self::PlanError(_) => ErrorClass::Validation,
            Self::AiCallFailed(_) | Self::ToolExecutionFailed(_) | Self::ToolTimeout(_) => {
                ErrorClass::Transient
            }
            Self::ToolNotFound(_)
            | Self::NonRetryable(_)
            | Self::Checkpoint(_)
            | Self::ConfigError(_)
            | Self::Cancelled => ErrorClass::NonRetryable,
            Self::RiskControlSkipped(_) => ErrorClass::Degraded,
        }
    }

    /// AI 事务内是否值得再问一次模型
    ///
    /// 模型输出的解析错误也会重试（附带失败原因），工具参数校验失败不会。
    pub fn is_retryable(&self) -> bool {
        match self.class() {
            ErrorClass::Transient => true,
            ErrorClass::Validation => !matches!(self, Self::InvalidToolParams { .. }),
            ErrorClass::NonRetryable | ErrorClass::Degraded => false,
        }
    }

    /// 事件中使用的短标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JsonParseError(_) => "json_parse_error",
            Self::NoActionFound { .. } => "no_action_found",
            Self::InvalidToolParams { .. } => "invalid_tool_params",
            Self::PlanError(_) => "plan_error",
            Self::AiCallFailed(_) => "ai_call_failed",
            Self::ToolExecutionFailed(_) => "tool_execution_failed",
            Self::ToolTimeout(_) => "tool_timeout",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::NonRetryable(_) => "non_retryable",
            Self::Checkpoint(_) => "checkpoint",
            Self::ConfigError(_) => "config_error",
            Self::Cancelled => "cancelled",
            Self::RiskControlSkipped(_) => "risk_control_skipped",
        }
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(e: config::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Checkpoint(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 把失败原因注入下一轮提示，让模型重试
    RetryWithPrompt(String),
    /// 终止当前事务，错误上抛
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            OrchestratorError::AiCallFailed("x".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            OrchestratorError::ToolNotFound("x".into()).class(),
            ErrorClass::NonRetryable
        );
        assert!(OrchestratorError::JsonParseError("x".into()).is_retryable());
        assert!(!OrchestratorError::InvalidToolParams {
            tool: "t".into(),
            reason: "r".into()
        }
        .is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
    }
}
