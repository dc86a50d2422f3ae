//! 错误恢复引擎
//!
//! 根据 OrchestratorError 返回 RecoveryAction：可重试的错误把失败原因折叠进下一轮提示，
//! 其余直接终止。

use crate::core::{OrchestratorError, RecoveryAction};

const RETRY_SECTION: &str = r#"# Error Handling
Note that your previous response encountered an error. Here's the failure reason:
{reason}

Please avoid making the same mistake. Respond with a single JSON object in the format
{"@action": "...", ...}
"#;

/// 事务重试时的恢复决策
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &OrchestratorError) -> RecoveryAction {
        if err.is_retryable() {
            RecoveryAction::RetryWithPrompt(err.to_string())
        } else {
            RecoveryAction::Abort
        }
    }

    /// 在原提示后追加「上次失败原因」段落
    pub fn fold_retry_reason(prompt: &str, reason: &str) -> String {
        format!("{prompt}\n\n{}", RETRY_SECTION.replace("{reason}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = OrchestratorError::JsonParseError("invalid json".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("invalid json")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_non_retryable_aborts() {
        let engine = RecoveryEngine::new();
        let err = OrchestratorError::ToolNotFound("fake_tool".to_string());
        assert_eq!(engine.handle(&err), RecoveryAction::Abort);
        assert_eq!(engine.handle(&OrchestratorError::Cancelled), RecoveryAction::Abort);
    }

    #[test]
    fn test_fold_retry_reason() {
        let prompt = RecoveryEngine::fold_retry_reason("base prompt", "missing field tool");
        assert!(prompt.starts_with("base prompt"));
        assert!(prompt.contains("# Error Handling"));
        assert!(prompt.contains("missing field tool"));
        assert!(prompt.contains("\"@action\""));
    }
}
