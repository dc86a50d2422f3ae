//! 审阅建议：任务审阅与工具审阅是两套独立的取值，不合并
//!
//! 审阅方 feed 的参数形如 `{"suggestion": "...", "extra_prompt": "...", ...}`。
//! 空参数（YOLO 默认 / 未填写）按 continue 处理，无法识别的取值由调用方告警后按 continue 处理。

use serde_json::{json, Map, Value};

use crate::endpoint::Params;

fn suggestion_of(params: &Params) -> String {
    params
        .get("suggestion")
        .and_then(|v| v.as_str())
        .unwrap_or("continue")
        .trim()
        .to_ascii_lowercase()
}

fn string_field(params: &Params, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| params.get(*k).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// 任务审阅门
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReviewSuggestion {
    Continue,
    /// 结果不准确，带补充说明重跑本任务
    Inaccurate { extra_prompt: String },
    /// 截断本任务之后的兄弟任务
    End,
    /// 动态重新规划：新任务作为本任务的子任务注入
    AdjustPlan { extra_prompt: String },
    Unknown(String),
}

impl TaskReviewSuggestion {
    pub fn from_params(params: &Params) -> Self {
        let extra_prompt = string_field(params, &["extra_prompt", "reason"]);
        match suggestion_of(params).as_str() {
            "" | "continue" => Self::Continue,
            "inaccurate" => Self::Inaccurate { extra_prompt },
            "end" => Self::End,
            "adjust_plan" | "adjust-plan" => Self::AdjustPlan { extra_prompt },
            other => Self::Unknown(other.to_string()),
        }
    }

    /// 审阅材料中给前端的可选项
    pub fn selectors() -> Value {
        json!([
            { "value": "continue", "prompt": "结果符合预期，继续执行" },
            { "value": "inaccurate", "prompt": "结果不准确，补充说明后重跑" },
            { "value": "end", "prompt": "到此为止，跳过剩余同级任务" },
            { "value": "adjust_plan", "prompt": "调整计划，为当前任务追加子任务" },
        ])
    }
}

/// 工具审阅门
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReviewSuggestion {
    Continue,
    /// 换一个工具，回到决策循环
    WrongTool {
        suggested_tool: Option<String>,
        extra_prompt: String,
    },
    /// 用 `suggestion_params` 覆盖参数后执行
    WrongParams {
        suggestion_params: Map<String, Value>,
        extra_prompt: String,
    },
    Unknown(String),
}

impl ToolReviewSuggestion {
    pub fn from_params(params: &Params) -> Self {
        let extra_prompt = string_field(params, &["extra_prompt", "reason"]);
        match suggestion_of(params).as_str() {
            "" | "continue" => Self::Continue,
            "wrong_tool" | "wrong-tool" => {
                let tool = string_field(params, &["suggestion_tool", "tool"]);
                Self::WrongTool {
                    suggested_tool: (!tool.is_empty()).then_some(tool),
                    extra_prompt,
                }
            }
            "wrong_params" | "wrong-params" => {
                let suggestion_params = match params.get("suggestion_params") {
                    Some(Value::Object(m)) => m.clone(),
                    Some(Value::String(s)) => serde_json::from_str::<Map<String, Value>>(s)
                        .unwrap_or_default(),
                    _ => Map::new(),
                };
                Self::WrongParams {
                    suggestion_params,
                    extra_prompt,
                }
            }
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn selectors() -> Value {
        json!([
            { "value": "continue", "prompt": "同意调用" },
            { "value": "wrong_tool", "prompt": "工具选择不当" },
            { "value": "wrong_params", "prompt": "参数不当，填写 suggestion_params 覆盖" },
        ])
    }
}
