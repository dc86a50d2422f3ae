//! 工具参数校验与 call-tool 动作 Schema
//!
//! 参数按工具声明的 JSON Schema 校验（jsonschema）；call-tool 动作的结构由 schemars 生成，拼入提示词。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

/// call-tool 动作格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct CallToolAction {
    /// 固定为 "call-tool"
    #[serde(rename = "@action")]
    action: String,
    /// 工具名，必须是可用工具之一
    tool: String,
    /// 工具参数，需符合该工具的参数 schema
    params: Map<String, Value>,
}

/// call-tool 动作的 JSON Schema 字符串
pub fn call_tool_schema_json() -> String {
    let schema = schema_for!(CallToolAction);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 按 schema 校验参数，返回全部错误信息
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), Vec<String>> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| vec![format!("invalid tool schema: {err}")])?;
    if validator.is_valid(params) {
        return Ok(());
    }
    Err(validator
        .iter_errors(params)
        .map(|err| err.to_string())
        .collect())
}
