//! Echo 工具（演示与测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolContext};

/// Echo 工具：把文本写到 stdout 并原样返回
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Params: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string", "description": "text to echo" } },
            "required": ["text"]
        })
    }

    async fn invoke(&self, params: Value, ctx: ToolContext) -> Result<Value, String> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        ctx.stdout.write_line(text);
        Ok(json!({ "text": text }))
    }
}
