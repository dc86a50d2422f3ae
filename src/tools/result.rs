//! 工具调用结果

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次调用的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Succeeded,
    Failed,
    /// 被取消，结果中是截至取消时的部分输出
    Cancelled,
}

/// 工具执行捕获到的数据（各字段可能已被截断并指向溢出文件）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionData {
    pub stdout: String,
    pub stderr: String,
    pub result: Value,
}

/// 创建后不可变，只有两个 shrink 字段由时间线压缩回填
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: i64,
    pub call_tool_id: String,
    pub name: String,
    pub description: String,
    pub params: Value,
    pub success: bool,
    pub status: ToolCallStatus,
    pub data: ToolExecutionData,
    pub error: String,
    pub shrink_result: Option<String>,
    pub shrink_similar_result: Option<String>,
}

impl ToolResult {
    /// 参数校验失败等未执行的结果
    pub fn failed(id: i64, name: &str, params: Value, error: impl Into<String>) -> Self {
        Self {
            id,
            call_tool_id: String::new(),
            name: name.to_string(),
            description: String::new(),
            params,
            success: false,
            status: ToolCallStatus::Failed,
            data: ToolExecutionData::default(),
            error: error.into(),
            shrink_result: None,
            shrink_similar_result: None,
        }
    }

    /// 同一工具、同一参数
    pub fn same_call(&self, other: &ToolResult) -> bool {
        self.name == other.name && self.params == other.params
    }

    /// 时间线中的原始渲染
    pub fn render(&self) -> String {
        let mut out = format!(
            "tool: {} ({})\nparams: {}\nstatus: {}",
            self.name,
            self.description,
            self.params,
            match self.status {
                ToolCallStatus::Succeeded => "succeeded",
                ToolCallStatus::Failed => "failed",
                ToolCallStatus::Cancelled => "cancelled",
            }
        );
        if !self.data.stdout.is_empty() {
            out.push_str(&format!("\nstdout: {}", self.data.stdout));
        }
        if !self.data.stderr.is_empty() {
            out.push_str(&format!("\nstderr: {}", self.data.stderr));
        }
        if !self.data.result.is_null() {
            out.push_str(&format!("\nresult: {}", self.data.result));
        }
        if !self.error.is_empty() {
            out.push_str(&format!("\nerror: {}", self.error));
        }
        out
    }
}
