//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / invoke），
//! 由显式的 ToolRegistry 按名注册、注销与查找；注册表在构造协调器时传入，不存在进程级全局表。

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolOutput;

/// 单次调用的上下文：捕获的输出流与可取消令牌
pub struct ToolContext {
    pub call_tool_id: String,
    pub stdout: ToolOutput,
    pub stderr: ToolOutput,
    pub cancel: CancellationToken,
}

/// 工具 trait：名称、描述（供模型理解）、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应 call-tool 动作的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；调用前按此校验，不通过则不执行
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 是否需要经过工具审阅门
    fn requires_review(&self) -> bool {
        true
    }

    /// 执行；返回值进入 ToolResult.data.result
    async fn invoke(&self, params: Value, ctx: ToolContext) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册；同名工具会被替换
    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut tools) = self.tools.write() {
            if tools.insert(name.clone(), tool).is_some() {
                tracing::debug!(tool = %name, "tool replaced");
            }
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .map(|mut tools| tools.remove(name).is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().ok().and_then(|tools| tools.get(name).cloned())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .read()
            .map(|tools| tools.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的工具清单
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .read()
            .map(|tools| {
                tools
                    .iter()
                    .map(|(name, tool)| (name.clone(), tool.description().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 工具 schema JSON（含参数 schema），拼入提示词
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .read()
            .map(|tools| {
                tools
                    .iter()
                    .map(|(name, tool)| {
                        serde_json::json!({
                            "name": name,
                            "description": tool.description(),
                            "parameters": tool.parameters_schema()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.get("echo").is_some());
        assert_eq!(registry.tool_names(), vec!["echo"]);
        assert!(registry.to_schema_json().contains("\"text\""));

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ToolRegistry::new();
        let b = ToolRegistry::new();
        a.register(EchoTool);
        assert!(b.get("echo").is_none());
    }
}
