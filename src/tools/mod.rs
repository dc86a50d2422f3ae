//! 工具：统一的调用 / 校验契约与调用器
//!
//! - **registry**: Tool trait、ToolContext、显式注册表
//! - **schema**: jsonschema 参数校验、call-tool 动作 Schema
//! - **output**: stdout / stderr 捕获与大输出溢出文件
//! - **caller**: 审阅 → 校验 → 执行的调用状态机，含运行中的周期审阅
//! - **echo**: 内置演示工具

pub mod caller;
pub mod echo;
pub mod output;
pub mod registry;
pub mod result;
pub mod schema;

pub use caller::{IntervalReviewer, ToolCallOutcome, ToolCaller};
pub use echo::EchoTool;
pub use output::{OutputLimiter, ToolOutput};
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use result::{ToolCallStatus, ToolExecutionData, ToolResult};
pub use schema::{call_tool_schema_json, validate_params};
