//! Orchestra - Rust 智能体任务编排引擎
//!
//! 把一个用户目标展开为任务树，逐个子任务驱动「规划 → 执行 → 审阅」循环；
//! 任何任务都可以挂起等待外部决定，挂起点写入 checkpoint，进程重启后可回放。
//!
//! 模块划分：
//! - **action**: 从模型自由文本中提取带 `@action` 的 JSON 动作
//! - **checkpoint**: 挂起点 / AI 调用快照（内存与 SQLite）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **coordinator**: 构建器、任务树遍历、任务审阅与重新规划
//! - **core**: 错误分类、恢复决策、序号生成
//! - **endpoint**: 挂起点、同意策略与风控、审阅门
//! - **events**: 事件、Sink、发射器与 Guardian
//! - **llm**: AI 回调契约、可回放可取消的调用器、Mock
//! - **memory**: 时间线与 shrink / reduce 压缩
//! - **task**: 任务树、计划解析、决策循环
//! - **tools**: 工具契约、注册表、参数校验与调用器

pub mod action;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod endpoint;
pub mod events;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod task;
pub mod tools;

pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorHandle};
