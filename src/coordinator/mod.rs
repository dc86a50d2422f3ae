//! 协调器：持有事件发射器与 AI 调用链，把用户目标展开为任务树并深度优先执行
//!
//! - **builder**: 组装各组件
//! - **runtime**: 计划、遍历、任务审阅与重新规划

pub mod builder;
pub mod runtime;

pub use builder::CoordinatorBuilder;
pub use runtime::{Coordinator, CoordinatorHandle};
