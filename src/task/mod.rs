//! 任务：任务树、计划解析、审阅建议与决策循环
//!
//! - **tree**: arena 任务树，索引从根整体重算
//! - **plan**: `plan` 动作解析
//! - **review**: 任务审阅与工具审阅两套建议
//! - **prompts**: 提示模板
//! - **decision**: 叶子任务的决策循环

pub mod decision;
pub mod plan;
pub mod prompts;
pub mod review;
pub mod tree;

pub use decision::{outcome_label, TaskBrief, TaskReport, TaskServices};
pub use plan::{parse_replan, PlanSpec, SubtaskSpec, PLAN_ACTIONS};
pub use review::{TaskReviewSuggestion, ToolReviewSuggestion};
pub use tree::{TaskId, TaskNode, TaskOutcome, TaskStatus, TaskTree};
