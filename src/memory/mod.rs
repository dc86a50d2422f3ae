//! 记忆：任务执行历史（时间线）与用户交互条目

pub mod interaction;
pub mod timeline;

pub use interaction::{InteractionStage, UserInteraction};
pub use timeline::{Timeline, TimelineEntry, TimelineItem};
