//! Checkpoint 持久化：挂起点与 AI 调用的请求/响应快照
//!
//! 以 (coordinator_id, seq) 为键；`finished` 的记录在重启后直接回放，不再询问模型或人。
//! - **store**: 记录类型、`CheckpointStore` trait、内存实现
//! - **sqlite**: rusqlite 实现（崩溃恢复）

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteCheckpointStore;
pub use store::{Checkpoint, CheckpointKind, CheckpointStore, MemoryCheckpointStore};
