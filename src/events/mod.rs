//! 事件：结构化事件记录、外部 Sink、按协调器串行化的发射器与异步 Guardian
//!
//! - **types**: Event / EventKind 与常用 Sink
//! - **emitter**: 单互斥锁保证发射顺序即 Sink 观察顺序；处理器栈给事件打标签
//! - **guardian**: 旁路观察全部事件，按类型触发回调或镜像指定流，不阻塞主路径

pub mod emitter;
pub mod guardian;
pub mod types;

pub use emitter::Emitter;
pub use guardian::{AsyncGuardian, EventTrigger, StreamMirror};
pub use types::{ChannelSink, CollectingSink, Event, EventKind, EventSink, TracingSink};
