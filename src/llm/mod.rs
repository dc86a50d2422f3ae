//! AI 回调抽象与调用器
//!
//! - **traits**: `AiCallback`、正文 / 推理双流响应
//! - **invoker**: checkpoint 回放、取消、事务重试
//! - **mock**: 按请求用途路由的 Mock

pub mod invoker;
pub mod mock;
pub mod traits;

pub use invoker::{AiInvoker, RetryPolicy};
pub use mock::MockAi;
pub use traits::{AiCallback, AiRequest, AiResponse, AiResponseWriter};
