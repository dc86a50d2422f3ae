//! 可观测性：tracing 订阅器初始化（只由二进制入口调用）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖；重复初始化时静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
