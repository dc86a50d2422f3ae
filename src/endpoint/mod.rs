//! 端点：可被外部释放的挂起点
//!
//! - **manager**: Endpoint（watch 通道实现的广播条件变量）与 EndpointManager
//! - **agree**: 同意策略（Manual / YOLO / Auto / AI / AIAuto）与风控评分
//! - **gate**: 审阅门，串起 checkpoint、端点、事件与同意策略

pub mod agree;
pub mod gate;
pub mod manager;

pub use agree::{
    evaluate_risk, AgreeConfig, AgreeOutcome, AgreePolicy, AgreeResolver, ReleaseSource,
    RiskAssessment, RiskControl, RiskVerdict,
};
pub use gate::{ReviewGate, Suspension};
pub use manager::{Endpoint, EndpointManager, Params};
