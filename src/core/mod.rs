//! 核心层：错误分类与恢复、序号生成

pub mod error;
pub mod recovery;
pub mod sequence;

pub use error::{ErrorClass, OrchestratorError, RecoveryAction, Result};
pub use recovery::RecoveryEngine;
pub use sequence::{SequenceGenerator, SEQUENCE_START};
