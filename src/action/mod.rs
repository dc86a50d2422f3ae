//! Action 提取：从模型的自由文本输出中找出带 `@action` 判别字段的 JSON 对象
//!
//! - **scanner**: 括号匹配的增量 JSON 扫描器（模型常把 JSON 包在说明文字里）
//! - **action**: 提取结果的类型化访问器

pub mod action;
pub mod scanner;

pub use action::Action;
pub use scanner::{extract_action, extract_any_action, json_candidates, ActionScanner, DISCRIMINATOR};
