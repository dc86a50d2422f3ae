//! 用户交互条目

use serde::{Deserialize, Serialize};

/// 交互发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionStage {
    BeforePlan,
    Review,
    FreeInput,
}

impl InteractionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforePlan => "before-plan",
            Self::Review => "review",
            Self::FreeInput => "free-input",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInteraction {
    pub id: i64,
    pub stage: InteractionStage,
    pub system_prompt: String,
    pub user_answer: String,
    pub shrink_result: Option<String>,
}

impl UserInteraction {
    pub fn render(&self) -> String {
        format!(
            "user interaction [{}]\nprompt: {}\nanswer: {}",
            self.stage.as_str(),
            self.system_prompt,
            self.user_answer
        )
    }
}
