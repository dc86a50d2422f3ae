//! Orchestra 演示入口
//!
//! 加载配置、初始化日志，用 Mock AI 与 echo 工具跑一遍完整的任务树；
//! 同意策略为 manual 时由一个后台任务自动回复 continue，模拟审阅方。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use orchestra::config::load_config;
use orchestra::endpoint::AgreePolicy;
use orchestra::events::{ChannelSink, EventKind};
use orchestra::llm::MockAi;
use orchestra::tools::EchoTool;
use orchestra::{observability, CoordinatorBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let goal = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "greet the user and report what was done".to_string());
    let config = load_config(config_path).context("Failed to load config")?;
    let manual = config.agree.policy == AgreePolicy::Manual;

    let (sink, mut events) = ChannelSink::new();
    let mut coordinator = CoordinatorBuilder::new(config)
        .with_ai(Arc::new(MockAi::demo()))
        .with_tool(EchoTool)
        .with_sink(Arc::new(sink))
        .build()
        .context("Failed to build coordinator")?;
    let handle = coordinator.handle();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.kind {
                EventKind::Stream => {}
                EventKind::TaskReviewRequire
                | EventKind::ToolUseReviewRequire
                | EventKind::RequireUserInteractive
                    if manual =>
                {
                    if let Some(id) = event.content.get("id").and_then(|v| v.as_str()) {
                        tracing::info!(endpoint = %id, kind = ?event.kind, "auto reviewer: continue");
                        let params = json!({ "suggestion": "continue" });
                        if let Some(params) = params.as_object() {
                            handle.feed(id, params.clone());
                        }
                    }
                }
                kind => {
                    println!(
                        "[{:>4}] {:<24} {}",
                        event.seq,
                        format!("{kind:?}"),
                        event.task_index.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    });

    let result = coordinator.run(&goal).await;
    if let Some(tree) = coordinator.tree() {
        println!("\n{}", tree.render_progress(None));
    }
    drop(coordinator);
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
    result.context("Coordinator run failed")?;
    Ok(())
}
