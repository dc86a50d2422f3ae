//! 断点恢复：同一协调器 id + 同一 SQLite 文件重跑时，已完成的 AI 调用、审阅和工具执行直接回放

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use orchestra::checkpoint::CheckpointKind;
    use orchestra::config::{AppConfig, CheckpointBackend};
    use orchestra::core::OrchestratorError;
    use orchestra::endpoint::AgreePolicy;
    use orchestra::events::{CollectingSink, EventKind};
    use orchestra::llm::{AiRequest, MockAi};
    use orchestra::task::TaskStatus;
    use orchestra::tools::{Tool, ToolContext};
    use orchestra::CoordinatorBuilder;
    use serde_json::{json, Value};

    /// 带副作用计数的写入工具
    struct Append {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Append {
        fn name(&self) -> &str {
            "append"
        }
        fn description(&self) -> &str {
            "append a line to the journal"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"line": {"type": "string"}},
                "required": ["line"]
            })
        }
        async fn invoke(&self, params: Value, ctx: ToolContext) -> Result<Value, String> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.stdout.write_line(params["line"].as_str().unwrap_or_default());
            Ok(json!({ "written": n }))
        }
    }

    fn online_ai() -> MockAi {
        MockAi::new(|req: &AiRequest| {
            Ok(match req.kind.as_str() {
                "plan" => r#"{"@action":"plan","main_task":"journal","tasks":[{"subtask_name":"first"},{"subtask_name":"second"}]}"#.to_string(),
                "task-step" => format!(
                    r#"{{"@action":"call-tool","tool":"append","params":{{"line":"entry {}"}}}}"#,
                    req.task_index.as_deref().unwrap_or("?")
                ),
                "tool-decision" => r#"{"@action":"finished","summary":"written"}"#.to_string(),
                other => return Err(format!("unexpected request {other}")),
            })
        })
    }

    fn offline_ai() -> MockAi {
        MockAi::new(|_req: &AiRequest| Err("model offline".to_string()))
    }

    fn config(policy: AgreePolicy, dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.agree.policy = policy;
        config.coordinator.ai_retry = 2;
        config.coordinator.retry_backoff_ms = 1;
        config.tools.spill_dir = Some(dir.join("spill"));
        config.checkpoint.backend = CheckpointBackend::Sqlite;
        config.checkpoint.db_path = dir.join("checkpoints.db");
        config
    }

    #[tokio::test]
    async fn test_rerun_replays_everything_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let first_ai = Arc::new(online_ai());
        let mut first = CoordinatorBuilder::new(config(AgreePolicy::Yolo, dir.path()))
            .with_id("journal-run")
            .with_ai(first_ai.clone())
            .with_tool(Append { runs: runs.clone() })
            .build()
            .unwrap();
        first.run("write the journal").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let first_results = first.timeline().last_tool_results(2);
        drop(first);

        let sink = CollectingSink::new();
        let second_ai = Arc::new(offline_ai());
        let mut second = CoordinatorBuilder::new(config(AgreePolicy::Manual, dir.path()))
            .with_id("journal-run")
            .with_ai(second_ai.clone())
            .with_tool(Append { runs: runs.clone() })
            .with_sink(Arc::new(sink.clone()))
            .build()
            .unwrap();
        // Manual 策略下也不会挂起：审阅结论都已落盘
        tokio::time::timeout(Duration::from_secs(5), second.run("write the journal"))
            .await
            .expect("replayed run must not wait for reviewers")
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(second_ai.calls().is_empty());
        assert_eq!(
            sink.of_kind(EventKind::AiReplay).len(),
            first_ai.calls().len()
        );
        let replayed_tools = sink
            .of_kind(EventKind::ToolCallDone)
            .into_iter()
            .filter(|e| e.content["replayed"] == json!(true))
            .count();
        assert_eq!(replayed_tools, 2);

        let second_results = second.timeline().last_tool_results(2);
        assert_eq!(first_results.len(), 2);
        for (a, b) in first_results.iter().zip(&second_results) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.data.result, b.data.result);
        }
        let tree = second.tree().unwrap();
        assert!(tree
            .pre_order()
            .into_iter()
            .all(|id| tree.get(id).unwrap().status == TaskStatus::Executed));
        assert!(second.recovery_point().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_from_pending_tool_review() {
        let dir = tempfile::tempdir().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let sink = CollectingSink::new();
        let mut first = CoordinatorBuilder::new(config(AgreePolicy::Manual, dir.path()))
            .with_id("resume-run")
            .with_ai(Arc::new(online_ai()))
            .with_tool(Append { runs: runs.clone() })
            .with_sink(Arc::new(sink.clone()))
            .build()
            .unwrap();
        let handle = first.handle();
        let watcher = {
            let sink = sink.clone();
            tokio::spawn(async move {
                while sink.of_kind(EventKind::ToolUseReviewRequire).is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                handle.cancel();
            })
        };
        let err = first.run("write the journal").await.unwrap_err();
        watcher.await.unwrap();
        assert_eq!(err, OrchestratorError::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let point = first.recovery_point().await.unwrap().unwrap();
        assert_eq!(point.kind, CheckpointKind::Review);
        let pending = &sink.of_kind(EventKind::ToolUseReviewRequire)[0];
        assert_eq!(point.seq, pending.content["seq"].as_i64().unwrap());
        assert_eq!(point.review_materials.as_ref().unwrap()["tool"], "append");
        drop(first);

        let ai = Arc::new(online_ai());
        let mut second = CoordinatorBuilder::new(config(AgreePolicy::Yolo, dir.path()))
            .with_id("resume-run")
            .with_ai(ai.clone())
            .with_tool(Append { runs: runs.clone() })
            .build()
            .unwrap();
        second.run("write the journal").await.unwrap();

        assert_eq!(ai.calls_of("plan"), 0);
        // 第一个 task-step 已在首轮完成，只剩第二个任务需要向模型提问
        assert_eq!(ai.calls_of("task-step"), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(second.recovery_point().await.unwrap().is_none());
    }
}
