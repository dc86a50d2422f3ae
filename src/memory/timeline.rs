//! 时间线：工具结果与用户交互的有序历史，按条目数做两级压缩
//!
//! - shrink：未压缩条目数超过 `full_memory_count` 时，最旧的一条交给模型单独摘要，
//!   之后渲染时用摘要替代原文
//! - reduce：未被 reducer 覆盖的条目超过 `max_count` 时，除最近 `full_memory_count`
//!   条外的前缀整体压成一个 reducer 块
//!
//! 条目从不删除。渲染先在读锁内克隆 BTreeMap 快照，追加与渲染可以并发。
//! 压缩用的 AI 调用被取消或失败时跳过本轮，不影响追加。
//!
//! `save` 序列化为 JSON，超过上限时先丢弃 reducer 已覆盖的条目，再把较旧条目
//! 降为摘要形态。`restore` 载入时重新分配 id 与时间戳，保证与当前序列不冲突。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::action::extract_action;
use crate::config::TimelineSection;
use crate::core::{OrchestratorError, SequenceGenerator};
use crate::events::{Emitter, EventKind};
use crate::llm::AiInvoker;
use crate::memory::{InteractionStage, UserInteraction};
use crate::tools::ToolResult;

/// `save` 的默认体积上限
pub const SAVE_LIMIT_BYTES: usize = 512 * 1024;

/// 紧急压缩时顶替摘要的最大字符数
const EMERGENCY_SUMMARY_CHARS: usize = 200;

const SHRINK_PROMPT: &str = r#"# Timeline Shrink
You maintain the long-running memory of an agent. Summarize the single timeline entry below
into one dense sentence that keeps every fact later steps may depend on (names, paths, numbers,
success or failure).

<entry>
{entry}
</entry>

Respond with:
{"@action": "timeline-shrink", "persistent": "<summary>"}
"#;

const REDUCER_PROMPT: &str = r#"# Timeline Reducer
The timeline below is getting too long. Compress the whole span into a compact memory that keeps
decisions, results and open problems. Previous compressed memory (may be empty):
{previous}

<timeline>
{timeline}
</timeline>

Respond with:
{"@action": "timeline-reducer", "reducer_memory": "<memory>"}
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEntry {
    ToolResult(ToolResult),
    UserInteraction(UserInteraction),
    Text {
        tag: String,
        text: String,
        shrink_result: Option<String>,
    },
}

impl TimelineEntry {
    pub fn shrink_result(&self) -> Option<&str> {
        match self {
            Self::ToolResult(r) => r.shrink_result.as_deref(),
            Self::UserInteraction(u) => u.shrink_result.as_deref(),
            Self::Text { shrink_result, .. } => shrink_result.as_deref(),
        }
    }

    fn set_shrink_result(&mut self, summary: String) {
        match self {
            Self::ToolResult(r) => r.shrink_result = Some(summary),
            Self::UserInteraction(u) => u.shrink_result = Some(summary),
            Self::Text { shrink_result, .. } => *shrink_result = Some(summary),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::ToolResult(r) => r.render(),
            Self::UserInteraction(u) => u.render(),
            Self::Text { tag, text, .. } => format!("[{tag}] {text}"),
        }
    }

    /// 去掉大字段，只留摘要；没有摘要时用截断的渲染文本顶替
    fn strip_to_summary(&mut self) {
        if self.shrink_result().is_none() {
            let summary = truncate_chars(&self.render(), EMERGENCY_SUMMARY_CHARS);
            self.set_shrink_result(summary);
        }
        match self {
            Self::ToolResult(r) => {
                r.data.stdout.clear();
                r.data.stderr.clear();
                r.data.result = serde_json::Value::Null;
            }
            Self::UserInteraction(u) => u.system_prompt.clear(),
            Self::Text { text, .. } => text.clear(),
        }
    }

    fn set_id(&mut self, id: i64) {
        match self {
            Self::ToolResult(r) => r.id = id,
            Self::UserInteraction(u) => u.id = id,
            Self::Text { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub id: i64,
    /// 逻辑时间戳，单调递增
    pub ts: i64,
    pub created_at: DateTime<Utc>,
    pub entry: TimelineEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reducer {
    /// 覆盖到此时间戳（含）
    boundary_ts: i64,
    memory: String,
}

#[derive(Default)]
struct TimelineState {
    items: BTreeMap<i64, TimelineItem>,
    id_to_ts: HashMap<i64, i64>,
    reducer: Option<Reducer>,
}

#[derive(Serialize, Deserialize)]
struct TimelineSnapshot {
    items: Vec<TimelineItem>,
    reducer: Option<Reducer>,
}

impl TimelineState {
    fn uncovered(&self) -> impl Iterator<Item = &TimelineItem> {
        let boundary = self.reducer.as_ref().map(|r| r.boundary_ts).unwrap_or(i64::MIN);
        self.items.range(boundary.saturating_add(1)..).map(|(_, item)| item)
    }
}

pub struct Timeline {
    state: RwLock<TimelineState>,
    clock: AtomicI64,
    ids: Arc<SequenceGenerator>,
    full_memory_count: usize,
    max_count: usize,
    ai: Option<Arc<AiInvoker>>,
    emitter: Option<Emitter>,
    compaction: tokio::sync::Mutex<()>,
}

impl Timeline {
    pub fn new(config: &TimelineSection, ids: Arc<SequenceGenerator>) -> Self {
        Self {
            state: RwLock::new(TimelineState::default()),
            clock: AtomicI64::new(0),
            ids,
            full_memory_count: config.full_memory_count.max(1),
            max_count: config.max_timeline_count(),
            ai: None,
            emitter: None,
            compaction: tokio::sync::Mutex::new(()),
        }
    }

    /// 设置压缩用的 AI；未设置时只记录不压缩
    pub fn with_ai(mut self, ai: Arc<AiInvoker>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TimelineState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TimelineState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, id: i64, entry: TimelineEntry) {
        let ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let item = TimelineItem {
            id,
            ts,
            created_at: Utc::now(),
            entry,
        };
        let mut state = self.write();
        state.id_to_ts.insert(id, ts);
        state.items.insert(ts, item);
    }

    pub async fn push_tool_result(&self, result: ToolResult) {
        let id = result.id;
        self.insert(id, TimelineEntry::ToolResult(result));
        self.compact().await;
    }

    pub async fn push_user_interaction(
        &self,
        stage: InteractionStage,
        system_prompt: &str,
        user_answer: &str,
    ) -> i64 {
        let id = self.ids.next();
        self.insert(
            id,
            TimelineEntry::UserInteraction(UserInteraction {
                id,
                stage,
                system_prompt: system_prompt.to_string(),
                user_answer: user_answer.to_string(),
                shrink_result: None,
            }),
        );
        self.compact().await;
        id
    }

    pub async fn push_text(&self, tag: &str, text: &str) -> i64 {
        let id = self.ids.next();
        self.insert(
            id,
            TimelineEntry::Text {
                tag: tag.to_string(),
                text: text.to_string(),
                shrink_result: None,
            },
        );
        self.compact().await;
        id
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 未被 reducer 覆盖且尚未 shrink 的条目数
    pub fn unshrunk_count(&self) -> usize {
        self.read()
            .uncovered()
            .filter(|item| item.entry.shrink_result().is_none())
            .count()
    }

    pub fn reducer_memory(&self) -> Option<String> {
        self.read().reducer.as_ref().map(|r| r.memory.clone())
    }

    pub fn tool_result(&self, id: i64) -> Option<ToolResult> {
        let state = self.read();
        let ts = state.id_to_ts.get(&id)?;
        match &state.items.get(ts)?.entry {
            TimelineEntry::ToolResult(r) => Some(r.clone()),
            _ => None,
        }
    }

    /// 最近 n 个工具结果，按时间正序
    pub fn last_tool_results(&self, n: usize) -> Vec<ToolResult> {
        let state = self.read();
        let mut out: Vec<ToolResult> = state
            .items
            .values()
            .rev()
            .filter_map(|item| match &item.entry {
                TimelineEntry::ToolResult(r) => Some(r.clone()),
                _ => None,
            })
            .take(n)
            .collect();
        out.reverse();
        out
    }

    /// 全部条目的快照（含已被压缩替代的）
    pub fn outputs(&self) -> Vec<TimelineItem> {
        self.read().items.values().cloned().collect()
    }

    /// 渲染进提示词；相同条目集与相同边界得到相同文本
    pub fn dump(&self) -> String {
        let (items, reducer) = {
            let state = self.read();
            (state.items.clone(), state.reducer.clone())
        };
        render(&items, reducer.as_ref())
    }

    /// 渲染 id 之前的条目（不含该 id），用于回看某一步发生时的上下文
    pub fn dump_before(&self, id: i64) -> String {
        let (items, reducer) = {
            let state = self.read();
            let items: BTreeMap<i64, TimelineItem> = state
                .items
                .iter()
                .filter(|(_, item)| item.id < id)
                .map(|(ts, item)| (*ts, item.clone()))
                .collect();
            (items, state.reducer.clone())
        };
        render(&items, reducer.as_ref())
    }

    /// 最近 n 个工具结果的提示词片段，按时间正序，不受压缩影响
    pub fn prompt_for_last_tool_results(&self, n: usize) -> String {
        let results = self.last_tool_results(n);
        if results.is_empty() {
            return String::new();
        }
        let mut out = format!("last {} tool results:\n", results.len());
        for result in &results {
            out.push_str(&format!("--[id: {}]\n", result.id));
            for line in result.render().lines() {
                out.push_str("     ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    pub fn save(&self) -> Result<String, OrchestratorError> {
        self.save_within(SAVE_LIMIT_BYTES)
    }

    /// 序列化；超过 limit 字节时逐级紧急压缩，不修改内存中的时间线
    pub fn save_within(&self, limit: usize) -> Result<String, OrchestratorError> {
        let mut snapshot = {
            let state = self.read();
            TimelineSnapshot {
                items: state.items.values().cloned().collect(),
                reducer: state.reducer.clone(),
            }
        };
        let text = encode(&snapshot)?;
        if text.len() <= limit {
            return Ok(text);
        }

        if let Some(boundary) = snapshot.reducer.as_ref().map(|r| r.boundary_ts) {
            snapshot.items.retain(|item| item.ts > boundary);
            let text = encode(&snapshot)?;
            if text.len() <= limit {
                tracing::info!(bytes = text.len(), "timeline saved without reduced entries");
                return Ok(text);
            }
        }

        let keep = snapshot.items.len().saturating_sub(self.full_memory_count);
        for item in snapshot.items.iter_mut().take(keep) {
            item.entry.strip_to_summary();
        }
        let text = encode(&snapshot)?;
        if text.len() > limit {
            tracing::warn!(bytes = text.len(), limit, "timeline still above save limit");
        } else {
            tracing::info!(bytes = text.len(), "timeline saved with emergency compression");
        }
        Ok(text)
    }

    /// 用 `save` 的输出替换当前内容；返回载入的条目数
    ///
    /// 每条重新取 id 与时间戳，reducer 边界随之映射，之后追加的条目不会与载入的冲突。
    pub fn restore(&self, text: &str) -> Result<usize, OrchestratorError> {
        let snapshot: TimelineSnapshot = serde_json::from_str(text)
            .map_err(|e| OrchestratorError::JsonParseError(format!("timeline snapshot: {e}")))?;
        let old_boundary = snapshot.reducer.as_ref().map(|r| r.boundary_ts);

        let mut items = snapshot.items;
        items.sort_by_key(|item| item.ts);

        let mut state = TimelineState::default();
        let mut new_boundary = 0;
        for mut item in items {
            let old_ts = item.ts;
            item.ts = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
            item.id = self.ids.next();
            item.entry.set_id(item.id);
            if old_boundary.is_some_and(|b| old_ts <= b) {
                new_boundary = item.ts;
            }
            state.id_to_ts.insert(item.id, item.ts);
            state.items.insert(item.ts, item);
        }
        state.reducer = snapshot.reducer.map(|r| Reducer {
            boundary_ts: new_boundary,
            memory: r.memory,
        });

        let count = state.items.len();
        *self.write() = state;
        tracing::info!(entries = count, "timeline restored");
        Ok(count)
    }

    /// 按阈值压缩；同一时刻只有一轮在跑
    pub async fn compact(&self) {
        let Some(ai) = self.ai.clone() else {
            return;
        };
        let _guard = self.compaction.lock().await;

        if let Err(e) = self.reduce_round(&ai).await {
            tracing::info!(error = %e, "timeline reduce skipped");
            return;
        }
        if let Err(e) = self.shrink_round(&ai).await {
            tracing::info!(error = %e, "timeline shrink skipped");
        }
    }

    async fn reduce_round(&self, ai: &AiInvoker) -> Result<(), OrchestratorError> {
        let (prefix, previous) = {
            let state = self.read();
            let uncovered: Vec<&TimelineItem> = state.uncovered().collect();
            if uncovered.len() <= self.max_count {
                return Ok(());
            }
            let cut = uncovered.len() - self.full_memory_count;
            let prefix: BTreeMap<i64, TimelineItem> = uncovered[..cut]
                .iter()
                .map(|item| (item.ts, (*item).clone()))
                .collect();
            (prefix, state.reducer.clone())
        };
        let Some(boundary_ts) = prefix.keys().next_back().copied() else {
            return Ok(());
        };

        let prompt = REDUCER_PROMPT
            .replace(
                "{previous}",
                previous.as_ref().map(|r| r.memory.as_str()).unwrap_or(""),
            )
            .replace("{timeline}", &render(&prefix, None));
        let memory = ai
            .transaction("timeline-reducer", &prompt, None, |text| {
                let action = extract_action(text, &["timeline-reducer"])?;
                non_empty(action.get_string("reducer_memory"), "reducer_memory")
            })
            .await?;

        self.write().reducer = Some(Reducer {
            boundary_ts,
            memory,
        });
        if let Some(emitter) = &self.emitter {
            emitter.emit(
                EventKind::TimelineCompacted,
                json!({ "strategy": "reduce", "boundary_ts": boundary_ts, "entries": prefix.len() }),
            );
        }
        Ok(())
    }

    async fn shrink_round(&self, ai: &AiInvoker) -> Result<(), OrchestratorError> {
        loop {
            let (target, similar) = {
                let state = self.read();
                let unshrunk: Vec<&TimelineItem> = state
                    .uncovered()
                    .filter(|item| item.entry.shrink_result().is_none())
                    .collect();
                if unshrunk.len() <= self.full_memory_count {
                    return Ok(());
                }
                let target = unshrunk[0].clone();
                let similar = similar_summary(&state, &target);
                (target, similar)
            };

            let summary = match &similar {
                Some(summary) => summary.clone(),
                None => {
                    let prompt = SHRINK_PROMPT.replace("{entry}", &target.entry.render());
                    ai.transaction("timeline-shrink", &prompt, None, |text| {
                        let action = extract_action(text, &["timeline-shrink"])?;
                        non_empty(action.get_string("persistent"), "persistent")
                    })
                    .await?
                }
            };

            {
                let mut state = self.write();
                if let Some(item) = state.items.get_mut(&target.ts) {
                    if let (Some(s), TimelineEntry::ToolResult(r)) = (&similar, &mut item.entry) {
                        r.shrink_similar_result = Some(s.clone());
                    }
                    item.entry.set_shrink_result(summary);
                }
            }
            if let Some(emitter) = &self.emitter {
                emitter.emit(
                    EventKind::TimelineCompacted,
                    json!({ "strategy": "shrink", "id": target.id, "similar": similar.is_some() }),
                );
            }
        }
    }
}

fn encode(snapshot: &TimelineSnapshot) -> Result<String, OrchestratorError> {
    serde_json::to_string(snapshot)
        .map_err(|e| OrchestratorError::Checkpoint(format!("timeline snapshot: {e}")))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn non_empty(value: String, field: &str) -> Result<String, OrchestratorError> {
    if value.trim().is_empty() {
        return Err(OrchestratorError::JsonParseError(format!(
            "field '{field}' is empty"
        )));
    }
    Ok(value)
}

/// 之前同一工具同一参数的结果已有摘要时直接复用
fn similar_summary(state: &TimelineState, target: &TimelineItem) -> Option<String> {
    let TimelineEntry::ToolResult(result) = &target.entry else {
        return None;
    };
    state
        .items
        .range(..target.ts)
        .rev()
        .find_map(|(_, item)| match &item.entry {
            TimelineEntry::ToolResult(prev) if prev.same_call(result) => prev.shrink_result.clone(),
            _ => None,
        })
}

fn render(items: &BTreeMap<i64, TimelineItem>, reducer: Option<&Reducer>) -> String {
    let mut out = String::from("timeline:\n");
    let boundary = match reducer {
        Some(r) => {
            out.push_str(&format!(
                "--[until {}] reducer-memory: {}\n",
                r.boundary_ts, r.memory
            ));
            r.boundary_ts
        }
        None => i64::MIN,
    };
    for (ts, item) in items.range(boundary.saturating_add(1)..) {
        let time = item.created_at.format("%Y/%m/%d %H:%M:%S");
        match item.entry.shrink_result() {
            Some(summary) => {
                out.push_str(&format!("--[{time}] #{ts} id: {} memory: {summary}\n", item.id));
            }
            None => {
                out.push_str(&format!("--[{time}] #{ts} id: {}\n", item.id));
                for line in item.entry.render().lines() {
                    out.push_str("     ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
    }
    out
}
