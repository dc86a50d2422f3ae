//! 括号匹配 JSON 扫描器
//!
//! 对每个 `{` 起点做括号配对（跳过字符串与转义），得到的候选按起点顺序惰性解析；
//! 解析失败的候选只记日志并跳过，不影响后面的合法对象。

use std::collections::HashMap;

use serde_json::Value;

use crate::action::Action;
use crate::core::{OrchestratorError, Result};

/// 动作判别字段
pub const DISCRIMINATOR: &str = "@action";

/// 从 `start`（必须是 `{`）开始配对，返回闭合 `}` 的字节位置；未闭合返回 None
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// 从 `start` 做一次带栈的配对扫描，顺带记下途中每个 `{` 的闭合位置
///
/// 扫描在 `start` 闭合时停止；到文本末尾仍在栈中的起点记为未闭合。
fn record_closes(bytes: &[u8], start: usize, closes: &mut HashMap<usize, Option<usize>>) {
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        let pos = start + offset;
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(pos),
            b'}' => {
                if let Some(open) = stack.pop() {
                    closes.insert(open, Some(pos));
                }
                if stack.is_empty() {
                    return;
                }
            }
            _ => {}
        }
    }
    for open in stack {
        closes.insert(open, None);
    }
}

/// 惰性产出括号配平的 `{...}` 片段，按起点顺序（含嵌套片段）
///
/// 一次扫描里经过的 `{` 都会记下闭合位置，后续起点直接查表，
/// 大量未闭合的 `{` 不会让每个起点各自扫到文本末尾。
pub struct JsonCandidates<'a> {
    text: &'a str,
    pos: usize,
    closes: HashMap<usize, Option<usize>>,
}

impl<'a> Iterator for JsonCandidates<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() {
            let i = self.pos;
            self.pos += 1;
            if bytes[i] != b'{' {
                continue;
            }
            if !self.closes.contains_key(&i) {
                record_closes(bytes, i, &mut self.closes);
            }
            if let Some(Some(end)) = self.closes.get(&i) {
                // `{` 与 `}` 均为 ASCII，切片边界落在字符边界上
                return Some(&self.text[i..=*end]);
            }
        }
        None
    }
}

pub fn json_candidates(text: &str) -> JsonCandidates<'_> {
    JsonCandidates {
        text,
        pos: 0,
        closes: HashMap::new(),
    }
}

fn parse_candidate(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(v) if v.is_object() => Some(v),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, len = candidate.len(), "skip malformed json candidate");
            None
        }
    }
}

fn discriminator_of(value: &Value) -> Option<&str> {
    value.get(DISCRIMINATOR).and_then(|v| v.as_str())
}

fn matches_expected(value: &Value, expected: &[&str]) -> bool {
    discriminator_of(value)
        .map(|name| expected.iter().any(|e| e.eq_ignore_ascii_case(name)))
        .unwrap_or(false)
}

/// 扫描整段文本，返回第一个判别字段属于 `expected` 的动作
pub fn extract_action(text: &str, expected: &[&str]) -> Result<Action> {
    for candidate in json_candidates(text) {
        if let Some(value) = parse_candidate(candidate) {
            if matches_expected(&value, expected) {
                return Action::from_value(value);
            }
        }
    }
    Err(OrchestratorError::NoActionFound {
        expected: expected.join(", "),
    })
}

/// 返回第一个带判别字段的动作（不限名称），由调用方决定未知动作如何处理
pub fn extract_any_action(text: &str) -> Result<Action> {
    for candidate in json_candidates(text) {
        if let Some(value) = parse_candidate(candidate) {
            if discriminator_of(&value).is_some() {
                return Action::from_value(value);
            }
        }
    }
    Err(OrchestratorError::NoActionFound {
        expected: "any".to_string(),
    })
}

/// 增量扫描器：流式输出边到边扫，命中即可提前结束读取
///
/// 遇到尚未闭合的 `{` 时暂停在该位置等待更多数据；`finish` 时对完整缓冲区重扫，
/// 覆盖永不闭合的前缀挡住后续对象的情况。
pub struct ActionScanner {
    expected: Vec<String>,
    buf: String,
    next_start: usize,
}

impl ActionScanner {
    pub fn new(expected: &[&str]) -> Self {
        Self {
            expected: expected.iter().map(|s| s.to_string()).collect(),
            buf: String::new(),
            next_start: 0,
        }
    }

    fn expected_refs(&self) -> Vec<&str> {
        self.expected.iter().map(String::as_str).collect()
    }

    /// 追加一段输出；若已出现匹配的动作则返回
    pub fn push(&mut self, chunk: &str) -> Option<Action> {
        self.buf.push_str(chunk);
        let bytes = self.buf.as_bytes();
        let mut pos = self.next_start;
        while pos < bytes.len() {
            if bytes[pos] != b'{' {
                pos += 1;
                continue;
            }
            let Some(end) = matching_close(bytes, pos) else {
                break;
            };
            if let Some(value) = parse_candidate(&self.buf[pos..=end]) {
                if matches_expected(&value, &self.expected_refs()) {
                    self.next_start = pos + 1;
                    return Action::from_value(value).ok();
                }
            }
            pos += 1;
        }
        self.next_start = pos;
        None
    }

    /// 到达流末尾：对整个缓冲区做一次完整扫描
    pub fn finish(&self) -> Result<Action> {
        extract_action(&self.buf, &self.expected_refs())
    }

    pub fn buffer(&self) -> &str {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_prose() {
        let text = r#"I think we should call a tool.
```json
{"@action": "call-tool", "tool": "echo", "params": {"text": "hi {there}"}}
```
Done."#;
        let action = extract_action(text, &["call-tool"]).unwrap();
        assert_eq!(action.name(), "call-tool");
        assert_eq!(action.get_string("tool"), "echo");
        assert_eq!(action.get_object("params")["text"], "hi {there}");
    }

    #[test]
    fn test_malformed_candidate_does_not_hide_later_one() {
        let text = r#"{"@action": "finished", broken} and then {"@action": "finished", "summary": "ok"}"#;
        let action = extract_action(text, &["finished"]).unwrap();
        assert_eq!(action.get_string("summary"), "ok");
    }

    #[test]
    fn test_alias_and_case() {
        let text = r#"{"@action": "Continue"}"#;
        let action = extract_action(text, &["continue-current-task", "continue"]).unwrap();
        assert_eq!(action.name(), "Continue");
    }

    #[test]
    fn test_no_action_found() {
        let err = extract_action(r#"{"@action": "plan"}"#, &["call-tool"]).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoActionFound { .. }));
        assert!(extract_action("no json here", &["plan"]).is_err());
    }

    #[test]
    fn test_nested_action_inside_wrapper() {
        let text = r#"{"reply": {"@action": "task-skipped", "reason": "n/a"}"#;
        // 外层未闭合，内层对象仍可被找到
        let action = extract_action(text, &["task-skipped"]).unwrap();
        assert_eq!(action.get_string("reason"), "n/a");
    }

    #[test]
    fn test_streaming_scanner_returns_early() {
        let mut scanner = ActionScanner::new(&["plan"]);
        assert!(scanner.push(r#"thinking... {"@action": "pl"#).is_none());
        let action = scanner.push(r#"an", "main_task": "m"} trailing"#).unwrap();
        assert_eq!(action.get_string("main_task"), "m");
    }

    #[test]
    fn test_streaming_scanner_finish_rescans() {
        let mut scanner = ActionScanner::new(&["finished"]);
        // 一个永不闭合的前缀会挡住增量扫描，finish 时仍能找到
        assert!(scanner.push(r#"{ "note": "unterminated "#).is_none());
        assert!(scanner.push(r#"x {"@action": "finished"}"#).is_none());
        assert_eq!(scanner.finish().unwrap().name(), "finished");
    }

    #[test]
    fn test_candidates_are_lazy_and_ordered() {
        let text = r#"{"outer": {"inner": 1}} {"b": 2}"#;
        let mut candidates = json_candidates(text);
        assert_eq!(candidates.next(), Some(r#"{"outer": {"inner": 1}}"#));
        assert_eq!(candidates.next(), Some(r#"{"inner": 1}"#));
        assert_eq!(candidates.next(), Some(r#"{"b": 2}"#));
        assert_eq!(candidates.next(), None);
    }

    #[test]
    fn test_many_unclosed_braces_stay_fast() {
        let mut text = "{ ".repeat(50_000);
        text.push_str(r#"{"@action": "finished", "summary": "ok"}"#);
        let started = std::time::Instant::now();
        let action = extract_action(&text, &["finished"]).unwrap();
        assert_eq!(action.get_string("summary"), "ok");
        assert!(started.elapsed() < std::time::Duration::from_secs(2));

        // 第一个候选命中时不再看后面的文本
        let text = format!(r#"{{"@action": "finished"}} {}"#, "{ ".repeat(50_000));
        assert_eq!(extract_action(&text, &["finished"]).unwrap().name(), "finished");
    }
}
