//! 任务树
//!
//! 节点存放在 arena（`Vec<TaskNode>`）中，父子关系用下标表示：子节点由父节点的 `children` 持有，
//! `parent` 只是回指。节点从不删除，`truncate_after` 只裁剪父节点的子列表。
//! 索引（`1`、`1-1`、`1-2-1` …）和先序序号只能从根整体重算，不做局部重编号。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::task::{PlanSpec, SubtaskSpec};

pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    NotStarted,
    Executing,
    Executed,
    NeedsRerun,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not-started",
            TaskStatus::Executing => "executing",
            TaskStatus::Executed => "executed",
            TaskStatus::NeedsRerun => "needs-rerun",
        }
    }
}

/// 决策循环给出的任务结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "kebab-case")]
pub enum TaskOutcome {
    Finished,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskNode {
    pub id: TaskId,
    /// 层级索引，如 `1-2`
    pub index: String,
    /// 整棵树上的先序序号（根为 0）
    pub order: usize,
    pub name: String,
    pub goal: String,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub short_summary: String,
    pub long_summary: String,
    /// 本任务产生的工具结果 id（时间线中的引用）
    pub tool_results: Vec<i64>,
    #[serde(skip)]
    pub parent: Option<TaskId>,
    #[serde(skip)]
    pub children: Vec<TaskId>,
}

impl TaskNode {
    fn new(id: TaskId, name: &str, goal: &str, parent: Option<TaskId>) -> Self {
        Self {
            id,
            index: String::new(),
            order: 0,
            name: name.to_string(),
            goal: goal.to_string(),
            status: TaskStatus::NotStarted,
            outcome: None,
            short_summary: String::new(),
            long_summary: String::new(),
            tool_results: Vec::new(),
            parent,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
}

impl TaskTree {
    pub fn new(name: &str, goal: &str) -> Self {
        let mut tree = Self {
            nodes: vec![TaskNode::new(0, name, goal, None)],
        };
        tree.regenerate_indices();
        tree
    }

    /// 由计划构建：主任务为根，子任务按数组顺序挂在根下
    pub fn from_plan(plan: &PlanSpec) -> Self {
        let mut tree = Self::new(&plan.main_task, &plan.main_task_goal);
        tree.insert_children(tree.root(), &plan.tasks);
        tree
    }

    pub fn root(&self) -> TaskId {
        0
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn children(&self, id: TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    /// 第 `i` 个子节点；子列表可能在遍历过程中被追加或截断，调用方每步重新读取
    pub fn child_at(&self, id: TaskId, i: usize) -> Option<TaskId> {
        self.children(id).get(i).copied()
    }

    pub fn parent(&self, id: TaskId) -> Option<TaskId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn add_child(&mut self, parent: TaskId, name: &str, goal: &str) -> TaskId {
        let id = self.nodes.len();
        self.nodes.push(TaskNode::new(id, name, goal, Some(parent)));
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    /// 追加一批子任务并从根重算索引
    pub fn insert_children(&mut self, parent: TaskId, subtasks: &[SubtaskSpec]) -> Vec<TaskId> {
        let ids = subtasks
            .iter()
            .map(|s| self.add_child(parent, &s.name, &s.goal))
            .collect();
        self.regenerate_indices();
        ids
    }

    /// 「到此为止」：丢弃 `child` 之后的兄弟任务；返回被裁掉的个数
    pub fn truncate_after(&mut self, child: TaskId) -> usize {
        let Some(parent) = self.parent(child) else {
            return 0;
        };
        let Some(siblings) = self.nodes.get_mut(parent).map(|p| &mut p.children) else {
            return 0;
        };
        let Some(pos) = siblings.iter().position(|c| *c == child) else {
            return 0;
        };
        let removed = siblings.len() - pos - 1;
        siblings.truncate(pos + 1);
        self.regenerate_indices();
        removed
    }

    /// 从根开始的先序遍历（只含仍挂在树上的节点）
    pub fn pre_order(&self) -> Vec<TaskId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    /// 从根整体重算层级索引与先序序号
    pub fn regenerate_indices(&mut self) {
        let mut order = 0;
        let mut stack = vec![(self.root(), "1".to_string())];
        while let Some((id, index)) = stack.pop() {
            let children = self.children(id).to_vec();
            if let Some(node) = self.nodes.get_mut(id) {
                node.index = index.clone();
                node.order = order;
                order += 1;
            }
            for (i, child) in children.iter().enumerate().rev() {
                stack.push((*child, format!("{index}-{}", i + 1)));
            }
        }
    }

    pub fn find_by_index(&self, index: &str) -> Option<TaskId> {
        self.pre_order()
            .into_iter()
            .find(|id| self.nodes[*id].index == index)
    }

    /// 嵌套 JSON，用于 plan_created 事件与审阅材料
    pub fn to_json(&self) -> Value {
        self.node_json(self.root())
    }

    fn node_json(&self, id: TaskId) -> Value {
        let node = &self.nodes[id];
        let children: Vec<Value> = node.children.iter().map(|c| self.node_json(*c)).collect();
        json!({
            "index": node.index,
            "name": node.name,
            "goal": node.goal,
            "status": node.status,
            "outcome": node.outcome,
            "short_summary": node.short_summary,
            "subtasks": children,
        })
    }

    /// 给模型看的进度列表，`current` 用箭头标出
    pub fn render_progress(&self, current: Option<TaskId>) -> String {
        let mut out = String::new();
        for id in self.pre_order() {
            let node = &self.nodes[id];
            let depth = node.index.matches('-').count();
            let marker = if Some(id) == current { "-> " } else { "   " };
            out.push_str(&format!(
                "{marker}{}[{}] {}: {} ({})",
                "  ".repeat(depth),
                node.index,
                node.name,
                node.goal,
                node.status.as_str()
            ));
            if !node.short_summary.is_empty() {
                out.push_str(&format!(" => {}", node.short_summary));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(name: &str) -> SubtaskSpec {
        SubtaskSpec {
            name: name.to_string(),
            goal: format!("goal of {name}"),
        }
    }

    fn plan(names: &[&str]) -> PlanSpec {
        PlanSpec {
            main_task: "m".into(),
            main_task_goal: "g".into(),
            tasks: names.iter().map(|n| subtask(n)).collect(),
        }
    }

    #[test]
    fn test_from_plan_indices() {
        let tree = TaskTree::from_plan(&plan(&["a", "b"]));
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.index, "1");
        assert_eq!(root.order, 0);
        let kids: Vec<&TaskNode> = tree.children(0).iter().map(|c| tree.get(*c).unwrap()).collect();
        assert_eq!(kids[0].name, "a");
        assert_eq!(kids[0].index, "1-1");
        assert_eq!(kids[1].index, "1-2");
        assert!(kids[0].order < kids[1].order);
    }

    #[test]
    fn test_insert_children_keeps_sibling_order() {
        let mut tree = TaskTree::from_plan(&plan(&["a", "b", "c"]));
        let a = tree.child_at(0, 0).unwrap();
        let new = tree.insert_children(a, &[subtask("a1"), subtask("a2")]);

        assert_eq!(tree.get(new[0]).unwrap().index, "1-1-1");
        assert_eq!(tree.get(new[1]).unwrap().index, "1-1-2");
        // 先序序号整体后移，但兄弟之间的相对顺序不变
        let orders: Vec<usize> = tree.children(0).iter().map(|c| tree.get(*c).unwrap().order).collect();
        assert_eq!(orders, vec![1, 4, 5]);
        let names: Vec<&str> = tree
            .pre_order()
            .into_iter()
            .map(|id| tree.get(id).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["m", "a", "a1", "a2", "b", "c"]);
    }

    #[test]
    fn test_truncate_after() {
        let mut tree = TaskTree::from_plan(&plan(&["a", "b", "c"]));
        let a = tree.child_at(0, 0).unwrap();
        assert_eq!(tree.truncate_after(a), 2);
        assert_eq!(tree.children(0).len(), 1);
        // 节点仍在 arena 中，只是不再可达
        assert!(tree.get(2).is_some());
        assert_eq!(tree.pre_order().len(), 2);
        assert_eq!(tree.truncate_after(tree.root()), 0);
    }

    #[test]
    fn test_find_and_render() {
        let mut tree = TaskTree::from_plan(&plan(&["a", "b"]));
        let b = tree.find_by_index("1-2").unwrap();
        tree.get_mut(b).unwrap().status = TaskStatus::Executing;
        let rendered = tree.render_progress(Some(b));
        assert!(rendered.contains("->   [1-2] b: goal of b (executing)"));
        assert_eq!(tree.to_json()["subtasks"][1]["name"], "b");
    }
}
