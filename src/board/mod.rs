//! The board document shared by the browser, the HTTP API, and the agent.
//!
//! A board is a single JSON object: metadata (including the optional team
//! binding), the fixed column sequence, and a map of tasks keyed by id.
//! Typed refs between tasks are symmetric; the mutation helpers here are the
//! only way refs are edited, so both sides always change together.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::team::TeamConfig;

/// Current board schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Gap between consecutive `order` values, leaving room for the browser to
/// insert between tasks fractionally.
pub const ORDER_STEP: f64 = 1000.0;

// ── Columns ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskColumn {
    Backlog,
    Ready,
    InProgress,
    Review,
    Done,
}

impl TaskColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }

    /// The fixed column sequence, in board order.
    pub fn all() -> [TaskColumn; 5] {
        [
            Self::Backlog,
            Self::Ready,
            Self::InProgress,
            Self::Review,
            Self::Done,
        ]
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Backlog => "Backlog",
            Self::Ready => "Ready",
            Self::InProgress => "In Progress",
            Self::Review => "Review",
            Self::Done => "Done",
        }
    }
}

impl FromStr for TaskColumn {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "in-progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(StoreError::UnknownColumn { column: s.to_string() }),
        }
    }
}

impl fmt::Display for TaskColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Task attributes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Task,
    Bug,
    Feature,
    Chore,
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "chore" => Ok(Self::Chore),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

// ── Refs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefType {
    Related,
    Blocks,
    BlockedBy,
    Parent,
    Child,
}

impl RefType {
    /// The ref type implied on the target of a ref of this type.
    pub fn inverse(&self) -> RefType {
        match self {
            Self::Related => Self::Related,
            Self::Blocks => Self::BlockedBy,
            Self::BlockedBy => Self::Blocks,
            Self::Parent => Self::Child,
            Self::Child => Self::Parent,
        }
    }
}

impl FromStr for RefType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "related" => Ok(Self::Related),
            "blocks" => Ok(Self::Blocks),
            "blocked-by" => Ok(Self::BlockedBy),
            "parent" => Ok(Self::Parent),
            "child" => Ok(Self::Child),
            _ => Err(format!("Invalid ref type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: String,
    #[serde(rename = "type")]
    pub ref_type: RefType,
}

// ── Task ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContext {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub column: TaskColumn,
    pub order: f64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub context: Vec<FileContext>,
    #[serde(default)]
    pub refs: Vec<TaskRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, column: TaskColumn, order: f64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            column,
            order,
            priority: Priority::default(),
            task_type: TaskType::default(),
            tags: Vec::new(),
            assignee: None,
            comments: Vec::new(),
            context: Vec::new(),
            refs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Every mutation must bump `updatedAt`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ── Board ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub id: TaskColumn,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardMeta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub meta: BoardMeta,
    pub columns: Vec<ColumnDef>,
    pub tasks: BTreeMap<String, Task>,
}

impl Board {
    /// A fresh board: default columns, no tasks, no team binding.
    pub fn new(name: impl Into<String>) -> Self {
        let columns = TaskColumn::all()
            .into_iter()
            .map(|id| ColumnDef {
                id,
                title: id.title().to_string(),
            })
            .collect();
        Self {
            meta: BoardMeta {
                name: name.into(),
                created_at: Utc::now(),
                version: SCHEMA_VERSION,
                team: None,
            },
            columns,
            tasks: BTreeMap::new(),
        }
    }

    /// Next `order` value for a task appended to `column`.
    pub fn next_order(&self, column: TaskColumn) -> f64 {
        self.tasks
            .values()
            .filter(|t| t.column == column)
            .map(|t| t.order)
            .fold(0.0_f64, f64::max)
            + ORDER_STEP
    }

    /// Tasks of one column in display order: `order` ascending everywhere
    /// except `done`, which shows the most recently updated first.
    pub fn tasks_in_column(&self, column: TaskColumn) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().filter(|t| t.column == column).collect();
        match column {
            TaskColumn::Done => tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            _ => tasks.sort_by(|a, b| a.order.total_cmp(&b.order)),
        }
        tasks
    }

    /// Add `ref_type` from `from` to `to` and the inverse on `to`.
    ///
    /// Validates both endpoints before touching either, so the pair either
    /// gains both sides or stays unchanged. Returns `false` when the ref
    /// already existed (the call is idempotent).
    pub fn add_ref(&mut self, from: &str, to: &str, ref_type: RefType) -> Result<bool, StoreError> {
        if !self.tasks.contains_key(from) {
            return Err(StoreError::TaskNotFound { id: from.to_string() });
        }
        if !self.tasks.contains_key(to) {
            return Err(StoreError::TaskNotFound { id: to.to_string() });
        }

        let exists = self.tasks[from]
            .refs
            .iter()
            .any(|r| r.task_id == to && r.ref_type == ref_type);
        if exists {
            return Ok(false);
        }

        if let Some(forward) = self.tasks.get_mut(from) {
            forward.refs.push(TaskRef {
                task_id: to.to_string(),
                ref_type,
            });
            forward.touch();
        }
        if let Some(backward) = self.tasks.get_mut(to) {
            backward.refs.push(TaskRef {
                task_id: from.to_string(),
                ref_type: ref_type.inverse(),
            });
            backward.touch();
        }

        Ok(true)
    }

    /// Remove every ref between `a` and `b`, both directions.
    ///
    /// Returns `true` when anything was removed.
    pub fn remove_refs_between(&mut self, a: &str, b: &str) -> Result<bool, StoreError> {
        if !self.tasks.contains_key(a) {
            return Err(StoreError::TaskNotFound { id: a.to_string() });
        }
        if !self.tasks.contains_key(b) {
            return Err(StoreError::TaskNotFound { id: b.to_string() });
        }

        let mut removed = false;
        for (from, to) in [(a, b), (b, a)] {
            if let Some(task) = self.tasks.get_mut(from) {
                let before = task.refs.len();
                task.refs.retain(|r| r.task_id != to);
                if task.refs.len() != before {
                    task.touch();
                    removed = true;
                }
            }
        }
        Ok(removed)
    }

    /// Remove a task, stripping any refs pointing at it from other tasks.
    pub fn remove_task(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        for other in self.tasks.values_mut() {
            let before = other.refs.len();
            other.refs.retain(|r| r.task_id != id);
            if other.refs.len() != before {
                other.touch();
            }
        }
        Some(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with_tasks(ids: &[&str]) -> Board {
        let mut board = Board::new("test");
        for id in ids {
            let order = board.next_order(TaskColumn::Backlog);
            board
                .tasks
                .insert(id.to_string(), Task::new(*id, format!("task {id}"), TaskColumn::Backlog, order));
        }
        board
    }

    #[test]
    fn ref_type_inverses_are_symmetric() {
        for rt in [
            RefType::Related,
            RefType::Blocks,
            RefType::BlockedBy,
            RefType::Parent,
            RefType::Child,
        ] {
            assert_eq!(rt.inverse().inverse(), rt);
        }
        assert_eq!(RefType::Blocks.inverse(), RefType::BlockedBy);
        assert_eq!(RefType::Parent.inverse(), RefType::Child);
        assert_eq!(RefType::Related.inverse(), RefType::Related);
    }

    #[test]
    fn add_ref_creates_both_sides() {
        let mut board = board_with_tasks(&["a1", "b2"]);
        let added = board.add_ref("a1", "b2", RefType::Blocks).unwrap();
        assert!(added);

        assert_eq!(
            board.tasks["a1"].refs,
            vec![TaskRef {
                task_id: "b2".into(),
                ref_type: RefType::Blocks
            }]
        );
        assert_eq!(
            board.tasks["b2"].refs,
            vec![TaskRef {
                task_id: "a1".into(),
                ref_type: RefType::BlockedBy
            }]
        );
    }

    #[test]
    fn add_ref_is_idempotent() {
        let mut board = board_with_tasks(&["a1", "b2"]);
        assert!(board.add_ref("a1", "b2", RefType::Related).unwrap());
        assert!(!board.add_ref("a1", "b2", RefType::Related).unwrap());
        assert_eq!(board.tasks["a1"].refs.len(), 1);
        assert_eq!(board.tasks["b2"].refs.len(), 1);
    }

    #[test]
    fn add_ref_unknown_target_leaves_source_untouched() {
        let mut board = board_with_tasks(&["a1"]);
        let err = board.add_ref("a1", "missing", RefType::Blocks).unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound { .. }));
        assert!(board.tasks["a1"].refs.is_empty());
    }

    #[test]
    fn remove_refs_clears_both_sides() {
        let mut board = board_with_tasks(&["a1", "b2"]);
        board.add_ref("a1", "b2", RefType::Blocks).unwrap();

        let removed = board.remove_refs_between("a1", "b2").unwrap();
        assert!(removed);
        assert!(board.tasks["a1"].refs.is_empty());
        assert!(board.tasks["b2"].refs.is_empty());

        // Removing again is a no-op.
        assert!(!board.remove_refs_between("a1", "b2").unwrap());
    }

    #[test]
    fn remove_task_strips_dangling_refs() {
        let mut board = board_with_tasks(&["a1", "b2", "c3"]);
        board.add_ref("a1", "b2", RefType::Parent).unwrap();
        board.add_ref("c3", "b2", RefType::Related).unwrap();

        let removed = board.remove_task("b2");
        assert!(removed.is_some());
        assert!(board.tasks["a1"].refs.is_empty());
        assert!(board.tasks["c3"].refs.is_empty());
    }

    #[test]
    fn next_order_is_strictly_increasing() {
        let board = board_with_tasks(&["a", "b", "c"]);
        let orders: Vec<f64> = board
            .tasks_in_column(TaskColumn::Backlog)
            .iter()
            .map(|t| t.order)
            .collect();
        assert_eq!(orders.len(), 3);
        assert!(orders.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn done_column_sorts_by_updated_at_descending() {
        let mut board = board_with_tasks(&["a", "b"]);
        for id in ["a", "b"] {
            board.tasks.get_mut(id).unwrap().column = TaskColumn::Done;
        }
        board.tasks.get_mut("a").unwrap().touch();

        let ordered: Vec<&str> = board
            .tasks_in_column(TaskColumn::Done)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["a", "b"]);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = "in_progress".parse::<TaskColumn>().unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));
        assert!("in-progress".parse::<TaskColumn>().is_ok());
    }

    #[test]
    fn task_serializes_camel_case() {
        let task = Task::new("t1", "Title", TaskColumn::Backlog, 1000.0);
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
        assert_eq!(json["column"], "backlog");
        assert_eq!(json["type"], "task");
        assert_eq!(json["priority"], "medium");
    }

    #[test]
    fn board_round_trips_through_json() {
        let mut board = board_with_tasks(&["a1", "b2"]);
        board.add_ref("a1", "b2", RefType::Blocks).unwrap();
        let json = serde_json::to_string(&board).unwrap();
        let parsed: Board = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, board);
    }
}
