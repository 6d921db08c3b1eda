// The todo record and its text rules

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Longest todo text the UI layer accepts
pub const MAX_TEXT_LEN: usize = 200;

/// Text given to imported entries that carry none
pub const UNTITLED_TEXT: &str = "Untitled Todo";

/// A persisted todo
///
/// The JSON shape (`id`, `text`, `completed`, `createdAt`, `updatedAt`) is the
/// export format, so field names must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: i64,
    pub text: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A todo that has not been given an id yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTodo {
    pub text: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewTodo {
    /// Fresh, uncompleted todo stamped with the current time
    pub fn now(text: impl Into<String>) -> Self {
        let ts = now();
        Self {
            text: text.into(),
            completed: false,
            created_at: ts,
            updated_at: ts,
        }
    }
}

/// Counts shown next to the list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TodoStats {
    pub total: usize,
    pub completed: usize,
}

impl TodoStats {
    pub fn from_todos(todos: &[Todo]) -> Self {
        Self {
            total: todos.len(),
            completed: todos.iter().filter(|t| t.completed).count(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.total - self.completed
    }
}

impl std::fmt::Display for TodoStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {} completed", self.completed, self.total)
    }
}

/// Check text the way the input form does: trimmed, non-empty, bounded
pub fn check_text(text: &str) -> Result<&str, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("Todo text cannot be empty".to_string());
    }
    let len = trimmed.chars().count();
    if len > MAX_TEXT_LEN {
        return Err(format!("Todo text too long: {} chars (max {})", len, MAX_TEXT_LEN));
    }
    Ok(trimmed)
}

/// Current time at the precision the store keeps (microseconds)
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
