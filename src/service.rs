// Todo operations on top of the record store

use crate::config::ListFailurePolicy;
use crate::error::{TodoError, TodoResult};
use crate::record::{NewTodo, Todo, TodoStats, now};
use crate::store::RecordStore;
use crate::transfer;
use chrono::Duration;
use tracing::{debug, error, info};

const ADD_FAILED: &str = "Failed to add todo. Please try again.";
const LIST_FAILED: &str = "Failed to load todos. Please try again.";
const UPDATE_FAILED: &str = "Failed to update todo. Please try again.";
const DELETE_FAILED: &str = "Failed to delete todo. Please try again.";
const CLEAR_FAILED: &str = "Failed to clear todos. Please try again.";
const EXPORT_FAILED: &str = "Failed to export todos. Please try again.";

/// The todo operations the UI layer calls
///
/// Owns its [`RecordStore`]. Every operation takes `&mut self`, so calls run
/// one after another and never overlap. Store failures are logged here and
/// turned into [`TodoError`]s with user-facing messages.
pub struct TodoService {
    store: RecordStore,
    list_failures: ListFailurePolicy,
}

impl TodoService {
    pub fn new(store: RecordStore, list_failures: ListFailurePolicy) -> Self {
        Self { store, list_failures }
    }

    /// Whether the store can be opened. Never fails.
    pub fn is_database_available(&mut self) -> bool {
        match self.store.open() {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Database availability check failed");
                false
            }
        }
    }

    /// Add a todo with the given text, returning its new id
    pub fn add_todo(&mut self, text: &str) -> TodoResult<i64> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TodoError::Validation("Todo text cannot be empty".to_string()));
        }

        let id = self
            .store
            .insert(&NewTodo::now(text))
            .map_err(|e| persistence_error(e, "Error adding todo", ADD_FAILED))?;

        info!(id, "Added todo");
        Ok(id)
    }

    /// All todos, oldest first
    ///
    /// On a store failure the configured [`ListFailurePolicy`] decides between
    /// an empty list and an error.
    pub fn get_all_todos(&mut self) -> TodoResult<Vec<Todo>> {
        match self.store.list() {
            Ok(todos) => Ok(todos),
            Err(e) => match self.list_failures {
                ListFailurePolicy::Lenient => {
                    error!(error = ?e, "Error getting todos, showing an empty list");
                    Ok(Vec::new())
                }
                ListFailurePolicy::Strict => Err(persistence_error(e, "Error getting todos", LIST_FAILED)),
            },
        }
    }

    /// Flip a todo's completed flag
    ///
    /// Returns the new flag, or `None` when no todo has that id (which is not
    /// an error). `updated_at` always moves forward, even within the clock's
    /// resolution.
    pub fn toggle_todo(&mut self, id: i64) -> TodoResult<Option<bool>> {
        let Some(todo) = self
            .store
            .get(id)
            .map_err(|e| persistence_error(e, "Error toggling todo", UPDATE_FAILED))?
        else {
            debug!(id, "Toggle on missing todo, nothing to do");
            return Ok(None);
        };

        let completed = !todo.completed;
        let updated_at = now().max(todo.updated_at + Duration::microseconds(1));

        self.store
            .update(id, completed, updated_at)
            .map_err(|e| persistence_error(e, "Error toggling todo", UPDATE_FAILED))?;

        info!(id, completed, "Toggled todo");
        Ok(Some(completed))
    }

    /// Delete a todo. Returns false when there was nothing to delete.
    pub fn delete_todo(&mut self, id: i64) -> TodoResult<bool> {
        let deleted = self
            .store
            .delete(id)
            .map_err(|e| persistence_error(e, "Error deleting todo", DELETE_FAILED))?;

        if deleted {
            info!(id, "Deleted todo");
        } else {
            debug!(id, "Delete on missing todo, nothing to do");
        }
        Ok(deleted)
    }

    /// Delete every todo, returning how many there were
    pub fn clear_all_todos(&mut self) -> TodoResult<usize> {
        let removed = self
            .store
            .clear()
            .map_err(|e| persistence_error(e, "Error clearing todos", CLEAR_FAILED))?;

        info!(removed, "Cleared todos");
        Ok(removed)
    }

    /// The whole collection as a pretty-printed JSON array
    ///
    /// Reads the store directly: a failing store is an error here whatever the
    /// list policy says, so an export never silently comes out empty.
    pub fn export_todos(&mut self) -> TodoResult<String> {
        let todos = self
            .store
            .list()
            .map_err(|e| persistence_error(e, "Error exporting todos", EXPORT_FAILED))?;

        let json = transfer::render_export(&todos)
            .map_err(|e| persistence_error(e.into(), "Error exporting todos", EXPORT_FAILED))?;

        info!(count = todos.len(), "Exported todos");
        Ok(json)
    }

    /// Replace the whole collection with the todos in a JSON document
    ///
    /// The document is checked before anything is touched. The replacement
    /// runs in a single transaction, so a failure leaves the previous
    /// collection in place. Returns the number of todos imported.
    pub fn import_todos(&mut self, json: &str) -> TodoResult<usize> {
        let todos = transfer::parse_import(json, now())?;

        let ids = self.store.replace_all(&todos).map_err(|e| {
            error!(error = ?e, "Error importing todos");
            TodoError::Persistence(format!("Failed to import todos: {}", e))
        })?;

        Ok(ids.len())
    }

    /// Completed and total counts of the current list
    pub fn stats(&mut self) -> TodoResult<TodoStats> {
        let todos = self.get_all_todos()?;
        Ok(TodoStats::from_todos(&todos))
    }

    /// Run one mutation, then re-read the list
    ///
    /// Both happen under the same `&mut self` borrow, so no other operation
    /// can land between the mutation and the read. The returned list is the
    /// state the mutation left behind.
    pub fn refresh_after<T, F>(&mut self, op: F) -> TodoResult<(T, Vec<Todo>)>
    where
        F: FnOnce(&mut Self) -> TodoResult<T>,
    {
        let value = op(self)?;
        let todos = self.get_all_todos()?;
        Ok((value, todos))
    }

    /// Close the store. The next operation reopens it.
    pub fn close(&mut self) {
        self.store.close();
    }
}

fn persistence_error(err: eyre::Report, action: &str, message: &str) -> TodoError {
    error!(error = ?err, "{}", action);
    TodoError::Persistence(message.to_string())
}
