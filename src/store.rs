// SQLite record store for todos

use crate::error::TodoError;
use crate::record::{NewTodo, Todo};
use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const CURRENT_VERSION: i64 = 1;

const DB_FILE: &str = "todos.db";
const LOCK_FILE: &str = "todos.lock";
const DB_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

const SELECT_COLUMNS: &str = "SELECT id, text, completed, created_at, updated_at FROM todos";

#[derive(Debug, Clone)]
enum Location {
    Dir(PathBuf),
    Memory,
}

/// Handle to the todo database
///
/// Nothing touches the disk until the first call to [`RecordStore::open`] (or
/// any operation, which opens implicitly). The handle then stays open until
/// [`RecordStore::close`] or drop. While open it holds an exclusive lock on
/// `todos.lock`, so a second handle on the same directory cannot open.
pub struct RecordStore {
    location: Location,
    db: Option<Connection>,
    lock: Option<File>,
}

impl RecordStore {
    /// Store kept in `dir` as `todos.db`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            location: Location::Dir(dir.as_ref().to_path_buf()),
            db: None,
            lock: None,
        }
    }

    /// Private in-memory store, gone when the handle is dropped
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            db: None,
            lock: None,
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// Open the database, or return the connection if already open
    ///
    /// A database that fails to open (unreadable file, not a database, failed
    /// integrity check) is deleted and recreated empty, once. If that fails
    /// too the store is unavailable. Lock contention is reported straight
    /// away and never triggers the recreate.
    pub fn open(&mut self) -> Result<&mut Connection, TodoError> {
        if self.db.is_none() {
            let db = self.open_with_recovery()?;
            self.db = Some(db);
        }

        self.db
            .as_mut()
            .ok_or_else(|| TodoError::StorageUnavailable("database handle missing".to_string()))
    }

    /// Drop the connection and release the directory lock
    pub fn close(&mut self) {
        if self.db.take().is_some() {
            debug!(location = ?self.location, "Closed todo database");
        }
        self.lock = None;
    }

    fn open_with_recovery(&mut self) -> Result<Connection, TodoError> {
        if let Location::Dir(dir) = &self.location {
            let dir = dir.clone();
            self.acquire_lock(&dir)?;
        }

        let result = match self.try_open() {
            Ok(db) => Ok(db),
            Err(e) => match e.downcast_ref::<TodoError>() {
                // Refused outright, never recreated
                Some(TodoError::StorageUnavailable(reason)) => {
                    error!(location = ?self.location, reason = %reason, "Refusing to open todo database");
                    Err(TodoError::StorageUnavailable(reason.clone()))
                }
                _ => {
                    warn!(location = ?self.location, error = ?e, "Failed to open todo database, recreating it");
                    self.remove_database_files();

                    self.try_open().map_err(|e| {
                        error!(location = ?self.location, error = ?e, "Todo database unavailable after recreate");
                        TodoError::StorageUnavailable("could not open the todo database".to_string())
                    })
                }
            },
        };

        if result.is_err() {
            self.lock = None;
        }
        result
    }

    fn acquire_lock(&mut self, dir: &Path) -> Result<(), TodoError> {
        if self.lock.is_some() {
            return Ok(());
        }

        let file = fs::create_dir_all(dir)
            .and_then(|_| {
                OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(dir.join(LOCK_FILE))
            })
            .map_err(|e| {
                error!(dir = ?dir, error = ?e, "Failed to create store directory");
                TodoError::StorageUnavailable("could not create the store directory".to_string())
            })?;

        file.try_lock_exclusive().map_err(|e| {
            warn!(dir = ?dir, error = ?e, "Store is locked");
            TodoError::StorageUnavailable("the store is in use by another process".to_string())
        })?;

        self.lock = Some(file);
        Ok(())
    }

    fn try_open(&self) -> Result<Connection> {
        let db = match &self.location {
            Location::Dir(dir) => {
                let path = dir.join(DB_FILE);
                Connection::open(&path).with_context(|| format!("Failed to open SQLite database {:?}", path))?
            }
            Location::Memory => Connection::open_in_memory().context("Failed to open in-memory database")?,
        };

        Self::check_version(&db)?;
        Self::create_schema(&db)?;
        Self::check_integrity(&db)?;
        Self::write_version(&db)?;

        info!(location = ?self.location, "Opened todo database");
        Ok(db)
    }

    fn create_schema(db: &Connection) -> Result<()> {
        debug!("Creating database schema");

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS todos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_todos_created_at ON todos(created_at);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(())
    }

    fn check_integrity(db: &Connection) -> Result<()> {
        let status: String = db
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("Failed to run integrity check")?;

        if status != "ok" {
            return Err(eyre!("Integrity check failed: {}", status));
        }
        Ok(())
    }

    /// A schema newer than this build understands is refused, not wiped
    fn check_version(db: &Connection) -> Result<()> {
        let version: i64 = db.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > CURRENT_VERSION {
            return Err(TodoError::StorageUnavailable(format!(
                "database schema version {} is newer than supported version {}",
                version, CURRENT_VERSION
            ))
            .into());
        }
        Ok(())
    }

    fn write_version(db: &Connection) -> Result<()> {
        let version: i64 = db.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        match version {
            0 => db.execute_batch(&format!("PRAGMA user_version = {}", CURRENT_VERSION))?,
            CURRENT_VERSION => {}
            other => warn!(
                found = other,
                expected = CURRENT_VERSION,
                "Todo database has an unexpected schema version"
            ),
        }
        Ok(())
    }

    fn remove_database_files(&mut self) {
        self.db = None;

        let Location::Dir(dir) = &self.location else {
            return;
        };

        let db_path = dir.join(DB_FILE);
        let mut paths = vec![db_path.clone()];
        for suffix in DB_SIDECARS {
            let mut name = db_path.clone().into_os_string();
            name.push(suffix);
            paths.push(PathBuf::from(name));
        }

        for path in paths {
            if !path.exists() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => info!(file = ?path, "Removed damaged database file"),
                Err(e) => warn!(file = ?path, error = ?e, "Failed to remove database file"),
            }
        }
    }

    // ========================================================================
    // Record operations
    // ========================================================================

    /// Insert a todo and return the id the database assigned
    pub fn insert(&mut self, todo: &NewTodo) -> Result<i64> {
        let db = self.open()?;
        Self::insert_row(db, todo)
    }

    /// Get a todo by id
    pub fn get(&mut self, id: i64) -> Result<Option<Todo>> {
        let db = self.open()?;

        let row = db
            .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), [id], TodoRow::from_row)
            .optional()
            .context("Failed to read todo")?;

        row.map(TodoRow::into_todo).transpose()
    }

    /// Set completion and update time of a todo. Returns false if no such id.
    pub fn update(&mut self, id: i64, completed: bool, updated_at: DateTime<Utc>) -> Result<bool> {
        let db = self.open()?;

        let changed = db
            .execute(
                "UPDATE todos SET completed = ?1, updated_at = ?2 WHERE id = ?3",
                params![completed, updated_at.timestamp_micros(), id],
            )
            .context("Failed to update todo")?;

        Ok(changed > 0)
    }

    /// Delete a todo. Returns false if no such id.
    pub fn delete(&mut self, id: i64) -> Result<bool> {
        let db = self.open()?;

        let changed = db
            .execute("DELETE FROM todos WHERE id = ?1", [id])
            .context("Failed to delete todo")?;

        Ok(changed > 0)
    }

    /// Delete every todo, returning how many were removed
    pub fn clear(&mut self) -> Result<usize> {
        let db = self.open()?;
        let removed = db.execute("DELETE FROM todos", []).context("Failed to clear todos")?;
        Ok(removed)
    }

    /// All todos, oldest first
    pub fn list(&mut self) -> Result<Vec<Todo>> {
        let db = self.open()?;

        let mut stmt = db.prepare(&format!("{} ORDER BY created_at ASC, id ASC", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], TodoRow::from_row)?;

        let mut todos = Vec::new();
        for row in rows {
            todos.push(row?.into_todo()?);
        }
        Ok(todos)
    }

    #[cfg(test)]
    fn count(&mut self) -> Result<usize> {
        let db = self.open()?;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM todos", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Replace the whole collection in one transaction
    ///
    /// Either every existing todo is gone and every new one is in, or nothing
    /// changed. Returns the assigned ids in input order.
    pub fn replace_all(&mut self, todos: &[NewTodo]) -> Result<Vec<i64>> {
        let db = self.open()?;
        let tx = db.transaction().context("Failed to begin transaction")?;

        let removed = tx.execute("DELETE FROM todos", [])?;

        let mut ids = Vec::with_capacity(todos.len());
        for todo in todos {
            ids.push(Self::insert_row(&tx, todo)?);
        }

        tx.commit().context("Failed to commit replacement")?;

        info!(removed, inserted = ids.len(), "Replaced todo collection");
        Ok(ids)
    }

    fn insert_row(db: &Connection, todo: &NewTodo) -> Result<i64> {
        db.execute(
            "INSERT INTO todos (text, completed, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                todo.text,
                todo.completed,
                todo.created_at.timestamp_micros(),
                todo.updated_at.timestamp_micros()
            ],
        )
        .context("Failed to insert todo")?;

        Ok(db.last_insert_rowid())
    }
}

/// Raw row, before timestamps are checked
struct TodoRow {
    id: i64,
    text: String,
    completed: bool,
    created_at: i64,
    updated_at: i64,
}

impl TodoRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            completed: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_todo(self) -> Result<Todo> {
        Ok(Todo {
            id: self.id,
            text: self.text,
            completed: self.completed,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| eyre!("Timestamp out of range: {}", micros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn new_todo(text: &str, created_at: DateTime<Utc>) -> NewTodo {
        NewTodo {
            text: text.to_string(),
            completed: false,
            created_at,
            updated_at: created_at,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_open_creates_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("store");

        let mut store = RecordStore::new(&dir);
        assert!(!store.is_open());
        assert!(!dir.exists());

        store.open().unwrap();
        assert!(store.is_open());
        assert!(dir.join(DB_FILE).exists());
        assert!(dir.join(LOCK_FILE).exists());
    }

    #[test]
    fn test_open_is_idempotent() {
        let mut store = RecordStore::in_memory();
        let id = store.insert(&NewTodo::now("kept")).unwrap();

        // A second open must hand back the same database, not a fresh one
        store.open().unwrap();
        assert!(store.get(id).unwrap().is_some());
    }

    #[test]
    fn test_schema_version_written() {
        let mut store = RecordStore::in_memory();
        let db = store.open().unwrap();
        let version: i64 = db.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_insert_and_get() {
        let mut store = RecordStore::in_memory();

        let id = store.insert(&new_todo("Buy milk", base_time())).unwrap();
        let todo = store.get(id).unwrap().unwrap();

        assert_eq!(todo.id, id);
        assert_eq!(todo.text, "Buy milk");
        assert!(!todo.completed);
        assert_eq!(todo.created_at, base_time());
        assert_eq!(todo.updated_at, base_time());
    }

    #[test]
    fn test_get_nonexistent() {
        let mut store = RecordStore::in_memory();
        assert!(store.get(42).unwrap().is_none());
    }

    #[test]
    fn test_ids_increase() {
        let mut store = RecordStore::in_memory();
        let first = store.insert(&NewTodo::now("a")).unwrap();
        let second = store.insert(&NewTodo::now("b")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_ids_not_reused_after_clear() {
        let mut store = RecordStore::in_memory();
        let first = store.insert(&NewTodo::now("a")).unwrap();
        store.clear().unwrap();
        let second = store.insert(&NewTodo::now("b")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_update() {
        let mut store = RecordStore::in_memory();
        let id = store.insert(&new_todo("a", base_time())).unwrap();

        let later = base_time() + Duration::minutes(5);
        assert!(store.update(id, true, later).unwrap());

        let todo = store.get(id).unwrap().unwrap();
        assert!(todo.completed);
        assert_eq!(todo.updated_at, later);
        assert_eq!(todo.created_at, base_time());

        assert!(!store.update(id + 100, true, later).unwrap());
    }

    #[test]
    fn test_delete() {
        let mut store = RecordStore::in_memory();
        let id = store.insert(&NewTodo::now("a")).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
        assert!(!store.delete(id).unwrap());
    }

    #[test]
    fn test_list_ordered_by_created_at() {
        let mut store = RecordStore::in_memory();

        store.insert(&new_todo("third", base_time() + Duration::hours(2))).unwrap();
        store.insert(&new_todo("first", base_time())).unwrap();
        store.insert(&new_todo("second", base_time() + Duration::hours(1))).unwrap();

        let texts: Vec<String> = store.list().unwrap().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_list_ties_broken_by_id() {
        let mut store = RecordStore::in_memory();
        let a = store.insert(&new_todo("a", base_time())).unwrap();
        let b = store.insert(&new_todo("b", base_time())).unwrap();

        let ids: Vec<i64> = store.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_clear_and_count() {
        let mut store = RecordStore::in_memory();
        for i in 0..3 {
            store.insert(&NewTodo::now(format!("todo {}", i))).unwrap();
        }
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.clear().unwrap(), 3);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_replace_all() {
        let mut store = RecordStore::in_memory();
        store.insert(&NewTodo::now("old")).unwrap();

        let ids = store
            .replace_all(&[new_todo("new 1", base_time()), new_todo("new 2", base_time())])
            .unwrap();
        assert_eq!(ids.len(), 2);

        let texts: Vec<String> = store.list().unwrap().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["new 1", "new 2"]);
    }

    #[test]
    fn test_replace_all_rolls_back_on_failure() {
        let mut store = RecordStore::in_memory();
        store.insert(&NewTodo::now("survivor")).unwrap();

        store
            .open()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON todos WHEN NEW.text = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
            )
            .unwrap();

        let result = store.replace_all(&[new_todo("fine", base_time()), new_todo("boom", base_time())]);
        assert!(result.is_err());

        let texts: Vec<String> = store.list().unwrap().into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["survivor"]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();

        let id = {
            let mut store = RecordStore::new(temp.path());
            store.insert(&NewTodo::now("durable")).unwrap()
        };

        let mut store = RecordStore::new(temp.path());
        let todo = store.get(id).unwrap().unwrap();
        assert_eq!(todo.text, "durable");
    }

    #[test]
    fn test_second_handle_is_locked_out() {
        let temp = TempDir::new().unwrap();

        let mut first = RecordStore::new(temp.path());
        first.open().unwrap();

        let mut second = RecordStore::new(temp.path());
        let err = second.open().unwrap_err();
        assert!(err.is_storage_unavailable());

        first.close();
        assert!(!first.is_open());
        second.open().unwrap();
    }

    #[test]
    fn test_recovers_from_corrupt_database() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(DB_FILE),
            "this is definitely not a sqlite database ".repeat(200),
        )
        .unwrap();

        let mut store = RecordStore::new(temp.path());
        store.open().unwrap();
        assert_eq!(store.count().unwrap(), 0);

        // Recreated store is fully usable
        let id = store.insert(&NewTodo::now("fresh start")).unwrap();
        assert!(store.get(id).unwrap().is_some());
    }

    #[test]
    fn test_unavailable_when_recreate_fails() {
        let temp = TempDir::new().unwrap();
        // A directory where the database file should be cannot be opened or removed
        let blocker = temp.path().join(DB_FILE);
        fs::create_dir_all(&blocker).unwrap();
        fs::write(blocker.join("keep"), "x").unwrap();

        let mut store = RecordStore::new(temp.path());
        let err = store.open().unwrap_err();
        assert!(err.is_storage_unavailable());
        assert!(!store.is_open());
        assert!(blocker.join("keep").exists());
    }

    #[test]
    fn test_failed_open_releases_lock() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join(DB_FILE);
        fs::create_dir_all(blocker.join("nested")).unwrap();

        let mut first = RecordStore::new(temp.path());
        assert!(first.open().is_err());

        // Once the damage is gone another handle gets in
        fs::remove_dir_all(&blocker).unwrap();
        let mut second = RecordStore::new(temp.path());
        second.open().unwrap();
        assert_eq!(second.count().unwrap(), 0);
    }

    #[test]
    fn test_refuses_newer_schema_version() {
        let temp = TempDir::new().unwrap();
        {
            let mut store = RecordStore::new(temp.path());
            store.insert(&NewTodo::now("written by a newer build")).unwrap();
            store.open().unwrap().execute_batch("PRAGMA user_version = 2").unwrap();
        }

        let mut store = RecordStore::new(temp.path());
        let err = store.open().unwrap_err();
        assert!(err.is_storage_unavailable());
        assert!(err.to_string().contains("newer than supported"));
        assert!(!store.is_open());

        // The database is left as it was
        let db = Connection::open(temp.path().join(DB_FILE)).unwrap();
        let version: i64 = db.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        let count: i64 = db.query_row("SELECT COUNT(*) FROM todos", [], |row| row.get(0)).unwrap();
        assert_eq!(version, 2);
        assert_eq!(count, 1);

        // and the lock is free, so the refusal is about the version, not contention
        let err = RecordStore::new(temp.path()).open().unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_operations_report_unavailable_store() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(DB_FILE).join("nested")).unwrap();

        let mut store = RecordStore::new(temp.path());
        assert!(store.insert(&NewTodo::now("a")).is_err());
        assert!(store.list().is_err());
    }
}
