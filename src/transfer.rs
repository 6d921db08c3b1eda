// JSON export and import documents

use crate::error::{TodoError, TodoResult};
use crate::record::{NewTodo, Todo, UNTITLED_TEXT};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub const INVALID_JSON: &str = "Invalid JSON file format";
pub const NOT_AN_ARRAY: &str = "Invalid JSON format - expected an array of todos";

/// Render todos as the export document: a JSON array, 2-space indented
pub fn render_export(todos: &[Todo]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(todos)
}

/// Suggested file name for an export taken on `date`
pub fn backup_file_name(date: NaiveDate) -> String {
    format!("todos-backup-{}.json", date.format("%Y-%m-%d"))
}

/// Parse an import document into todos ready for insertion
///
/// The top level must be a JSON array. Entries are read permissively: ids and
/// unknown keys are ignored, missing or unreadable fields fall back to
/// defaults, and `now` stands in for absent timestamps.
pub fn parse_import(input: &str, now: DateTime<Utc>) -> TodoResult<Vec<NewTodo>> {
    let value: Value = serde_json::from_str(input).map_err(|e| {
        warn!(error = %e, "Import document is not valid JSON");
        TodoError::Validation(INVALID_JSON.to_string())
    })?;

    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            warn!(kind = json_kind(&other), "Import document is not an array");
            return Err(TodoError::Validation(NOT_AN_ARRAY.to_string()));
        }
    };

    let empty = Map::new();
    let todos: Vec<NewTodo> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let fields = match entry {
                Value::Object(map) => map,
                other => {
                    debug!(index, kind = json_kind(other), "Import entry is not an object, using defaults");
                    &empty
                }
            };
            read_entry(index, fields, now)
        })
        .collect();

    info!(count = todos.len(), "Parsed import document");
    Ok(todos)
}

fn read_entry(index: usize, fields: &Map<String, Value>, now: DateTime<Utc>) -> NewTodo {
    NewTodo {
        text: entry_text(fields.get("text")),
        completed: fields.get("completed").is_some_and(is_truthy),
        created_at: entry_time(index, "createdAt", fields.get("createdAt"), now),
        updated_at: entry_time(index, "updatedAt", fields.get("updatedAt"), now),
    }
}

fn entry_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(other) if is_truthy(other) => other.to_string(),
        _ => UNTITLED_TEXT.to_string(),
    }
}

fn entry_time(index: usize, field: &str, value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(value) = value.filter(|v| is_truthy(v)) else {
        return now;
    };

    match parse_time(value) {
        Some(ts) => ts,
        None => {
            warn!(index, field, value = %value, "Unreadable timestamp, using import time");
            now
        }
    }
}

/// RFC 3339 string, `YYYY-MM-DD` date, or epoch milliseconds
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc).trunc_subsecs(6));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// JavaScript truthiness, which is what older exports were written against
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_none_or(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
