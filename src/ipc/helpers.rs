use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

/// Trimmed, non-empty string parameter.
pub fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn bool_param(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

/// `Some(true)` when the semester exists and is locked.
pub fn semester_locked(conn: &Connection, semester_id: &str) -> rusqlite::Result<Option<bool>> {
    conn.query_row(
        "SELECT locked FROM semesters WHERE id = ?",
        [semester_id],
        |r| r.get::<_, i64>(0).map(|v| v != 0),
    )
    .optional()
}
