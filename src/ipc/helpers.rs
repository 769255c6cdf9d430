use crate::ipc::error::HandlerError;
use crate::ipc::types::AppState;
use rusqlite::Connection;

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerError> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerError::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::bad_params(format!("missing {}", key)))
}

/// Absent, null, and blank all mean "not given". A non-string value is a
/// caller bug.
pub fn optional_str(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerError> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerError::bad_params(format!(
                    "{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HandlerError::new(
                    "io_write_failed",
                    format!("failed to create {}: {}", parent.to_string_lossy(), e),
                )
            })?;
        }
    }
    std::fs::write(path, contents)
        .map_err(|e| HandlerError::new("io_write_failed", format!("failed to write {}: {}", path, e)))
}

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
