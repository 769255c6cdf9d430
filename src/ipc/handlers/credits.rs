use crate::aggregate::ExtraCredit;
use crate::ipc::error::{ok, HandlerError};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn fetch_credits(
    conn: &Connection,
    department: &str,
    year: Option<&str>,
) -> Result<Vec<ExtraCredit>, HandlerError> {
    let mut sql = String::from(
        "SELECT id, student_id, extra_sessions, reason, department, year, batch, added_at
         FROM extra_credits
         WHERE department = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(department.to_string())];
    if let Some(year) = year {
        sql.push_str(" AND year = ?");
        binds.push(Value::Text(year.to_string()));
    }
    sql.push_str(" ORDER BY added_at, id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    stmt.query_map(params_from_iter(binds), |r| {
        Ok(ExtraCredit {
            id: r.get(0)?,
            student_id: r.get(1)?,
            extra_sessions: r.get(2)?,
            reason: r.get(3)?,
            department: r.get(4)?,
            year: r.get(5)?,
            batch: r.get(6)?,
            added_at: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerError::db_query)
}

pub fn fetch_credits_for_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<ExtraCredit>, HandlerError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, student_id, extra_sessions, reason, department, year, batch, added_at
             FROM extra_credits
             WHERE student_id = ?
             ORDER BY added_at, id",
        )
        .map_err(HandlerError::db_query)?;
    stmt.query_map([student_id], |r| {
        Ok(ExtraCredit {
            id: r.get(0)?,
            student_id: r.get(1)?,
            extra_sessions: r.get(2)?,
            reason: r.get(3)?,
            department: r.get(4)?,
            year: r.get(5)?,
            batch: r.get(6)?,
            added_at: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerError::db_query)
}

// Credits are an append-only adjustment log. They only ever raise the
// attended count; the aggregation engine owns the cap at total.
fn credits_add(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = required_str(params, "studentId")?;
    let Some(extra_sessions) = params
        .get("extraSessions")
        .and_then(|v| v.as_i64())
        .filter(|n| *n >= 1)
    else {
        return Err(HandlerError::bad_params(
            "extraSessions must be a positive integer",
        ));
    };
    let reason = required_str(params, "reason")?;
    let department = required_str(params, "department")?;
    let year = required_str(params, "year")?;
    let batch = optional_str(params, "batch")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?;
    if exists.is_none() {
        return Err(HandlerError::not_found("student not found"));
    }

    let credit_id = Uuid::new_v4().to_string();
    let added_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO extra_credits(id, student_id, extra_sessions, reason,
                                   department, year, batch, added_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &credit_id,
            &student_id,
            extra_sessions,
            &reason,
            &department,
            &year,
            &batch,
            &added_at,
        ),
    )
    .map_err(|e| HandlerError::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "creditId": credit_id, "addedAt": added_at }))
}

fn credits_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let department = required_str(params, "department")?;
    let year = optional_str(params, "year")?;
    let credits = fetch_credits(conn, &department, year.as_deref())?;
    let rows: Vec<serde_json::Value> = credits
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "studentId": c.student_id,
                "extraSessions": c.extra_sessions,
                "reason": c.reason,
                "department": c.department,
                "year": c.year,
                "batch": c.batch,
                "addedAt": c.added_at,
            })
        })
        .collect();
    Ok(json!({ "credits": rows }))
}

fn respond(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerError>,
) -> serde_json::Value {
    match db_conn(state).and_then(|conn| f(conn, &req.params)) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "credits.add" => Some(respond(state, req, credits_add)),
        "credits.list" => Some(respond(state, req, credits_list)),
        _ => None,
    }
}
