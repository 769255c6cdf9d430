use crate::aggregate::{AttendanceEntry, SessionRecord, SessionType};
use crate::ipc::error::{ok, HandlerError};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionFilters {
    pub department: String,
    pub year: Option<String>,
    pub subject_name: Option<String>,
    pub batch: Option<String>,
    pub teacher_id: Option<String>,
}

impl SessionFilters {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, HandlerError> {
        Ok(Self {
            department: required_str(params, "department")?,
            year: optional_str(params, "year")?,
            subject_name: optional_str(params, "subjectName")?,
            batch: optional_str(params, "batch")?,
            teacher_id: optional_str(params, "teacherId")?,
        })
    }
}

/// Loads session records with their nested attendance entries. Rows
/// whose session_type column does not decode are dropped and counted,
/// never fatal; the second element reports how many were dropped.
pub fn fetch_sessions(
    conn: &Connection,
    filters: &SessionFilters,
) -> Result<(Vec<SessionRecord>, usize), HandlerError> {
    let mut sql = String::from(
        "SELECT id, teacher_id, department, year, subject_name, session_type,
                batch, sessions_count, date
         FROM sessions
         WHERE department = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(filters.department.clone())];
    if let Some(year) = &filters.year {
        sql.push_str(" AND year = ?");
        binds.push(Value::Text(year.clone()));
    }
    if let Some(subject) = &filters.subject_name {
        sql.push_str(" AND subject_name = ?");
        binds.push(Value::Text(subject.clone()));
    }
    if let Some(batch) = &filters.batch {
        sql.push_str(" AND batch = ?");
        binds.push(Value::Text(batch.clone()));
    }
    if let Some(teacher) = &filters.teacher_id {
        sql.push_str(" AND teacher_id = ?");
        binds.push(Value::Text(teacher.clone()));
    }
    sql.push_str(" ORDER BY date, id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    let raw_rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, i64>(7)?,
                r.get::<_, String>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;

    let mut undecodable = 0usize;
    let mut records: Vec<SessionRecord> = Vec::with_capacity(raw_rows.len());
    for (id, teacher_id, department, year, subject_name, type_raw, batch, sessions_count, date) in
        raw_rows
    {
        let Some(session_type) = SessionType::parse(&type_raw) else {
            undecodable += 1;
            continue;
        };
        records.push(SessionRecord {
            id,
            teacher_id,
            department,
            year,
            subject_name,
            session_type,
            batch,
            sessions_count,
            date,
            entries: Vec::new(),
        });
    }

    if !records.is_empty() {
        let ids: Vec<&str> = records.iter().map(|s| s.id.as_str()).collect();
        let placeholders = std::iter::repeat("?")
            .take(ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let entries_sql = format!(
            "SELECT session_id, student_id, is_present
             FROM session_entries
             WHERE session_id IN ({})
             ORDER BY session_id, sort_order",
            placeholders
        );
        let bind_ids: Vec<Value> = ids.iter().map(|id| Value::Text(id.to_string())).collect();
        let mut entries_stmt = conn.prepare(&entries_sql).map_err(HandlerError::db_query)?;
        let entry_rows = entries_stmt
            .query_map(params_from_iter(bind_ids), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)? != 0,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerError::db_query)?;

        let mut by_session: HashMap<String, Vec<AttendanceEntry>> = HashMap::new();
        for (session_id, student_id, is_present) in entry_rows {
            by_session.entry(session_id).or_default().push(AttendanceEntry {
                student_id,
                is_present,
            });
        }
        for record in &mut records {
            if let Some(entries) = by_session.remove(&record.id) {
                record.entries = entries;
            }
        }
    }

    Ok((records, undecodable))
}

fn parse_sessions_count(
    params: &serde_json::Value,
    session_type: SessionType,
) -> Result<i64, HandlerError> {
    match params.get("sessionsCount") {
        None => Ok(session_type.default_sessions_count()),
        Some(v) if v.is_null() => Ok(session_type.default_sessions_count()),
        Some(v) => {
            let Some(n) = v.as_i64().filter(|n| *n >= 1) else {
                return Err(HandlerError::bad_params(
                    "sessionsCount must be a positive integer",
                ));
            };
            Ok(n)
        }
    }
}

fn parse_attendance_data(
    params: &serde_json::Value,
) -> Result<Vec<AttendanceEntry>, HandlerError> {
    let Some(raw) = params.get("attendanceData").and_then(|v| v.as_array()) else {
        return Err(HandlerError::bad_params("missing attendanceData"));
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut entries: Vec<AttendanceEntry> = Vec::with_capacity(raw.len());
    for item in raw {
        let Some(student_id) = item.get("studentId").and_then(|v| v.as_str()) else {
            return Err(HandlerError::bad_params(
                "attendanceData entries need a studentId",
            ));
        };
        let Some(is_present) = item.get("isPresent").and_then(|v| v.as_bool()) else {
            return Err(HandlerError::bad_params(
                "attendanceData entries need a boolean isPresent",
            ));
        };
        // At most one entry per student per session.
        if !seen.insert(student_id.to_string()) {
            return Err(HandlerError::with_details(
                "conflict",
                "duplicate attendance entry for student",
                json!({ "studentId": student_id }),
            ));
        }
        entries.push(AttendanceEntry {
            student_id: student_id.to_string(),
            is_present,
        });
    }
    Ok(entries)
}

// Sessions are an append-only log: one insert per class meeting, no
// update surface at all.
fn sessions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let teacher_id = required_str(params, "teacherId")?;
    let department = required_str(params, "department")?;
    let year = required_str(params, "year")?;
    let subject_name = required_str(params, "subjectName")?;
    let type_raw = required_str(params, "sessionType")?;
    let Some(session_type) = SessionType::parse(&type_raw) else {
        return Err(HandlerError::bad_params(
            "sessionType must be lecture or practical",
        ));
    };
    let batch = optional_str(params, "batch")?;
    match session_type {
        SessionType::Practical if batch.is_none() => {
            return Err(HandlerError::bad_params(
                "practical sessions require a batch",
            ));
        }
        SessionType::Lecture if batch.is_some() => {
            return Err(HandlerError::bad_params(
                "lecture sessions are year-wide and take no batch",
            ));
        }
        _ => {}
    }
    let sessions_count = parse_sessions_count(params, session_type)?;
    let date = required_str(params, "date")?;
    if NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
        return Err(HandlerError::bad_params("date must be YYYY-MM-DD"));
    }
    let entries = parse_attendance_data(params)?;

    let session_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO sessions(id, teacher_id, department, year, subject_name,
                              session_type, batch, sessions_count, date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &teacher_id,
            &department,
            &year,
            &subject_name,
            session_type.as_str(),
            &batch,
            sessions_count,
            &date,
            &created_at,
        ),
    )
    .map_err(|e| HandlerError::new("db_insert_failed", e.to_string()))?;

    for (i, entry) in entries.iter().enumerate() {
        tx.execute(
            "INSERT INTO session_entries(session_id, student_id, is_present, sort_order)
             VALUES(?, ?, ?, ?)",
            (
                &session_id,
                &entry.student_id,
                entry.is_present as i64,
                i as i64,
            ),
        )
        .map_err(|e| HandlerError::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerError::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "sessionId": session_id, "sessionsCount": sessions_count }))
}

fn session_json(s: &SessionRecord) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = s
        .entries
        .iter()
        .map(|e| json!({ "studentId": e.student_id, "isPresent": e.is_present }))
        .collect();
    json!({
        "id": s.id,
        "teacherId": s.teacher_id,
        "department": s.department,
        "year": s.year,
        "subjectName": s.subject_name,
        "sessionType": s.session_type.as_str(),
        "batch": s.batch,
        "sessionsCount": s.sessions_count,
        "date": s.date,
        "attendanceData": entries,
    })
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let filters = SessionFilters::from_params(params)?;
    let (records, undecodable) = fetch_sessions(conn, &filters)?;
    let rows: Vec<serde_json::Value> = records.iter().map(session_json).collect();
    Ok(json!({ "sessions": rows, "skippedSessions": undecodable }))
}

fn sessions_subjects(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let department = required_str(params, "department")?;
    let year = optional_str(params, "year")?;

    let mut sql = String::from(
        "SELECT DISTINCT subject_name FROM sessions WHERE department = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(department)];
    if let Some(year) = year {
        sql.push_str(" AND year = ?");
        binds.push(Value::Text(year));
    }
    sql.push_str(" ORDER BY subject_name");

    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    let subjects = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerError::db_query)?;

    Ok(json!({ "subjects": subjects }))
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
        "sessions.create" => Some(respond(state, req, sessions_create)),
        "sessions.list" => Some(respond(state, req, sessions_list)),
        "sessions.subjects" => Some(respond(state, req, sessions_subjects)),
        _ => None,
    }
}
