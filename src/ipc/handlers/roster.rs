use crate::aggregate::Student;
use crate::export::parse_csv_record;
use crate::ipc::error::{ok, HandlerError};
use crate::ipc::helpers::{db_conn, is_constraint_violation, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RosterFilters {
    pub department: String,
    pub year: Option<String>,
    pub batch: Option<String>,
}

impl RosterFilters {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, HandlerError> {
        Ok(Self {
            department: required_str(params, "department")?,
            year: optional_str(params, "year")?,
            batch: optional_str(params, "batch")?,
        })
    }
}

pub fn fetch_students(
    conn: &Connection,
    filters: &RosterFilters,
) -> Result<Vec<Student>, HandlerError> {
    let mut sql = String::from(
        "SELECT id, name, roll_no, department, year, batch
         FROM students
         WHERE department = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(filters.department.clone())];
    if let Some(year) = &filters.year {
        sql.push_str(" AND year = ?");
        binds.push(Value::Text(year.clone()));
    }
    if let Some(batch) = &filters.batch {
        sql.push_str(" AND batch = ?");
        binds.push(Value::Text(batch.clone()));
    }
    sql.push_str(" ORDER BY roll_no");

    let mut stmt = conn.prepare(&sql).map_err(HandlerError::db_query)?;
    stmt.query_map(params_from_iter(binds), |r| {
        Ok(Student {
            id: r.get(0)?,
            name: r.get(1)?,
            roll_no: r.get(2)?,
            department: r.get(3)?,
            year: r.get(4)?,
            batch: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerError::db_query)
}

pub fn fetch_student_by_id(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<Student>, HandlerError> {
    conn.query_row(
        "SELECT id, name, roll_no, department, year, batch FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(Student {
                id: r.get(0)?,
                name: r.get(1)?,
                roll_no: r.get(2)?,
                department: r.get(3)?,
                year: r.get(4)?,
                batch: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerError::db_query)
}

fn student_json(s: &Student) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "rollNo": s.roll_no,
        "department": s.department,
        "year": s.year,
        "batch": s.batch,
    })
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let name = required_str(params, "name")?;
    let roll_no = required_str(params, "rollNo")?;
    let department = required_str(params, "department")?;
    let year = required_str(params, "year")?;
    let batch = optional_str(params, "batch")?;

    let student_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO students(id, name, roll_no, department, year, batch, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &roll_no,
            &department,
            &year,
            &batch,
            &created_at,
        ),
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            HandlerError::with_details(
                "conflict",
                "roll number already exists for this department and year",
                json!({ "rollNo": roll_no }),
            )
        } else {
            HandlerError::new("db_insert_failed", e.to_string())
        }
    })?;

    Ok(json!({ "studentId": student_id }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let filters = RosterFilters::from_params(params)?;
    let students = fetch_students(conn, &filters)?;
    let rows: Vec<serde_json::Value> = students.iter().map(student_json).collect();
    Ok(json!({ "students": rows }))
}

// Students are immutable after creation apart from this one
// administrative action. Null or absent batch clears the assignment.
fn students_set_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = required_str(params, "studentId")?;
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

    conn.execute(
        "UPDATE students SET batch = ? WHERE id = ?",
        (&batch, &student_id),
    )
    .map_err(|e| HandlerError::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "studentId": student_id, "batch": batch }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerError::db_query)?;
    if exists.is_none() {
        return Err(HandlerError::not_found("student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerError::new("db_tx_failed", e.to_string()))?;
    // Delete in dependency order; no ON DELETE CASCADE in the schema.
    tx.execute(
        "DELETE FROM session_entries WHERE student_id = ?",
        [&student_id],
    )
    .map_err(|e| HandlerError::new("db_delete_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM extra_credits WHERE student_id = ?",
        [&student_id],
    )
    .map_err(|e| HandlerError::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| HandlerError::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerError::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "deleted": true }))
}

const IMPORT_HEADER: [&str; 4] = ["roll_no", "name", "year", "batch"];

fn students_import_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let department = required_str(params, "department")?;
    let csv = required_str(params, "csv")?;

    let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Err(HandlerError::bad_params("csv has no header row"));
    };
    let header: Vec<String> = parse_csv_record(header_line)
        .iter()
        .map(|f| f.trim().to_ascii_lowercase())
        .collect();
    if header != IMPORT_HEADER {
        return Err(HandlerError::with_details(
            "bad_params",
            "csv header must be roll_no,name,year,batch",
            json!({ "header": header }),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerError::new("db_tx_failed", e.to_string()))?;

    let mut imported = 0usize;
    let mut malformed = 0usize;
    let mut duplicates = 0usize;
    for line in lines {
        let fields = parse_csv_record(line);
        if fields.len() < 3 {
            malformed += 1;
            continue;
        }
        let roll_no = fields[0].trim();
        let name = fields[1].trim();
        let year = fields[2].trim();
        if roll_no.is_empty() || name.is_empty() || year.is_empty() {
            malformed += 1;
            continue;
        }
        let batch = fields
            .get(3)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|f| f.to_string());

        let student_id = Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let insert = tx.execute(
            "INSERT INTO students(id, name, roll_no, department, year, batch, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &student_id,
                name,
                roll_no,
                &department,
                year,
                &batch,
                &created_at,
            ),
        );
        match insert {
            Ok(_) => imported += 1,
            Err(e) if is_constraint_violation(&e) => duplicates += 1,
            Err(e) => return Err(HandlerError::new("db_insert_failed", e.to_string())),
        }
    }

    tx.commit()
        .map_err(|e| HandlerError::new("db_commit_failed", e.to_string()))?;

    if malformed > 0 || duplicates > 0 {
        tracing::warn!(malformed, duplicates, "roster import skipped rows");
    }

    Ok(json!({
        "importedCount": imported,
        "malformedCount": malformed,
        "duplicateCount": duplicates,
    }))
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
        "students.create" => Some(respond(state, req, students_create)),
        "students.list" => Some(respond(state, req, students_list)),
        "students.setBatch" => Some(respond(state, req, students_set_batch)),
        "students.delete" => Some(respond(state, req, students_delete)),
        "students.importCsv" => Some(respond(state, req, students_import_csv)),
        _ => None,
    }
}
