use crate::aggregate::{
    self, AggregateOptions, ZeroSessionPolicy, DEFAULT_THRESHOLD_PERCENT,
};
use crate::export::{self, ExportError};
use crate::ipc::error::{ok, HandlerError};
use crate::ipc::helpers::{db_conn, optional_str, required_str, write_text_file};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;

use super::{credits, roster, sessions};

// One filter selection as the UI sends it. The selectionToken is opaque
// and echoed back untouched: a client that changed filters while this
// request was in flight drops the stale response by token mismatch
// (last selection wins).
#[derive(Debug, Clone)]
struct ReportSelection {
    roster: roster::RosterFilters,
    subject_name: Option<String>,
    threshold_percent: f64,
    zero_session_policy: ZeroSessionPolicy,
    selection_token: Option<String>,
}

fn parse_selection(params: &serde_json::Value) -> Result<ReportSelection, HandlerError> {
    let roster = roster::RosterFilters::from_params(params)?;
    let subject_name = optional_str(params, "subjectName")?;

    let threshold_percent = match params.get("thresholdPercent") {
        None => DEFAULT_THRESHOLD_PERCENT,
        Some(v) if v.is_null() => DEFAULT_THRESHOLD_PERCENT,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerError::bad_params("thresholdPercent must be a number"))?,
    };

    let zero_session_policy = match optional_str(params, "zeroSessionPolicy")? {
        None => ZeroSessionPolicy::Include,
        Some(raw) => ZeroSessionPolicy::parse(&raw).ok_or_else(|| {
            HandlerError::bad_params("zeroSessionPolicy must be include or omit")
        })?,
    };

    Ok(ReportSelection {
        roster,
        subject_name,
        threshold_percent,
        zero_session_policy,
        selection_token: optional_str(params, "selectionToken")?,
    })
}

fn selection_filters_json(sel: &ReportSelection, threshold_applied: f64) -> serde_json::Value {
    json!({
        "department": sel.roster.department,
        "year": sel.roster.year,
        "batch": sel.roster.batch,
        "subjectName": sel.subject_name,
        "thresholdPercent": threshold_applied,
        "zeroSessionPolicy": sel.zero_session_policy.as_str(),
    })
}

// Sessions are fetched by department + year only: lectures carry no
// batch, so a literal batch equality filter would drop them. Batch
// scoping and the subject filter are the engine's job.
fn session_filters_for(sel: &ReportSelection) -> sessions::SessionFilters {
    sessions::SessionFilters {
        department: sel.roster.department.clone(),
        year: sel.roster.year.clone(),
        subject_name: None,
        batch: None,
        teacher_id: None,
    }
}

fn run_aggregation(
    conn: &Connection,
    sel: &ReportSelection,
) -> Result<(aggregate::AttendanceReport, usize, bool, bool), HandlerError> {
    let students = roster::fetch_students(conn, &sel.roster)?;
    let (session_records, undecodable) =
        sessions::fetch_sessions(conn, &session_filters_for(sel))?;
    let credit_records = credits::fetch_credits(
        conn,
        &sel.roster.department,
        sel.roster.year.as_deref(),
    )?;

    let options = AggregateOptions {
        subject: sel.subject_name.clone(),
        threshold_percent: sel.threshold_percent,
        zero_session_policy: sel.zero_session_policy,
    };
    let empty_roster = students.is_empty();
    let empty_sessions = session_records.is_empty();
    let report = aggregate::aggregate(&students, &session_records, &credit_records, &options);

    let skipped_sessions = report.skipped_sessions + undecodable;
    if skipped_sessions > 0 || report.skipped_entries > 0 {
        tracing::warn!(
            skipped_sessions,
            skipped_entries = report.skipped_entries,
            department = %sel.roster.department,
            "aggregation dropped records"
        );
    }

    Ok((report, skipped_sessions, empty_roster, empty_sessions))
}

fn summary_response(
    sel: &ReportSelection,
    report: &aggregate::AttendanceReport,
    skipped_sessions: usize,
    empty_roster: bool,
    empty_sessions: bool,
) -> serde_json::Value {
    json!({
        "filters": selection_filters_json(sel, report.threshold_percent),
        "selectionToken": sel.selection_token,
        "rows": &report.rows,
        "rowCount": report.rows.len(),
        "skippedEntries": report.skipped_entries,
        "skippedSessions": skipped_sessions,
        "emptyRoster": empty_roster,
        "emptySessions": empty_sessions,
    })
}

fn attendance_summary_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let sel = parse_selection(params)?;
    let (report, skipped_sessions, empty_roster, empty_sessions) = run_aggregation(conn, &sel)?;
    Ok(summary_response(
        &sel,
        &report,
        skipped_sessions,
        empty_roster,
        empty_sessions,
    ))
}

fn defaulter_list_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let sel = parse_selection(params)?;
    let (mut report, skipped_sessions, empty_roster, empty_sessions) =
        run_aggregation(conn, &sel)?;
    report.rows.retain(|r| r.is_defaulter);
    Ok(summary_response(
        &sel,
        &report,
        skipped_sessions,
        empty_roster,
        empty_sessions,
    ))
}

fn student_subject_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = required_str(params, "studentId")?;
    let threshold_percent = match params.get("thresholdPercent") {
        None => DEFAULT_THRESHOLD_PERCENT,
        Some(v) if v.is_null() => DEFAULT_THRESHOLD_PERCENT,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerError::bad_params("thresholdPercent must be a number"))?,
    };

    let Some(student) = roster::fetch_student_by_id(conn, &student_id)? else {
        return Err(HandlerError::not_found("student not found"));
    };

    let filters = sessions::SessionFilters {
        department: student.department.clone(),
        year: Some(student.year.clone()),
        subject_name: None,
        batch: None,
        teacher_id: None,
    };
    let (session_records, undecodable) = sessions::fetch_sessions(conn, &filters)?;
    let credit_records = credits::fetch_credits_for_student(conn, &student_id)?;

    let report = aggregate::subject_breakdown(
        &student,
        &session_records,
        &credit_records,
        threshold_percent,
    );

    let skipped_sessions = report.skipped_sessions + undecodable;
    Ok(json!({
        "report": report,
        "skippedSessions": skipped_sessions,
    }))
}

fn no_data_err(e: ExportError) -> HandlerError {
    match e {
        ExportError::NoData => {
            HandlerError::new("no_data", "nothing to export for this selection")
        }
    }
}

fn export_attendance_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let sel = parse_selection(params)?;
    let out_path = optional_str(params, "outPath")?;

    let students = roster::fetch_students(conn, &sel.roster)?;
    let (session_records, undecodable) =
        sessions::fetch_sessions(conn, &session_filters_for(&sel))?;

    let mut skipped = undecodable;
    let selected: Vec<_> = session_records
        .into_iter()
        .filter(|s| match &sel.subject_name {
            Some(subject) => s.subject_name.eq_ignore_ascii_case(subject),
            None => true,
        })
        .filter(|s| {
            if s.is_malformed() {
                skipped += 1;
                false
            } else {
                true
            }
        })
        .collect();

    let csv = export::date_matrix_csv(&students, &selected).map_err(no_data_err)?;
    let dates: BTreeSet<&str> = selected.iter().map(|s| s.date.as_str()).collect();

    if let Some(path) = &out_path {
        write_text_file(path, &csv)?;
    }

    Ok(json!({
        "csv": csv,
        "rowCount": students.len(),
        "dateCount": dates.len(),
        "skippedSessions": skipped,
        "outPath": out_path,
    }))
}

fn export_subject_breakdown_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerError> {
    let student_id = required_str(params, "studentId")?;
    let out_path = optional_str(params, "outPath")?;

    let Some(student) = roster::fetch_student_by_id(conn, &student_id)? else {
        return Err(HandlerError::not_found("student not found"));
    };

    let filters = sessions::SessionFilters {
        department: student.department.clone(),
        year: Some(student.year.clone()),
        subject_name: None,
        batch: None,
        teacher_id: None,
    };
    let (session_records, _) = sessions::fetch_sessions(conn, &filters)?;
    let credit_records = credits::fetch_credits_for_student(conn, &student_id)?;

    let report = aggregate::subject_breakdown(
        &student,
        &session_records,
        &credit_records,
        DEFAULT_THRESHOLD_PERCENT,
    );
    let csv = export::subject_breakdown_csv(&report).map_err(no_data_err)?;

    if let Some(path) = &out_path {
        write_text_file(path, &csv)?;
    }

    Ok(json!({
        "csv": csv,
        "subjectCount": report.subjects.len(),
        "outPath": out_path,
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
        "reports.attendanceSummaryModel" => Some(respond(state, req, attendance_summary_model)),
        "reports.defaulterListModel" => Some(respond(state, req, defaulter_list_model)),
        "reports.studentSubjectModel" => Some(respond(state, req, student_subject_model)),
        "reports.exportAttendanceCsv" => Some(respond(state, req, export_attendance_csv)),
        "reports.exportSubjectBreakdownCsv" => {
            Some(respond(state, req, export_subject_breakdown_csv))
        }
        _ => None,
    }
}
