use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_attendanced");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendanced");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    roll_no: &str,
    year: &str,
    batch: Option<&str>,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "name": name,
            "rollNo": roll_no,
            "department": "Computer",
            "year": year,
            "batch": batch,
        }),
    );
    result
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn create_session(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    year: &str,
    session_type: &str,
    batch: Option<&str>,
    date: &str,
    present: &[&str],
    absent: &[&str],
) {
    let mut entries: Vec<serde_json::Value> = present
        .iter()
        .map(|sid| json!({ "studentId": sid, "isPresent": true }))
        .collect();
    entries.extend(
        absent
            .iter()
            .map(|sid| json!({ "studentId": sid, "isPresent": false })),
    );
    let _ = request_ok(
        stdin,
        reader,
        id,
        "sessions.create",
        json!({
            "teacherId": "t-1",
            "department": "Computer",
            "year": year,
            "subjectName": "DBMS",
            "sessionType": session_type,
            "batch": batch,
            "date": date,
            "attendanceData": entries,
        }),
    );
}

fn summary_row<'a>(
    summary: &'a serde_json::Value,
    student_id: &str,
) -> &'a serde_json::Value {
    summary
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .expect("row for student")
}

#[test]
fn lecture_only_summary_matches_hand_computed_percentages() {
    let workspace = temp_dir("attendanced-summary-lectures");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let sid = create_student(
        &mut stdin,
        &mut reader,
        "s1",
        "Asha Rao",
        "301",
        "3rd Year",
        None,
    );

    // One lecture, present: full attendance.
    create_session(
        &mut stdin,
        &mut reader,
        "l1",
        "3rd Year",
        "lecture",
        None,
        "2025-01-06",
        &[&sid],
        &[],
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.attendanceSummaryModel",
        json!({ "department": "Computer", "year": "3rd Year" }),
    );
    let row = summary_row(&summary, &sid);
    assert_eq!(row.get("attendedSessions").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row.get("totalSessions").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        row.get("percentage").and_then(|v| v.as_str()),
        Some("100.00")
    );
    assert_eq!(row.get("isDefaulter").and_then(|v| v.as_bool()), Some(false));

    // Two more lectures, one missed: 2 of 3 puts the student under 75.
    create_session(
        &mut stdin,
        &mut reader,
        "l2",
        "3rd Year",
        "lecture",
        None,
        "2025-01-07",
        &[&sid],
        &[],
    );
    create_session(
        &mut stdin,
        &mut reader,
        "l3",
        "3rd Year",
        "lecture",
        None,
        "2025-01-08",
        &[],
        &[&sid],
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.attendanceSummaryModel",
        json!({ "department": "Computer", "year": "3rd Year" }),
    );
    let row = summary_row(&summary, &sid);
    assert_eq!(row.get("attendedSessions").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(row.get("totalSessions").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(
        row.get("percentage").and_then(|v| v.as_str()),
        Some("66.67")
    );
    assert_eq!(row.get("isDefaulter").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn practicals_count_double_and_only_for_their_batch() {
    let workspace = temp_dir("attendanced-summary-batch");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let sid = create_student(
        &mut stdin,
        &mut reader,
        "s1",
        "Kiran Patil",
        "201",
        "2nd Year",
        Some("B1"),
    );

    create_session(
        &mut stdin,
        &mut reader,
        "l1",
        "2nd Year",
        "lecture",
        None,
        "2025-01-06",
        &[&sid],
        &[],
    );
    create_session(
        &mut stdin,
        &mut reader,
        "p1",
        "2nd Year",
        "practical",
        Some("B1"),
        "2025-01-07",
        &[&sid],
        &[],
    );
    // A B2 practical marking this B1 student present must not count
    // anywhere, but the drop is reported.
    create_session(
        &mut stdin,
        &mut reader,
        "p2",
        "2nd Year",
        "practical",
        Some("B2"),
        "2025-01-08",
        &[&sid],
        &[],
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.attendanceSummaryModel",
        json!({ "department": "Computer", "year": "2nd Year" }),
    );
    let row = summary_row(&summary, &sid);
    assert_eq!(row.get("attendedSessions").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(row.get("totalSessions").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(
        row.get("percentage").and_then(|v| v.as_str()),
        Some("100.00")
    );
    assert_eq!(
        summary.get("skippedEntries").and_then(|v| v.as_u64()),
        Some(1)
    );

    // The per-student view splits the same numbers by session type.
    let model = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.studentSubjectModel",
        json!({ "studentId": sid }),
    );
    let subjects = model
        .get("report")
        .and_then(|r| r.get("subjects"))
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(subjects.len(), 1);
    let dbms = &subjects[0];
    assert_eq!(dbms.get("lectureAttended").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(dbms.get("lectureTotal").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        dbms.get("practicalAttended").and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(dbms.get("practicalTotal").and_then(|v| v.as_i64()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
