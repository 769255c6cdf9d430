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

#[test]
fn bundle_export_import_preserves_attendance_data() {
    let source_ws = temp_dir("attendanced-bundle-src");
    let restore_ws = temp_dir("attendanced-bundle-dst");
    let bundle = source_ws.join("dept.bundle.zip");

    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": source_ws.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({
            "name": "Asha Rao",
            "rollNo": "301",
            "department": "Computer",
            "year": "3rd Year"
        }),
    );
    let sid = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "sessions.create",
        json!({
            "teacherId": "t-1",
            "department": "Computer",
            "year": "3rd Year",
            "subjectName": "DBMS",
            "sessionType": "lecture",
            "date": "2025-01-06",
            "attendanceData": [ { "studentId": sid, "isPresent": true } ]
        }),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": source_ws.to_string_lossy(),
            "outPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(
        export.get("bundleFormat").and_then(|v| v.as_str()),
        Some("attendance-workspace-v1")
    );
    let sha = export
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .expect("dbSha256");
    assert_eq!(sha.len(), 64);
    assert!(bundle.is_file());

    // Restore into a fresh workspace and read the data back.
    let import = request_ok(
        &mut stdin,
        &mut reader,
        "b2",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": restore_ws.to_string_lossy(),
            "inPath": bundle.to_string_lossy()
        }),
    );
    assert_eq!(
        import.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("attendance-workspace-v1")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l2",
        "students.list",
        json!({ "department": "Computer" }),
    );
    assert_eq!(
        listed
            .get("students")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.attendanceSummaryModel",
        json!({ "department": "Computer", "year": "3rd Year" }),
    );
    let rows = summary.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("percentage").and_then(|v| v.as_str()),
        Some("100.00")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source_ws);
    let _ = std::fs::remove_dir_all(restore_ws);
}
