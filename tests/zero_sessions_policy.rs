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
fn no_sessions_yet_include_vs_omit_policies() {
    let workspace = temp_dir("attendanced-zero-sessions");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    for i in 1..=5 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({
                "name": format!("Student {}", i),
                "rollNo": format!("30{}", i),
                "department": "Computer",
                "year": "3rd Year"
            }),
        );
    }

    // Summary view synthesizes 0/0 rows for every student.
    let include = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.attendanceSummaryModel",
        json!({
            "department": "Computer",
            "year": "3rd Year",
            "zeroSessionPolicy": "include",
            "selectionToken": "sel-42"
        }),
    );
    let rows = include.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 5);
    for row in rows {
        assert_eq!(row.get("attendedSessions").and_then(|v| v.as_i64()), Some(0));
        assert_eq!(row.get("totalSessions").and_then(|v| v.as_i64()), Some(0));
        assert_eq!(row.get("percentage").and_then(|v| v.as_str()), Some("0.00"));
        assert_eq!(row.get("isDefaulter").and_then(|v| v.as_bool()), Some(true));
    }
    assert_eq!(
        include.get("emptySessions").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        include.get("selectionToken").and_then(|v| v.as_str()),
        Some("sel-42")
    );

    // Report view drops students with no applicable sessions.
    let omit = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.attendanceSummaryModel",
        json!({
            "department": "Computer",
            "year": "3rd Year",
            "zeroSessionPolicy": "omit"
        }),
    );
    assert_eq!(
        omit.get("rows").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    assert_eq!(
        omit.get("emptyRoster").and_then(|v| v.as_bool()),
        Some(false)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
