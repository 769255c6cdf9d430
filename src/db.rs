use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "attendance.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            roll_no TEXT NOT NULL,
            department TEXT NOT NULL,
            year TEXT NOT NULL,
            batch TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(department, year, roll_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_dept_year ON students(department, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            department TEXT NOT NULL,
            year TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            session_type TEXT NOT NULL,
            batch TEXT,
            sessions_count INTEGER NOT NULL DEFAULT 1,
            date TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // Workspaces created before unit counts were configurable lack the
    // sessions_count column. Add it and backfill practicals to 2 units.
    ensure_sessions_count(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_dept_year ON sessions(department, year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_teacher ON sessions(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_date ON sessions(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_entries(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            is_present INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_entries_session ON session_entries(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_entries_student ON session_entries(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS extra_credits(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            extra_sessions INTEGER NOT NULL,
            reason TEXT NOT NULL,
            department TEXT NOT NULL,
            year TEXT NOT NULL,
            batch TEXT,
            added_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_credits_student ON extra_credits(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_credits_dept_year ON extra_credits(department, year)",
        [],
    )?;

    Ok(conn)
}

fn ensure_sessions_count(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sessions", "sessions_count")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE sessions ADD COLUMN sessions_count INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    conn.execute(
        "UPDATE sessions SET sessions_count = 2 WHERE session_type = 'practical'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
