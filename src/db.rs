use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "resultsd.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE_NAME)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let conn = Connection::open(db_path(workspace))?;
    // Background batch workers hold their own connection to the same file.
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            session TEXT NOT NULL,
            name TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            locked_at TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(department_id, session, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semesters_department ON semesters(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            matric_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            level INTEGER NOT NULL,
            cgpa REAL,
            total_units INTEGER NOT NULL DEFAULT 0,
            total_points INTEGER NOT NULL DEFAULT 0,
            standing TEXT,
            outstanding_carryovers INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            unit INTEGER NOT NULL,
            is_core INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(department_id, code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            score REAL NOT NULL,
            grade TEXT NOT NULL,
            grade_point INTEGER NOT NULL,
            is_carryover INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            rejection_reason TEXT,
            processed INTEGER NOT NULL DEFAULT 0,
            uploaded_by TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(student_id, course_id, semester_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_results_semester ON course_results(semester_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_results_student ON course_results(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            computation_id TEXT NOT NULL,
            courses_json TEXT NOT NULL,
            total_units INTEGER NOT NULL,
            total_points INTEGER NOT NULL,
            gpa REAL NOT NULL,
            cgpa REAL NOT NULL,
            carryover_count INTEGER NOT NULL,
            remark TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(student_id, semester_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_semester_results_student ON semester_results(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS carryover_courses(
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            PRIMARY KEY(student_id, course_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            computation_id TEXT,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_student ON notifications(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transcripts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            reason TEXT,
            requested_at TEXT NOT NULL,
            decided_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS master_computations(
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            total_departments INTEGER NOT NULL,
            departments_processed INTEGER NOT NULL DEFAULT 0,
            failed_departments INTEGER NOT NULL DEFAULT 0,
            overall_average_gpa REAL,
            total_carryovers INTEGER NOT NULL DEFAULT 0,
            total_failed_students INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            duration_ms INTEGER,
            computed_by TEXT NOT NULL,
            retry_of TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_master_computations_status ON master_computations(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS computation_summaries(
            id TEXT PRIMARY KEY,
            computation_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            students_with_results INTEGER NOT NULL DEFAULT 0,
            total_students INTEGER NOT NULL DEFAULT 0,
            average_gpa REAL,
            highest_gpa REAL,
            gpa_sum REAL NOT NULL DEFAULT 0,
            carryover_stats_json TEXT,
            failed_students_json TEXT,
            mastersheet_json TEXT,
            error TEXT,
            duration_ms INTEGER,
            FOREIGN KEY(computation_id) REFERENCES master_computations(id),
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(computation_id, department_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_computation_summaries_computation ON computation_summaries(computation_id)",
        [],
    )?;

    // Workspaces created before uploads were attributed have no uploaded_by.
    ensure_course_results_uploaded_by(&conn)?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("settings value for {key} is not valid JSON"))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_course_results_uploaded_by(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "course_results", "uploaded_by")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE course_results ADD COLUMN uploaded_by TEXT", [])?;
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
