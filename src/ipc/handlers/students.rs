use crate::grading::Classification;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{row_exists, str_param};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, matric_no, last_name, first_name, level, cgpa, standing, outstanding_carryovers
         FROM students
         WHERE department_id = ?
         ORDER BY matric_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([department_id], |row| {
            let id: String = row.get(0)?;
            let matric_no: String = row.get(1)?;
            let last: String = row.get(2)?;
            let first: String = row.get(3)?;
            let level: i64 = row.get(4)?;
            let cgpa: Option<f64> = row.get(5)?;
            let standing: Option<String> = row.get(6)?;
            let outstanding: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "matricNo": matric_no,
                "displayName": format!("{}, {}", last, first),
                "level": level,
                "cgpa": cgpa,
                "standing": standing,
                "outstandingCarryovers": outstanding
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };
    let Some(matric_no) = str_param(&req.params, "matricNo").map(|s| s.to_ascii_uppercase()) else {
        return err(&req.id, "bad_params", "missing matricNo", None);
    };
    let Some(last_name) = str_param(&req.params, "lastName") else {
        return err(&req.id, "bad_params", "missing lastName", None);
    };
    let Some(first_name) = str_param(&req.params, "firstName") else {
        return err(&req.id, "bad_params", "missing firstName", None);
    };
    let level = match req.params.get("level") {
        None => 100,
        Some(v) => match v.as_i64() {
            Some(n) if (100..=900).contains(&n) && n % 100 == 0 => n,
            _ => return err(&req.id, "bad_params", "level must be one of 100..=900 in steps of 100", None),
        },
    };
    match row_exists(conn, "departments", department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, department_id, matric_no, last_name, first_name, level, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            department_id,
            &matric_no,
            last_name,
            first_name,
            level,
            crate::db::now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "matricNo": matric_no }),
    )
}

pub(crate) fn student_record(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT s.id, s.matric_no, s.last_name, s.first_name, s.level, s.cgpa, s.total_units,
                s.total_points, s.standing, s.outstanding_carryovers, d.id, d.code, d.name
         FROM students s
         JOIN departments d ON d.id = s.department_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            let cgpa: Option<f64> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "matricNo": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "level": r.get::<_, i64>(4)?,
                "cgpa": cgpa,
                "classification": cgpa.map(Classification::from_cgpa),
                "totalUnits": r.get::<_, i64>(6)?,
                "totalPoints": r.get::<_, i64>(7)?,
                "standing": r.get::<_, Option<String>>(8)?,
                "outstandingCarryovers": r.get::<_, i64>(9)?,
                "department": {
                    "id": r.get::<_, String>(10)?,
                    "code": r.get::<_, String>(11)?,
                    "name": r.get::<_, String>(12)?
                }
            }))
        },
    )
    .optional()
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(&req.params, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    match student_record(conn, student_id) {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Committed semester results, oldest first.
pub(crate) fn semester_history(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT sr.semester_id, s.session, s.name, s.sequence, sr.courses_json, sr.total_units,
                sr.total_points, sr.gpa, sr.cgpa, sr.carryover_count, sr.remark, sr.status,
                sr.computation_id
         FROM semester_results sr
         JOIN semesters s ON s.id = sr.semester_id
         WHERE sr.student_id = ?
         ORDER BY s.sequence",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            let courses_json: String = r.get(4)?;
            let courses: serde_json::Value =
                serde_json::from_str(&courses_json).unwrap_or_else(|_| json!([]));
            Ok(json!({
                "semesterId": r.get::<_, String>(0)?,
                "session": r.get::<_, String>(1)?,
                "semesterName": r.get::<_, String>(2)?,
                "sequence": r.get::<_, i64>(3)?,
                "courses": courses,
                "totalUnits": r.get::<_, i64>(5)?,
                "totalPoints": r.get::<_, i64>(6)?,
                "gpa": r.get::<_, f64>(7)?,
                "cgpa": r.get::<_, f64>(8)?,
                "carryoverCount": r.get::<_, i64>(9)?,
                "remark": r.get::<_, String>(10)?,
                "status": r.get::<_, String>(11)?,
                "computationId": r.get::<_, String>(12)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_students_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(&req.params, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    match row_exists(conn, "students", student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match semester_history(conn, student_id) {
        Ok(semesters) => ok(&req.id, json!({ "semesters": semesters })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(&req.params, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, computation_id, kind, message, created_at
         FROM notifications
         WHERE student_id = ?
         ORDER BY created_at DESC, rowid DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "computationId": r.get::<_, Option<String>>(1)?,
                "kind": r.get::<_, String>(2)?,
                "message": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(notifications) => ok(&req.id, json!({ "notifications": notifications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.results" => Some(handle_students_results(state, req)),
        "notifications.list" => Some(handle_notifications_list(state, req)),
        _ => None,
    }
}
