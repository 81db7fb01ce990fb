use crate::db::now_rfc3339;
use crate::grading::{validate_score, GradeScale};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{semester_locked, str_param};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::json;
use uuid::Uuid;

const MAX_UPLOAD_ENTRIES: usize = 2000;

#[derive(Debug)]
struct UploadEntry {
    student_id: String,
    score: f64,
}

fn parse_entries(
    conn: &Connection,
    department_id: &str,
    raw: &serde_json::Value,
) -> Result<Vec<UploadEntry>, (String, Vec<serde_json::Value>)> {
    let Some(items) = raw.as_array() else {
        return Err(("entries must be an array".into(), Vec::new()));
    };
    if items.is_empty() || items.len() > MAX_UPLOAD_ENTRIES {
        return Err((
            format!("entries must contain 1..={} items", MAX_UPLOAD_ENTRIES),
            Vec::new(),
        ));
    }

    let mut entries = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let student_id = item.get("studentId").and_then(|v| v.as_str()).unwrap_or("");
        let score = item.get("score").and_then(|v| v.as_f64());
        let Some(score) = score else {
            rejected.push(json!({ "index": i, "reason": "score must be a number" }));
            continue;
        };
        if let Err(e) = validate_score(score) {
            rejected.push(json!({ "index": i, "reason": e.to_string() }));
            continue;
        }
        let in_department: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND department_id = ?",
                (student_id, department_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| (e.to_string(), Vec::new()))?;
        if in_department.is_none() {
            rejected.push(json!({ "index": i, "reason": "student not found in this department" }));
            continue;
        }
        entries.push(UploadEntry {
            student_id: student_id.to_string(),
            score,
        });
    }
    if !rejected.is_empty() {
        return Err(("some entries are invalid".into(), rejected));
    }
    Ok(entries)
}

fn handle_results_upload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(semester_id) = str_param(&req.params, "semesterId") else {
        return err(&req.id, "bad_params", "missing semesterId", None);
    };
    let Some(course_id) = str_param(&req.params, "courseId") else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let uploaded_by = str_param(&req.params, "uploadedBy");

    match settings::platform_flag(conn, "resultUploadOpen") {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "uploads_closed", "result upload is closed", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let semester_department: Option<(String, i64)> = match conn
        .query_row(
            "SELECT department_id, locked FROM semesters WHERE id = ?",
            [semester_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((department_id, locked)) = semester_department else {
        return err(&req.id, "not_found", "semester not found", None);
    };
    if locked != 0 {
        return err(&req.id, "semester_locked", "semester results are locked", None);
    }

    let course_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM courses WHERE id = ? AND department_id = ?",
            (course_id, &department_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_ok.is_none() {
        return err(&req.id, "not_found", "course not found in this department", None);
    }

    let Some(raw_entries) = req.params.get("entries") else {
        return err(&req.id, "bad_params", "missing entries", None);
    };
    let entries = match parse_entries(conn, &department_id, raw_entries) {
        Ok(v) => v,
        Err((msg, rejected)) if !rejected.is_empty() => {
            return err(
                &req.id,
                "invalid_score",
                msg,
                Some(json!({ "rejected": rejected })),
            )
        }
        Err((msg, _)) => return err(&req.id, "bad_params", msg, None),
    };

    let scale = match settings::grade_scale(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match Transaction::new_unchecked(conn, TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // A background batch may have published the semester since the check above.
    match semester_locked(&tx, semester_id) {
        Ok(Some(false)) => {}
        Ok(Some(true)) => {
            return err(&req.id, "semester_locked", "semester results are locked", None)
        }
        Ok(None) => return err(&req.id, "not_found", "semester not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let now = now_rfc3339();
    for entry in &entries {
        if let Err(e) = upsert_result(&tx, &scale, semester_id, course_id, entry, uploaded_by, &now) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "course_results" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    tracing::info!(
        semester_id,
        course_id,
        entries = entries.len(),
        "results uploaded"
    );
    ok(&req.id, json!({ "upserted": entries.len() }))
}

/// New scores always re-enter approval as `pending`.
fn upsert_result(
    conn: &Connection,
    scale: &GradeScale,
    semester_id: &str,
    course_id: &str,
    entry: &UploadEntry,
    uploaded_by: Option<&str>,
    now: &str,
) -> anyhow::Result<()> {
    let (grade, point) = scale.resolve(entry.score)?;
    conn.execute(
        "INSERT INTO course_results(
            id, student_id, course_id, semester_id, score, grade, grade_point, is_carryover,
            status, rejection_reason, processed, uploaded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, 0, ?, ?)
         ON CONFLICT(student_id, course_id, semester_id) DO UPDATE SET
            score = excluded.score,
            grade = excluded.grade,
            grade_point = excluded.grade_point,
            is_carryover = excluded.is_carryover,
            status = 'pending',
            rejection_reason = NULL,
            processed = 0,
            uploaded_by = excluded.uploaded_by,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &entry.student_id,
            course_id,
            semester_id,
            entry.score,
            grade,
            point,
            scale.is_carryover(entry.score) as i64,
            uploaded_by,
            now,
        ),
    )?;
    Ok(())
}

/// Regrades every result not yet processed against `scale`. Processed
/// results keep the grades they were published with.
pub fn regrade_open_results(conn: &Connection, scale: &GradeScale) -> anyhow::Result<usize> {
    let mut stmt = conn.prepare("SELECT id, score FROM course_results WHERE processed = 0")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (id, score) in &rows {
        let (grade, point) = scale.resolve(*score)?;
        conn.execute(
            "UPDATE course_results SET grade = ?, grade_point = ?, is_carryover = ? WHERE id = ?",
            (grade, point, scale.is_carryover(*score) as i64, id),
        )?;
    }
    Ok(rows.len())
}

fn result_semester(conn: &Connection, result_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT semester_id FROM course_results WHERE id = ?",
        [result_id],
        |r| r.get(0),
    )
    .optional()
}

/// Guard for single-statement result writes; the semester can be published
/// by a background batch between `editable_result` and the write.
const UNLOCKED_SEMESTER: &str =
    "semester_id IN (SELECT id FROM semesters WHERE locked = 0)";

fn locked_since_check(req: &Request) -> serde_json::Value {
    err(&req.id, "semester_locked", "semester results are locked", None)
}

/// Looks up the result's semester and refuses changes once it is locked.
fn editable_result(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    let Some(result_id) = str_param(&req.params, "resultId") else {
        return Err(err(&req.id, "bad_params", "missing resultId", None));
    };
    let semester_id = match result_semester(conn, result_id) {
        Ok(Some(s)) => s,
        Ok(None) => return Err(err(&req.id, "not_found", "result not found", None)),
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    match semester_locked(conn, &semester_id) {
        Ok(Some(false)) => Ok(result_id.to_string()),
        Ok(Some(true)) => Err(err(
            &req.id,
            "semester_locked",
            "semester results are locked",
            None,
        )),
        Ok(None) => Err(err(&req.id, "not_found", "semester not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_results_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result_id = match editable_result(conn, req) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) else {
        return err(&req.id, "invalid_score", "score must be a number", None);
    };
    let scale = match settings::grade_scale(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (grade, point) = match scale.resolve(score) {
        Ok(v) => v,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };

    match conn.execute(
        &format!(
            "UPDATE course_results SET
                score = ?, grade = ?, grade_point = ?, is_carryover = ?,
                status = 'pending', rejection_reason = NULL, processed = 0, updated_at = ?
             WHERE id = ? AND {UNLOCKED_SEMESTER}"
        ),
        (
            score,
            grade,
            point,
            scale.is_carryover(score) as i64,
            now_rfc3339(),
            &result_id,
        ),
    ) {
        Ok(0) => return locked_since_check(req),
        Ok(_) => {}
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    }

    ok(
        &req.id,
        json!({
            "resultId": result_id,
            "score": score,
            "grade": grade,
            "gradePoint": point,
            "isCarryover": scale.is_carryover(score),
            "status": "pending"
        }),
    )
}

fn set_approval(state: &mut AppState, req: &Request, status: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result_id = match editable_result(conn, req) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let reason = if status == "rejected" {
        str_param(&req.params, "reason")
    } else {
        None
    };

    match conn.execute(
        &format!(
            "UPDATE course_results SET status = ?, rejection_reason = ?, updated_at = ?
             WHERE id = ? AND {UNLOCKED_SEMESTER}"
        ),
        (status, reason, now_rfc3339(), &result_id),
    ) {
        Ok(0) => return locked_since_check(req),
        Ok(_) => {}
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    }
    ok(&req.id, json!({ "resultId": result_id, "status": status }))
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    if let Some(status) = str_param(&req.params, "status") {
        if status != "pending" && status != "approved" && status != "rejected" {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: pending, approved, rejected",
                None,
            );
        }
        clauses.push("cr.status = ?");
        bind.push(Value::Text(status.to_string()));
    }
    if let Some(semester_id) = str_param(&req.params, "semesterId") {
        clauses.push("cr.semester_id = ?");
        bind.push(Value::Text(semester_id.to_string()));
    }
    if let Some(course_id) = str_param(&req.params, "courseId") {
        clauses.push("cr.course_id = ?");
        bind.push(Value::Text(course_id.to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT cr.id, cr.student_id, s.matric_no, s.last_name, s.first_name, c.code, c.title,
                c.unit, cr.semester_id, cr.score, cr.grade, cr.grade_point, cr.is_carryover,
                cr.status, cr.rejection_reason, cr.processed, cr.uploaded_by, cr.updated_at
         FROM course_results cr
         JOIN students s ON s.id = cr.student_id
         JOIN courses c ON c.id = cr.course_id{where_sql}
         ORDER BY c.code, s.matric_no"
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind.iter()), |r| {
            let last: String = r.get(3)?;
            let first: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "matricNo": r.get::<_, String>(2)?,
                "studentName": format!("{}, {}", last, first),
                "courseCode": r.get::<_, String>(5)?,
                "courseTitle": r.get::<_, String>(6)?,
                "unit": r.get::<_, i64>(7)?,
                "semesterId": r.get::<_, String>(8)?,
                "score": r.get::<_, f64>(9)?,
                "grade": r.get::<_, String>(10)?,
                "gradePoint": r.get::<_, i64>(11)?,
                "isCarryover": r.get::<_, i64>(12)? != 0,
                "status": r.get::<_, String>(13)?,
                "rejectionReason": r.get::<_, Option<String>>(14)?,
                "processed": r.get::<_, i64>(15)? != 0,
                "uploadedBy": r.get::<_, Option<String>>(16)?,
                "updatedAt": r.get::<_, Option<String>>(17)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.upload" => Some(handle_results_upload(state, req)),
        "results.update" => Some(handle_results_update(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        "results.approve" => Some(set_approval(state, req, "approved")),
        "results.reject" => Some(set_approval(state, req, "rejected")),
        _ => None,
    }
}
