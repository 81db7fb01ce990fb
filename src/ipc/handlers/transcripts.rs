use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::students::{semester_history, student_record};
use crate::ipc::helpers::{row_exists, str_param};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn transcript_status(conn: &Connection, transcript_id: &str) -> rusqlite::Result<Option<(String, String)>> {
    conn.query_row(
        "SELECT student_id, status FROM transcripts WHERE id = ?",
        [transcript_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
}

fn handle_transcripts_request(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(&req.params, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    match settings::platform_flag(conn, "transcriptRequestsOpen") {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "requests_closed",
                "transcript requests are closed",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match row_exists(conn, "students", student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let pending: Option<String> = match conn
        .query_row(
            "SELECT id FROM transcripts WHERE student_id = ? AND status = 'pending'",
            [student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(existing) = pending {
        return err(
            &req.id,
            "invalid_transition",
            "a transcript request is already pending for this student",
            Some(json!({ "transcriptId": existing })),
        );
    }

    let transcript_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO transcripts(id, student_id, status, requested_at) VALUES(?, ?, 'pending', ?)",
        (&transcript_id, student_id, now_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "transcripts" })),
        );
    }
    ok(
        &req.id,
        json!({ "transcriptId": transcript_id, "status": "pending" }),
    )
}

fn handle_transcripts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut where_sql = "";
    let mut bind: Vec<Value> = Vec::new();
    if let Some(status) = str_param(&req.params, "status") {
        if !matches!(status, "pending" | "approved" | "rejected") {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: pending, approved, rejected",
                None,
            );
        }
        where_sql = " WHERE t.status = ?";
        bind.push(Value::Text(status.to_string()));
    }

    let sql = format!(
        "SELECT t.id, t.student_id, s.matric_no, s.last_name, s.first_name, t.status, t.reason,
                t.requested_at, t.decided_at
         FROM transcripts t
         JOIN students s ON s.id = t.student_id{where_sql}
         ORDER BY t.requested_at DESC, t.rowid DESC"
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
                "status": r.get::<_, String>(5)?,
                "reason": r.get::<_, Option<String>>(6)?,
                "requestedAt": r.get::<_, String>(7)?,
                "decidedAt": r.get::<_, Option<String>>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(transcripts) => ok(&req.id, json!({ "transcripts": transcripts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Only pending requests can be decided.
fn decide(state: &mut AppState, req: &Request, status: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(transcript_id) = str_param(&req.params, "transcriptId") else {
        return err(&req.id, "bad_params", "missing transcriptId", None);
    };
    match transcript_status(conn, transcript_id) {
        Ok(Some((_, current))) if current == "pending" => {}
        Ok(Some((_, current))) => {
            return err(
                &req.id,
                "invalid_transition",
                format!("transcript request is already {current}"),
                None,
            )
        }
        Ok(None) => return err(&req.id, "not_found", "transcript request not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let reason = if status == "rejected" {
        str_param(&req.params, "reason")
    } else {
        None
    };

    if let Err(e) = conn.execute(
        "UPDATE transcripts SET status = ?, reason = ?, decided_at = ? WHERE id = ? AND status = 'pending'",
        (status, reason, now_rfc3339(), transcript_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(transcript_id, status, "transcript request decided");
    ok(
        &req.id,
        json!({ "transcriptId": transcript_id, "status": status }),
    )
}

fn handle_transcripts_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(transcript_id) = str_param(&req.params, "transcriptId") else {
        return err(&req.id, "bad_params", "missing transcriptId", None);
    };
    let student_id = match transcript_status(conn, transcript_id) {
        Ok(Some((student_id, status))) if status == "approved" => student_id,
        Ok(Some((_, status))) => {
            return err(
                &req.id,
                "invalid_transition",
                format!("transcript request is {status}; only approved transcripts can be opened"),
                None,
            )
        }
        Ok(None) => return err(&req.id, "not_found", "transcript request not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student = match student_record(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let semesters = match semester_history(conn, &student_id) {
        Ok(rows) => rows,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let institution = settings::load_section(conn, settings::SettingsSection::Session)
        .ok()
        .and_then(|v| v.get("institutionName").cloned());

    ok(
        &req.id,
        json!({
            "transcriptId": transcript_id,
            "institutionName": institution,
            "student": student,
            "semesters": semesters,
            "generatedAt": now_rfc3339()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "transcripts.list" => Some(handle_transcripts_list(state, req)),
        "transcripts.request" => Some(handle_transcripts_request(state, req)),
        "transcripts.approve" => Some(decide(state, req, "approved")),
        "transcripts.reject" => Some(decide(state, req, "rejected")),
        "transcripts.open" => Some(handle_transcripts_open(state, req)),
        _ => None,
    }
}
