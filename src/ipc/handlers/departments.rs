use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{row_exists, str_param};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_departments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "departments": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           d.id,
           d.code,
           d.name,
           (SELECT COUNT(*) FROM students s WHERE s.department_id = d.id) AS student_count,
           (SELECT s.id FROM semesters s WHERE s.department_id = d.id AND s.active = 1) AS active_semester_id
         FROM departments d
         ORDER BY d.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let name: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let active_semester_id: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "studentCount": student_count,
                "activeSemesterId": active_semester_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(departments) => ok(&req.id, json!({ "departments": departments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_departments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(code) = str_param(&req.params, "code").map(|s| s.to_ascii_uppercase()) else {
        return err(&req.id, "bad_params", "missing code", None);
    };
    let Some(name) = str_param(&req.params, "name").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let department_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO departments(id, code, name) VALUES(?, ?, ?)",
        (&department_id, &code, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "departments" })),
        );
    }

    ok(
        &req.id,
        json!({ "departmentId": department_id, "code": code, "name": name }),
    )
}

fn handle_semesters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, session, name, sequence, active, locked, locked_at
         FROM semesters
         WHERE department_id = ?
         ORDER BY sequence",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([department_id], |row| {
            let id: String = row.get(0)?;
            let session: String = row.get(1)?;
            let name: String = row.get(2)?;
            let sequence: i64 = row.get(3)?;
            let active: i64 = row.get(4)?;
            let locked: i64 = row.get(5)?;
            let locked_at: Option<String> = row.get(6)?;
            Ok(json!({
                "id": id,
                "session": session,
                "name": name,
                "sequence": sequence,
                "active": active != 0,
                "locked": locked != 0,
                "lockedAt": locked_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(semesters) => ok(&req.id, json!({ "semesters": semesters })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_semesters_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };
    let Some(session) = str_param(&req.params, "session") else {
        return err(&req.id, "bad_params", "missing session", None);
    };
    let Some(name) = str_param(&req.params, "name").map(|s| s.to_ascii_lowercase()) else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    match row_exists(conn, "departments", department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Without an explicit sequence the semester goes after every existing one.
    let sequence = match req.params.get("sequence") {
        None | Some(serde_json::Value::Null) => match conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM semesters WHERE department_id = ?",
            [department_id],
            |r| r.get::<_, i64>(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Some(v) => match v.as_i64() {
            Some(n) if n > 0 => n,
            _ => return err(&req.id, "bad_params", "sequence must be a positive integer", None),
        },
    };

    let semester_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO semesters(id, department_id, session, name, sequence, active, locked)
         VALUES(?, ?, ?, ?, ?, 0, 0)",
        (&semester_id, department_id, session, &name, sequence),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "semesters" })),
        );
    }

    ok(
        &req.id,
        json!({ "semesterId": semester_id, "sequence": sequence }),
    )
}

fn handle_semesters_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(semester_id) = str_param(&req.params, "semesterId") else {
        return err(&req.id, "bad_params", "missing semesterId", None);
    };

    let department_id: Option<String> = match conn
        .query_row(
            "SELECT department_id FROM semesters WHERE id = ?",
            [semester_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(department_id) = department_id else {
        return err(&req.id, "not_found", "semester not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // At most one active semester per department.
    if let Err(e) = tx.execute(
        "UPDATE semesters SET active = 0 WHERE department_id = ?",
        [&department_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("UPDATE semesters SET active = 1 WHERE id = ?", [semester_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "semesterId": semester_id, "departmentId": department_id }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "departments.list" => Some(handle_departments_list(state, req)),
        "departments.create" => Some(handle_departments_create(state, req)),
        "semesters.list" => Some(handle_semesters_list(state, req)),
        "semesters.create" => Some(handle_semesters_create(state, req)),
        "semesters.activate" => Some(handle_semesters_activate(state, req)),
        _ => None,
    }
}
