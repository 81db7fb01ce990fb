use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bool_param, row_exists, str_param};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

const MAX_COURSE_UNIT: i64 = 30;

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, code, title, unit, is_core
         FROM courses
         WHERE department_id = ?
         ORDER BY code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([department_id], |row| {
            let id: String = row.get(0)?;
            let code: String = row.get(1)?;
            let title: String = row.get(2)?;
            let unit: i64 = row.get(3)?;
            let is_core: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "title": title,
                "unit": unit,
                "isCore": is_core != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };
    let Some(code) = str_param(&req.params, "code").map(|s| s.to_ascii_uppercase()) else {
        return err(&req.id, "bad_params", "missing code", None);
    };
    let Some(title) = str_param(&req.params, "title") else {
        return err(&req.id, "bad_params", "missing title", None);
    };
    let unit = match req.params.get("unit").and_then(|v| v.as_i64()) {
        Some(n) if (1..=MAX_COURSE_UNIT).contains(&n) => n,
        _ => {
            return err(
                &req.id,
                "invalid_unit",
                format!("unit must be an integer in 1..={}", MAX_COURSE_UNIT),
                None,
            )
        }
    };
    let is_core = bool_param(&req.params, "isCore").unwrap_or(true);
    match row_exists(conn, "departments", department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, department_id, code, title, unit, is_core) VALUES(?, ?, ?, ?, ?, ?)",
        (&course_id, department_id, &code, title, unit, is_core as i64),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "code": code }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        _ => None,
    }
}
