use crate::computation::{ComputationMode, ComputationStatus, MasterComputation};
use crate::engine::{self, ListFilter};
use crate::ipc::error::{compute_err, err, ok};
use crate::ipc::helpers::{bool_param, str_param};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const MAX_PAGE_SIZE: u64 = 100;

fn computation_json(req: &Request, master: &MasterComputation) -> serde_json::Value {
    match serde_json::to_value(master) {
        Ok(v) => ok(&req.id, json!({ "computation": v })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_department_ids(params: &serde_json::Value) -> Result<Option<Vec<String>>, String> {
    match params.get("departmentIds") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| "departmentIds must contain non-empty strings".to_string())
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err("departmentIds must be an array".into()),
    }
}

/// Runs the batch inline when `wait` is set, otherwise hands it to a worker
/// thread and returns the freshly created `processing` record.
fn launch(state: &mut AppState, req: &Request, computation_id: String) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if bool_param(&req.params, "wait").unwrap_or(false) {
        return match engine::run_batch(conn, &computation_id) {
            Ok(master) => computation_json(req, &master),
            Err(e) => compute_err(&req.id, &e),
        };
    }

    let created = match engine::load_computation(conn, &computation_id, true) {
        Ok(m) => m,
        Err(e) => return compute_err(&req.id, &e),
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    state.push_worker(engine::spawn_batch_worker(workspace, computation_id));
    computation_json(req, &created)
}

fn handle_computations_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(mode) = str_param(&req.params, "mode").and_then(ComputationMode::parse) else {
        return err(&req.id, "bad_params", "mode must be one of: preview, final", None);
    };
    let Some(computed_by) = str_param(&req.params, "computedBy") else {
        return err(&req.id, "bad_params", "missing computedBy", None);
    };
    let department_ids = match parse_department_ids(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let computation_id = match engine::create_batch(
        conn,
        mode,
        computed_by,
        department_ids.as_deref(),
        None,
    ) {
        Ok(id) => id,
        Err(e) => return compute_err(&req.id, &e),
    };
    launch(state, req, computation_id)
}

fn handle_computations_retry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(computation_id) = str_param(&req.params, "computationId") else {
        return err(&req.id, "bad_params", "missing computationId", None);
    };
    let computed_by = str_param(&req.params, "computedBy");
    let retry_id = match engine::retry_batch(conn, computation_id, computed_by) {
        Ok(id) => id,
        Err(e) => return compute_err(&req.id, &e),
    };
    launch(state, req, retry_id)
}

fn handle_computations_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(computation_id) = str_param(&req.params, "computationId") else {
        return err(&req.id, "bad_params", "missing computationId", None);
    };
    match engine::cancel_batch(conn, computation_id) {
        Ok(master) => computation_json(req, &master),
        Err(e) => compute_err(&req.id, &e),
    }
}

fn handle_computations_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(computation_id) = str_param(&req.params, "computationId") else {
        return err(&req.id, "bad_params", "missing computationId", None);
    };
    match engine::load_computation(conn, computation_id, true) {
        Ok(master) => computation_json(req, &master),
        Err(e) => compute_err(&req.id, &e),
    }
}

fn parse_date(params: &serde_json::Value, key: &str) -> Result<Option<chrono::NaiveDate>, String> {
    match str_param(params, key) {
        None => Ok(None),
        Some(raw) => chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| format!("{key} must be a YYYY-MM-DD date")),
    }
}

fn parse_positive(params: &serde_json::Value, key: &str, default: u32, max: u64) -> Result<u32, String> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => match v.as_u64() {
            Some(n) if (1..=max).contains(&n) => Ok(n as u32),
            _ => Err(format!("{key} must be an integer in 1..={max}")),
        },
    }
}

fn list_filter(params: &serde_json::Value) -> Result<ListFilter, String> {
    let defaults = ListFilter::default();
    let status = match str_param(params, "status") {
        None => None,
        Some(s) => Some(
            ComputationStatus::parse(s).ok_or_else(|| format!("unknown status {s}"))?,
        ),
    };
    let mode = match str_param(params, "mode") {
        None => None,
        Some(s) => Some(ComputationMode::parse(s).ok_or_else(|| format!("unknown mode {s}"))?),
    };
    let from = parse_date(params, "from")?;
    let to = parse_date(params, "to")?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err("from must not be after to".into());
        }
    }
    Ok(ListFilter {
        status,
        mode,
        from,
        to,
        search: str_param(params, "search").map(str::to_string),
        page: parse_positive(params, "page", defaults.page, u64::from(u32::MAX))?,
        page_size: parse_positive(params, "pageSize", defaults.page_size, MAX_PAGE_SIZE)?,
    })
}

fn handle_computations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let filter = match list_filter(&req.params) {
        Ok(f) => f,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let (items, total) = match engine::list_computations(conn, &filter) {
        Ok(v) => v,
        Err(e) => return compute_err(&req.id, &e),
    };
    let items = match serde_json::to_value(&items) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "items": items,
            "total": total,
            "page": filter.page,
            "pageSize": filter.page_size
        }),
    )
}

fn handle_computations_mastersheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(computation_id) = str_param(&req.params, "computationId") else {
        return err(&req.id, "bad_params", "missing computationId", None);
    };
    let Some(department_id) = str_param(&req.params, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };
    let rows = match engine::load_mastersheet(conn, computation_id, department_id) {
        Ok(rows) => rows,
        Err(e) => return compute_err(&req.id, &e),
    };
    match serde_json::to_value(&rows) {
        Ok(rows) => ok(
            &req.id,
            json!({
                "computationId": computation_id,
                "departmentId": department_id,
                "rows": rows
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "computations.list" => Some(handle_computations_list(state, req)),
        "computations.start" => Some(handle_computations_start(state, req)),
        "computations.cancel" => Some(handle_computations_cancel(state, req)),
        "computations.retry" => Some(handle_computations_retry(state, req)),
        "computations.get" => Some(handle_computations_get(state, req)),
        "computations.mastersheet" => Some(handle_computations_mastersheet(state, req)),
        _ => None,
    }
}
