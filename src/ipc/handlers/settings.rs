use crate::ipc::error::{err, ok};
use crate::ipc::handlers::results::regrade_open_results;
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, SettingsSection};
use serde_json::{json, Map, Value};

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SettingsSection::ALL {
        match settings::load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SettingsSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let current = match settings::update_section(&tx, section, patch_obj) {
        Ok(Ok(current)) => current,
        Ok(Err(msg)) => {
            let code = if section == SettingsSection::Grading {
                "invalid_scale"
            } else {
                "bad_params"
            };
            return err(&req.id, code, msg, None);
        }
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    let mut out = json!({ "section": section.name(), "value": current });
    if section == SettingsSection::Grading {
        let regraded = settings::grade_scale(&tx)
            .and_then(|scale| regrade_open_results(&tx, &scale));
        match regraded {
            Ok(n) => {
                tracing::info!(results = n, "open results regraded");
                out["regradedResults"] = json!(n);
            }
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    tracing::info!(section = section.name(), "settings updated");
    ok(&req.id, out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
