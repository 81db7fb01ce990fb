use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::core::select_workspace;
use crate::ipc::helpers::str_param;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn target_workspace(state: &AppState, req: &Request) -> Option<PathBuf> {
    str_param(&req.params, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = str_param(&req.params, "outPath").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace_path) = target_workspace(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // A batch still writing would make the snapshot inconsistent.
    state.join_workers();

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = str_param(&req.params, "inPath").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let Some(workspace_path) = target_workspace(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    state.join_workers();
    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %src.display(), error = %e, "workspace bundle import failed");
            // The previous database is still in place; reopen it.
            let _ = select_workspace(state, &workspace_path);
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": src.to_string_lossy() })),
            );
        }
    };

    match select_workspace(state, &workspace_path) {
        Ok(recovered) => ok(
            &req.id,
            json!({
                "workspacePath": workspace_path.to_string_lossy(),
                "bundleFormatDetected": import.bundle_format_detected,
                "recoveredComputations": recovered
            }),
        ),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        _ => None,
    }
}
