use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .env_remove("RESULTSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

const METHODS: &[&str] = &[
    "health",
    "settings.get",
    "settings.update",
    "departments.list",
    "departments.create",
    "semesters.list",
    "semesters.create",
    "semesters.activate",
    "students.list",
    "students.create",
    "students.get",
    "students.results",
    "notifications.list",
    "courses.list",
    "courses.create",
    "results.upload",
    "results.update",
    "results.list",
    "results.approve",
    "results.reject",
    "computations.list",
    "computations.start",
    "computations.cancel",
    "computations.retry",
    "computations.get",
    "computations.mastersheet",
    "transcripts.list",
    "transcripts.request",
    "transcripts.approve",
    "transcripts.reject",
    "transcripts.open",
    "backup.exportWorkspaceBundle",
    "backup.importWorkspaceBundle",
];

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultsd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    let health = request_ok(i, r, "h", "health", json!({}));
    assert!(health["workspacePath"].is_null());

    request_ok(i, r, "ws", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    for (n, method) in METHODS.iter().enumerate() {
        let resp = request(i, r, &format!("m{n}"), method, json!({}));
        assert_ne!(
            error_code(&resp),
            "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }

    let unknown = request(i, r, "u", "grid.bulkUpdate", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    let health = request_ok(i, r, "h2", "health", json!({}));
    assert!(health["workspacePath"].is_string());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn requests_before_workspace_select_are_refused() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    let listed = request_ok(i, r, "1", "departments.list", json!({}));
    assert_eq!(listed["departments"].as_array().map(|v| v.len()), Some(0));
    for (n, method) in ["students.list", "results.list", "computations.list", "transcripts.list"]
        .iter()
        .enumerate()
    {
        let resp = request(i, r, &format!("n{n}"), method, json!({ "departmentId": "x" }));
        assert_eq!(error_code(&resp), "no_workspace", "{}", method);
    }
    let select = request(i, r, "2", "workspace.select", json!({}));
    assert_eq!(error_code(&select), "bad_params");

    writeln!(i, "{{not json").expect("write garbage");
    i.flush().expect("flush");
    let mut line = String::new();
    r.read_line(&mut line).expect("read bad_json response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse");
    assert_eq!(value["error"]["code"].as_str(), Some("bad_json"));

    drop(stdin);
    let _ = child.wait();
}
