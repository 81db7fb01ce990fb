use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
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

#[test]
fn bundle_export_import_restores_the_workspace() {
    let workspace = temp_dir("resultsd-bundle-src");
    let out_dir = temp_dir("resultsd-bundle-out");
    let bundle = out_dir.join("workspace.resultsd.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    request_ok(i, r, "2", "departments.create", json!({ "code": "ECO", "name": "Economics" }));

    let export = request_ok(
        i,
        r,
        "3",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"].as_str(), Some("resultsd-workspace-v1"));
    assert_eq!(export["entryCount"].as_u64(), Some(3));
    let sha = export["dbSha256"].as_str().expect("dbSha256").to_string();
    assert_eq!(sha.len(), 64);

    let mut archive = zip::ZipArchive::new(File::open(&bundle).expect("open bundle")).expect("zip");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["dbSha256"].as_str(), Some(sha.as_str()));
    archive
        .by_name("db/resultsd.sqlite3")
        .expect("database entry in bundle");

    request_ok(i, r, "4", "departments.create", json!({ "code": "ACC", "name": "Accounting" }));
    let before = request_ok(i, r, "5", "departments.list", json!({}));
    assert_eq!(before["departments"].as_array().map(|v| v.len()), Some(2));

    let import = request_ok(
        i,
        r,
        "6",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        import["bundleFormatDetected"].as_str(),
        Some("resultsd-workspace-v1")
    );
    let after = request_ok(i, r, "7", "departments.list", json!({}));
    let departments = after["departments"].as_array().expect("departments");
    assert_eq!(departments.len(), 1);
    assert_eq!(departments[0]["code"].as_str(), Some("ECO"));

    let missing = request(
        i,
        r,
        "8",
        "backup.importWorkspaceBundle",
        json!({ "inPath": out_dir.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_copy_can_be_imported() {
    let source = temp_dir("resultsd-bundle-raw-src");
    let target = temp_dir("resultsd-bundle-raw-dst");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    request_ok(i, r, "1", "workspace.select", json!({ "path": source.to_string_lossy() }));
    request_ok(i, r, "2", "departments.create", json!({ "code": "PHL", "name": "Philosophy" }));
    request_ok(i, r, "3", "workspace.select", json!({ "path": target.to_string_lossy() }));

    let import = request_ok(
        i,
        r,
        "4",
        "backup.importWorkspaceBundle",
        json!({ "inPath": source.join("resultsd.sqlite3").to_string_lossy() }),
    );
    assert_eq!(import["bundleFormatDetected"].as_str(), Some("raw-sqlite3"));
    let listed = request_ok(i, r, "5", "departments.list", json!({}));
    assert_eq!(listed["departments"][0]["code"].as_str(), Some("PHL"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
}
