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

struct Fixture {
    dept_id: String,
    sem_id: String,
    course_id: String,
    student_ids: Vec<String>,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, code: &str) -> Fixture {
    let dept = request_ok(
        stdin,
        reader,
        &format!("{code}-d"),
        "departments.create",
        json!({ "code": code, "name": code }),
    );
    let dept_id = dept["departmentId"].as_str().expect("departmentId").to_string();
    let sem = request_ok(
        stdin,
        reader,
        &format!("{code}-sem"),
        "semesters.create",
        json!({ "departmentId": dept_id, "session": "2025/2026", "name": "first" }),
    );
    let sem_id = sem["semesterId"].as_str().expect("semesterId").to_string();
    let course = request_ok(
        stdin,
        reader,
        &format!("{code}-c"),
        "courses.create",
        json!({ "departmentId": dept_id, "code": format!("{code}201"), "title": "Methods", "unit": 2 }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();
    let mut student_ids = Vec::new();
    for n in 0..2 {
        let s = request_ok(
            stdin,
            reader,
            &format!("{code}-s{n}"),
            "students.create",
            json!({
                "departmentId": dept_id,
                "matricNo": format!("{code}/{n}"),
                "lastName": "Bello",
                "firstName": format!("F{n}")
            }),
        );
        student_ids.push(s["studentId"].as_str().expect("studentId").to_string());
    }
    Fixture {
        dept_id,
        sem_id,
        course_id,
        student_ids,
    }
}

#[test]
fn upload_rejects_the_whole_batch_when_any_entry_is_invalid() {
    let workspace = temp_dir("resultsd-results-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let eee = seed(i, r, "EEE");
    let mee = seed(i, r, "MEE");

    let bad = request(
        i,
        r,
        "2",
        "results.upload",
        json!({
            "semesterId": eee.sem_id,
            "courseId": eee.course_id,
            "entries": [
                { "studentId": eee.student_ids[0], "score": 55 },
                { "studentId": eee.student_ids[1], "score": 101 },
                { "studentId": mee.student_ids[0], "score": 60 }
            ]
        }),
    );
    assert_eq!(error_code(&bad), "invalid_score");
    let rejected = bad["error"]["details"]["rejected"].as_array().expect("rejected");
    let indexes: Vec<u64> = rejected.iter().filter_map(|v| v["index"].as_u64()).collect();
    assert_eq!(indexes, vec![1, 2]);

    let listed = request_ok(i, r, "3", "results.list", json!({ "semesterId": eee.sem_id }));
    assert_eq!(listed["results"].as_array().map(|v| v.len()), Some(0));

    let wrong_course = request(
        i,
        r,
        "4",
        "results.upload",
        json!({
            "semesterId": eee.sem_id,
            "courseId": mee.course_id,
            "entries": [{ "studentId": eee.student_ids[0], "score": 55 }]
        }),
    );
    assert_eq!(error_code(&wrong_course), "not_found");

    let empty = request(
        i,
        r,
        "5",
        "results.upload",
        json!({ "semesterId": eee.sem_id, "courseId": eee.course_id, "entries": [] }),
    );
    assert_eq!(error_code(&empty), "bad_params");

    let missing = request(i, r, "6", "results.upload", json!({ "courseId": eee.course_id }));
    assert_eq!(error_code(&missing), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn score_changes_regrade_and_return_to_pending() {
    let workspace = temp_dir("resultsd-results-update");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let f = seed(i, r, "GEO");
    request_ok(
        i,
        r,
        "2",
        "results.upload",
        json!({
            "semesterId": f.sem_id,
            "courseId": f.course_id,
            "uploadedBy": "lecturer-7",
            "entries": [
                { "studentId": f.student_ids[0], "score": 39.5 },
                { "studentId": f.student_ids[1], "score": 70 }
            ]
        }),
    );

    let listed = request_ok(i, r, "3", "results.list", json!({ "courseId": f.course_id }));
    let rows = listed["results"].as_array().expect("results").clone();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["grade"].as_str(), Some("F"));
    assert_eq!(rows[0]["isCarryover"].as_bool(), Some(true));
    assert_eq!(rows[0]["uploadedBy"].as_str(), Some("lecturer-7"));
    assert_eq!(rows[1]["grade"].as_str(), Some("A"));
    assert_eq!(rows[1]["gradePoint"].as_i64(), Some(5));

    let first_id = rows[0]["id"].as_str().expect("id").to_string();
    request_ok(i, r, "4", "results.approve", json!({ "resultId": first_id }));
    let approved = request_ok(i, r, "5", "results.list", json!({ "status": "approved" }));
    assert_eq!(approved["results"].as_array().map(|v| v.len()), Some(1));

    let updated = request_ok(i, r, "6", "results.update", json!({ "resultId": first_id, "score": 52 }));
    assert_eq!(updated["grade"].as_str(), Some("C"));
    assert_eq!(updated["isCarryover"].as_bool(), Some(false));
    assert_eq!(updated["status"].as_str(), Some("pending"));

    let bad_score = request(i, r, "7", "results.update", json!({ "resultId": first_id, "score": -1 }));
    assert_eq!(error_code(&bad_score), "invalid_score");

    // Re-uploading the same student and course replaces the score.
    request_ok(
        i,
        r,
        "8",
        "results.upload",
        json!({
            "semesterId": f.sem_id,
            "courseId": f.course_id,
            "entries": [{ "studentId": f.student_ids[1], "score": 61 }]
        }),
    );
    let listed = request_ok(i, r, "9", "results.list", json!({ "semesterId": f.sem_id }));
    let rows = listed["results"].as_array().expect("results");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["grade"].as_str(), Some("B"));

    let second_id = rows[1]["id"].as_str().expect("id").to_string();
    let rejected = request_ok(
        i,
        r,
        "10",
        "results.reject",
        json!({ "resultId": second_id, "reason": "script missing" }),
    );
    assert_eq!(rejected["status"].as_str(), Some("rejected"));
    let listed = request_ok(i, r, "11", "results.list", json!({ "status": "rejected" }));
    assert_eq!(
        listed["results"][0]["rejectionReason"].as_str(),
        Some("script missing")
    );

    let unknown = request(i, r, "12", "results.approve", json!({ "resultId": "nope" }));
    assert_eq!(error_code(&unknown), "not_found");
    let bad_filter = request(i, r, "13", "results.list", json!({ "status": "published" }));
    assert_eq!(error_code(&bad_filter), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn closed_uploads_are_refused() {
    let workspace = temp_dir("resultsd-results-closed");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (i, r) = (&mut stdin, &mut reader);

    request_ok(i, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let f = seed(i, r, "BIO");
    request_ok(
        i,
        r,
        "2",
        "settings.update",
        json!({ "section": "platform", "patch": { "resultUploadOpen": false } }),
    );
    let refused = request(
        i,
        r,
        "3",
        "results.upload",
        json!({
            "semesterId": f.sem_id,
            "courseId": f.course_id,
            "entries": [{ "studentId": f.student_ids[0], "score": 50 }]
        }),
    );
    assert_eq!(error_code(&refused), "uploads_closed");

    let courses = request_ok(i, r, "4", "courses.list", json!({ "departmentId": f.dept_id }));
    assert_eq!(courses["courses"][0]["isCore"].as_bool(), Some(true));
    let bad_unit = request(
        i,
        r,
        "5",
        "courses.create",
        json!({ "departmentId": f.dept_id, "code": "BIO999", "title": "Zero", "unit": 0 }),
    );
    assert_eq!(error_code(&bad_unit), "invalid_unit");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
