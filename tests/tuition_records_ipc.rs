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
    let exe = env!("CARGO_BIN_EXE_classbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classbookd");
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

struct Fixture {
    class_id: String,
    student_id: String,
}

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        stdin,
        reader,
        "c1",
        "classes.create",
        json!({
            "name": "Piano",
            "startDate": "2024-01-01",
            "endDate": "2024-06-30",
            "tuition": 80.0
        }),
    );
    let student = request_ok(
        stdin,
        reader,
        "s1",
        "students.create",
        json!({ "name": "En Vo" }),
    );
    Fixture {
        class_id: class
            .get("classId")
            .and_then(|v| v.as_str())
            .expect("classId")
            .to_string(),
        student_id: student
            .get("studentId")
            .and_then(|v| v.as_str())
            .expect("studentId")
            .to_string(),
    }
}

#[test]
fn create_validates_and_rejects_duplicates() {
    let workspace = temp_dir("classbook-tuition");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    // Missing / malformed fields never write a partial record.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "e1",
        "tuition.create",
        json!({ "classId": fx.class_id, "studentId": fx.student_id, "month": "03/2024" }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "e2",
        "tuition.create",
        json!({
            "classId": fx.class_id,
            "studentId": fx.student_id,
            "month": "03/2024",
            "amount": 0.0
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "e3",
        "tuition.create",
        json!({
            "classId": fx.class_id,
            "studentId": fx.student_id,
            "month": "2024-03",
            "amount": 80.0
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "e4",
        "tuition.create",
        json!({
            "classId": "missing-class",
            "studentId": fx.student_id,
            "month": "03/2024",
            "amount": 80.0
        }),
    );
    assert_eq!(code, "not_found");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "ok1",
        "tuition.create",
        json!({
            "classId": fx.class_id,
            "studentId": fx.student_id,
            "month": "03/2024",
            "amount": 80.0
        }),
    );
    assert_eq!(
        created.get("status").and_then(|v| v.as_str()),
        Some("pending")
    );

    // Second create for the same (class, student, month) is rejected.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "dup",
        "tuition.create",
        json!({
            "classId": fx.class_id,
            "studentId": fx.student_id,
            "month": "03/2024",
            "amount": 80.0
        }),
    );
    assert_eq!(code, "duplicate_tuition_period");

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "tuition.list",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(
        records
            .get("records")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn status_changes_round_trip_and_filter() {
    let workspace = temp_dir("classbook-tuition-status");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "ok1",
        "tuition.create",
        json!({
            "classId": fx.class_id,
            "studentId": fx.student_id,
            "month": "02/2024",
            "amount": 80.0
        }),
    );
    let tuition_id = created
        .get("tuitionId")
        .and_then(|v| v.as_str())
        .expect("tuitionId")
        .to_string();

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "bad",
        "tuition.setStatus",
        json!({ "tuitionId": tuition_id, "status": "void" }),
    );
    assert_eq!(code, "bad_params");

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "paid",
        "tuition.setStatus",
        json!({ "tuitionId": tuition_id, "status": "paid" }),
    );
    assert_eq!(set.get("status").and_then(|v| v.as_str()), Some("paid"));

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "listpaid",
        "tuition.list",
        json!({ "classId": fx.class_id, "status": "paid" }),
    );
    assert_eq!(
        paid.get("records")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "listpending",
        "tuition.list",
        json!({ "classId": fx.class_id, "status": "pending" }),
    );
    assert_eq!(
        pending
            .get("records")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // A payment can be reversed.
    let set = request_ok(
        &mut stdin,
        &mut reader,
        "unpaid",
        "tuition.setStatus",
        json!({ "tuitionId": tuition_id, "status": "pending" }),
    );
    assert_eq!(set.get("status").and_then(|v| v.as_str()), Some("pending"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "tuition.delete",
        json!({ "tuitionId": tuition_id }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "del2",
        "tuition.delete",
        json!({ "tuitionId": tuition_id }),
    );
    assert_eq!(code, "not_found");
}
