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
    let exe = env!("CARGO_BIN_EXE_cohortd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cohortd");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let steps: Vec<(&str, serde_json::Value)> = vec![
        ("courses.create", json!({ "id": "c1", "name": "Startup School" })),
        ("teams.create", json!({ "id": "alpha", "courseId": "c1", "name": "Alpha Works" })),
        ("teams.create", json!({ "id": "beta", "courseId": "c1", "name": "Beta Labs" })),
        (
            "students.create",
            json!({
                "id": "stu-z",
                "teamId": "beta",
                "name": "Zara",
                "email": "zara@example.com",
                "title": "CTO",
                "affiliation": "Beta Labs Inc"
            }),
        ),
        (
            "students.create",
            json!({ "id": "stu-a", "teamId": "alpha", "name": "Anna", "email": "anna@example.com" }),
        ),
        (
            "students.create",
            json!({
                "id": "stu-d",
                "teamId": "alpha",
                "name": "Dropped",
                "email": "dropped@example.com",
                "active": false
            }),
        ),
        ("tags.applyStudent", json!({ "studentId": "stu-a", "tags": ["ml", "b2b"] })),
    ];
    for (i, (method, params)) in steps.into_iter().enumerate() {
        let id = format!("seed-{}", i);
        let _ = request_ok(stdin, reader, &id, method, params);
    }
}

#[test]
fn model_lists_active_students_by_email_with_default_filled_tags() {
    let workspace = temp_dir("cohort-students-model");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "students.courseStudentsModel",
        json!({ "courseId": "c1" }),
    );

    assert_eq!(
        result.get("course"),
        Some(&json!({ "id": "c1", "name": "Startup School" }))
    );

    let students = result
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students array");
    assert_eq!(students.len(), 2);

    // Tag names come back sorted; students without tags still carry the key.
    assert_eq!(
        students[0],
        json!({
            "id": "stu-a",
            "name": "Anna",
            "email": "anna@example.com",
            "title": "",
            "affiliation": null,
            "teamId": "alpha",
            "userTags": ["b2b", "ml"]
        })
    );
    assert_eq!(
        students[1],
        json!({
            "id": "stu-z",
            "name": "Zara",
            "email": "zara@example.com",
            "title": "CTO",
            "affiliation": "Beta Labs Inc",
            "teamId": "beta",
            "userTags": []
        })
    );
}

#[test]
fn unknown_course_is_not_found() {
    let workspace = temp_dir("cohort-students-model-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let value = request(
        &mut stdin,
        &mut reader,
        "m1",
        "students.courseStudentsModel",
        json!({ "courseId": "no-such-course" }),
    );
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str()),
        Some("not_found")
    );
}
