use serde_json::json;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

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

/// Four live targets covering every completion method plus one archived
/// target that still has a submission against it.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let steps: Vec<(&str, serde_json::Value)> = vec![
        ("courses.create", json!({ "id": "c1", "name": "Demo Course" })),
        ("levels.create", json!({ "id": "l1", "courseId": "c1", "number": 1 })),
        ("levels.create", json!({ "id": "l2", "courseId": "c1", "number": 2 })),
        (
            "targetGroups.create",
            json!({ "id": "tg1", "levelId": "l1", "sortIndex": 0, "milestone": true }),
        ),
        ("targetGroups.create", json!({ "id": "tg2", "levelId": "l1", "sortIndex": 1 })),
        ("targetGroups.create", json!({ "id": "tg3", "levelId": "l2", "sortIndex": 0 })),
        (
            "criteria.create",
            json!({ "id": "crit-q", "courseId": "c1", "name": "Quality" }),
        ),
        (
            "targets.create",
            json!({
                "id": "1",
                "targetGroupId": "tg1",
                "title": "Write a brief",
                "sortIndex": 0,
                "criterionIds": ["crit-q"]
            }),
        ),
        (
            "targets.create",
            json!({
                "id": "2",
                "targetGroupId": "tg1",
                "title": "Pass the checkpoint quiz",
                "sortIndex": 1,
                "hasQuiz": true
            }),
        ),
        (
            "targets.create",
            json!({
                "id": "3",
                "targetGroupId": "tg2",
                "title": "Read the guide",
                "sortIndex": 0,
                "linkToComplete": "https://example.com/guide"
            }),
        ),
        (
            "targets.create",
            json!({ "id": "4", "targetGroupId": "tg3", "title": "Attend the review call", "sortIndex": 0 }),
        ),
        (
            "targets.create",
            json!({
                "id": "5",
                "targetGroupId": "tg3",
                "title": "Retired milestone",
                "sortIndex": 1,
                "live": false
            }),
        ),
        ("teams.create", json!({ "id": "alpha", "courseId": "c1", "name": "Alpha Works" })),
        (
            "students.create",
            json!({ "id": "stu-x", "teamId": "alpha", "name": "Xia", "email": "x@example.com" }),
        ),
        (
            "students.create",
            json!({ "id": "stu-y", "teamId": "alpha", "name": "Yuri", "email": "y@example.com" }),
        ),
        ("tags.applyStudent", json!({ "studentId": "stu-x", "tags": ["pro"] })),
        (
            "submissions.create",
            json!({
                "id": "sx1",
                "targetId": "1",
                "studentIds": ["stu-x"],
                "createdAt": "2024-01-01T10:00:00+00:00",
                "evaluatedAt": "2024-01-02T10:00:00+00:00",
                "passedAt": "2024-01-02T10:00:00+00:00",
                "grades": [{ "criterionId": "crit-q", "grade": 8 }]
            }),
        ),
        (
            "submissions.create",
            json!({
                "id": "sy1",
                "targetId": "1",
                "studentIds": ["stu-y"],
                "createdAt": "2024-01-01T11:00:00+00:00",
                "evaluatedAt": "2024-01-02T11:00:00+00:00",
                "grades": [{ "criterionId": "crit-q", "grade": 2 }]
            }),
        ),
        (
            "submissions.create",
            json!({
                "id": "sx2",
                "targetId": "2",
                "studentIds": ["stu-x"],
                "createdAt": "2024-01-03T10:00:00+00:00",
                "passedAt": "2024-01-03T10:00:00+00:00",
                "quizScore": 3
            }),
        ),
        (
            "submissions.create",
            json!({
                "id": "sy2",
                "targetId": "2",
                "studentIds": ["stu-y"],
                "createdAt": "2024-01-03T11:00:00+00:00",
                "passedAt": "2024-01-03T11:00:00+00:00"
            }),
        ),
        (
            "submissions.create",
            json!({
                "id": "sx3",
                "targetId": "3",
                "studentIds": ["stu-x"],
                "createdAt": "2024-01-04T10:00:00+00:00"
            }),
        ),
        (
            "submissions.create",
            json!({
                "id": "sx5",
                "targetId": "5",
                "studentIds": ["stu-x"],
                "createdAt": "2024-01-05T10:00:00+00:00"
            }),
        ),
    ];
    for (i, (method, params)) in steps.into_iter().enumerate() {
        let id = format!("seed-{}", i);
        let _ = request_ok(stdin, reader, &id, method, params);
    }
}

fn prepare_content(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    label: &str,
    reviewed_only: bool,
    tags: serde_json::Value,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("{}-create", label),
        "exports.create",
        json!({ "courseId": "c1", "reviewedOnly": reviewed_only, "tags": tags }),
    );
    let export_id = created
        .get("exportId")
        .and_then(|v| v.as_str())
        .expect("exportId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        &format!("{}-prepare", label),
        "exports.prepare",
        json!({ "exportId": export_id }),
    );
    let path = workspace.join(format!("{}.ods", label));
    let _ = request_ok(
        stdin,
        reader,
        &format!("{}-save", label),
        "exports.saveFile",
        json!({ "exportId": export_id, "path": path.to_string_lossy() }),
    );

    let bytes = std::fs::read(&path).expect("read saved package");
    let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("open package");
    let mut content = String::new();
    archive
        .by_name("content.xml")
        .expect("content.xml present")
        .read_to_string(&mut content)
        .expect("read content.xml");
    content
}

fn table_section<'a>(content: &'a str, table: &str) -> &'a str {
    let marker = format!("table:name=\"{}\"", table);
    let start = content.find(&marker).expect("table present");
    let rest = &content[start..];
    let end = rest.find("</table:table>").expect("table closed");
    &rest[..end]
}

fn row_of<'a>(section: &'a str, needle: &str) -> &'a str {
    let pos = section.find(needle).expect("row present");
    let end = section[pos..]
        .find("</table:table-row>")
        .expect("row closed");
    &section[pos..pos + end]
}

#[test]
fn grade_cells_cover_the_classification_matrix() {
    let workspace = temp_dir("cohort-export-matrix");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let content = prepare_content(&mut stdin, &mut reader, &workspace, "full", false, json!([]));
    let submissions = table_section(&content, "Submissions");

    // Xia: passing grades, quiz score, and a pending review, in target order.
    assert!(submissions.contains(
        "<text:p>x@example.com</text:p></table:table-cell>\
         <table:table-cell table:style-name=\"passing-grade\" \
         office:value-type=\"string\"><text:p>8</text:p></table:table-cell>\
         <table:table-cell office:value-type=\"float\" office:value=\"3\">\
         <text:p>3</text:p></table:table-cell>\
         <table:table-cell table:style-name=\"pending-grade\" \
         office:value-type=\"string\"><text:p>RP</text:p></table:table-cell>\
         <table:table-cell/></table:table-row>"
    ));

    // Yuri: failing grades, an unscored quiz pass, and no other submissions.
    assert!(submissions.contains(
        "<text:p>y@example.com</text:p></table:table-cell>\
         <table:table-cell table:style-name=\"failing-grade\" \
         office:value-type=\"string\"><text:p>2</text:p></table:table-cell>\
         <table:table-cell office:value-type=\"string\">\
         <text:p>\u{2713}</text:p></table:table-cell>\
         <table:table-cell/><table:table-cell/></table:table-row>"
    ));
}

#[test]
fn archived_targets_are_omitted_and_their_submissions_ignored() {
    let workspace = temp_dir("cohort-export-archived");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let content = prepare_content(&mut stdin, &mut reader, &workspace, "full", false, json!([]));

    // The archived target never appears as a row or a column, and the
    // submission against it does not break preparation.
    assert!(!content.contains("L2T5"));
    assert!(!content.contains("Retired milestone"));

    let targets = table_section(&content, "Targets");
    let order: Vec<usize> = ["L1T1", "L1T2", "L1T3", "L2T4"]
        .iter()
        .map(|id| targets.find(&format!("<text:p>{}</text:p>", id)).expect("target row"))
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]));

    // Table 3's columns follow the same canonical order.
    let submissions = table_section(&content, "Submissions");
    let columns: Vec<usize> = ["L1T1", "L1T2", "L1T3", "L2T4"]
        .iter()
        .map(|id| submissions.find(&format!("<text:p>{}</text:p>", id)).expect("column"))
        .collect();
    assert!(columns.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn target_rows_carry_method_milestone_and_counts() {
    let workspace = temp_dir("cohort-export-targets");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let content = prepare_content(&mut stdin, &mut reader, &workspace, "full", false, json!([]));
    let targets = table_section(&content, "Targets");

    let graded = row_of(targets, "<text:p>L1T1</text:p>");
    assert!(graded.contains("<text:p>Graded</text:p>"));
    assert!(graded.contains("<text:p>Yes</text:p>"));
    // Two students submitted, both reviewed. Quality average over 8 and 2.
    assert!(graded.contains("office:value=\"2\""));
    assert!(graded.contains("office:value=\"0\""));
    assert!(graded.contains("office:value=\"5\""));

    let quiz = row_of(targets, "<text:p>L1T2</text:p>");
    assert!(quiz.contains("<text:p>Take Quiz</text:p>"));
    assert!(quiz.contains("<text:p>Yes</text:p>"));

    let link = row_of(targets, "<text:p>L1T3</text:p>");
    assert!(link.contains("<text:p>Visit Link</text:p>"));
    assert!(link.contains("<text:p>No</text:p>"));

    let manual = row_of(targets, "<text:p>L2T4</text:p>");
    assert!(manual.contains("<text:p>Mark as Complete</text:p>"));
    assert!(manual.contains("<text:p>No</text:p>"));
}

#[test]
fn reviewed_only_restricts_targets_to_graded_ones() {
    let workspace = temp_dir("cohort-export-reviewed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let content =
        prepare_content(&mut stdin, &mut reader, &workspace, "reviewed", true, json!([]));

    let targets = table_section(&content, "Targets");
    assert!(targets.contains("<text:p>L1T1</text:p>"));
    assert!(!targets.contains("L1T2"));
    assert!(!targets.contains("L1T3"));
    assert!(!targets.contains("L2T4"));

    let submissions = table_section(&content, "Submissions");
    assert!(submissions.contains("<text:p>L1T1</text:p>"));
    assert!(!submissions.contains("L1T2"));
}

#[test]
fn tag_filter_restricts_students_but_not_targets() {
    let workspace = temp_dir("cohort-export-tagged");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let content =
        prepare_content(&mut stdin, &mut reader, &workspace, "tagged", false, json!(["pro"]));

    let students = table_section(&content, "Students");
    assert!(students.contains("x@example.com"));
    assert!(!students.contains("y@example.com"));
    assert!(students.contains("<text:p>pro</text:p>"));

    let submissions = table_section(&content, "Submissions");
    assert!(submissions.contains("x@example.com"));
    assert!(!submissions.contains("y@example.com"));

    // The target axis is unaffected by the student tag filter.
    let targets = table_section(&content, "Targets");
    assert!(targets.contains("<text:p>L2T4</text:p>"));
}
