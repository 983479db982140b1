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
    let exe = env!("CARGO_BIN_EXE_facultyd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn facultyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn hod_resubmission_overwrites_single_row() {
    let workspace = temp_dir("facultyd-upsert-hod");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "name": "Site Admin", "email": "admin@campus.edu", "role": "ADMIN" }),
    );
    let admin_id = admin.get("userId").and_then(|v| v.as_str()).expect("adminId").to_string();
    let dept = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departments.create",
        json!({ "callerId": admin_id, "name": "Physics" }),
    );
    let dept_id = dept
        .get("departmentId")
        .and_then(|v| v.as_str())
        .expect("departmentId")
        .to_string();
    let hod = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "callerId": admin_id, "name": "Hana", "email": "hod@campus.edu", "role": "HOD", "departmentId": dept_id }),
    );
    let hod_id = hod.get("userId").and_then(|v| v.as_str()).expect("hodId").to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({ "callerId": admin_id, "name": "Tom", "email": "tom@campus.edu", "role": "TEACHER", "departmentId": dept_id }),
    );
    let teacher_id = teacher
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let question = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "questions.upsert",
        json!({
            "callerId": hod_id,
            "term": "START",
            "text": "What went well?",
            "type": "TEXT",
        }),
    );
    let question_id = question
        .get("questionId")
        .and_then(|v| v.as_str())
        .expect("questionId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "terms.publishStage",
        json!({
            "callerId": admin_id,
            "departmentId": dept_id,
            "term": "START",
            "stage": "teacherReview",
            "year": 2025,
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reviews.submitTeacherAnswers",
        json!({
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "answers": [{ "questionId": question_id, "answer": "Lab redesign." }],
            "selfComment": "First pass.",
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reviews.submitHod",
        json!({
            "callerId": hod_id,
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "comment": "Initial take.",
            "score": 6,
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reviews.submitHod",
        json!({
            "callerId": hod_id,
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "comment": "Revised after observation.",
            "score": 9,
        }),
    );

    let chain = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reviews.getChain",
        json!({ "teacherId": teacher_id, "term": "START", "year": 2025 }),
    );
    let hod_review = chain.get("hodReview").expect("hodReview");
    assert_eq!(
        hod_review.get("comment").and_then(|v| v.as_str()),
        Some("Revised after observation.")
    );
    assert_eq!(hod_review.get("score").and_then(|v| v.as_i64()), Some(9));
    assert_eq!(hod_review.get("submitted").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn teacher_answers_resubmission_edits_in_place() {
    let workspace = temp_dir("facultyd-upsert-answers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "name": "Site Admin", "email": "admin@campus.edu", "role": "ADMIN" }),
    );
    let admin_id = admin.get("userId").and_then(|v| v.as_str()).expect("adminId").to_string();
    let dept = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "departments.create",
        json!({ "callerId": admin_id, "name": "History" }),
    );
    let dept_id = dept
        .get("departmentId")
        .and_then(|v| v.as_str())
        .expect("departmentId")
        .to_string();
    let hod = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({ "callerId": admin_id, "name": "Hana", "email": "hod@campus.edu", "role": "HOD", "departmentId": dept_id }),
    );
    let hod_id = hod.get("userId").and_then(|v| v.as_str()).expect("hodId").to_string();
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({ "callerId": admin_id, "name": "Tom", "email": "tom@campus.edu", "role": "TEACHER", "departmentId": dept_id }),
    );
    let teacher_id = teacher
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let question = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "questions.upsert",
        json!({
            "callerId": hod_id,
            "term": "START",
            "text": "Main achievement?",
            "type": "TEXT",
        }),
    );
    let question_id = question
        .get("questionId")
        .and_then(|v| v.as_str())
        .expect("questionId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "terms.publishStage",
        json!({
            "callerId": admin_id,
            "departmentId": dept_id,
            "term": "START",
            "stage": "teacherReview",
            "year": 2025,
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reviews.submitTeacherAnswers",
        json!({
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "answers": [{ "questionId": question_id, "answer": "Draft answer." }],
            "selfComment": "Draft comment.",
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reviews.submitTeacherAnswers",
        json!({
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "answers": [{ "questionId": question_id, "answer": "Final answer." }],
            "selfComment": "Final comment.",
        }),
    );

    let chain = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reviews.getChain",
        json!({ "teacherId": teacher_id, "term": "START", "year": 2025 }),
    );
    let answers = chain.get("answers").and_then(|v| v.as_array()).expect("answers");
    assert_eq!(answers.len(), 1);
    assert_eq!(
        answers[0].get("answer").and_then(|v| v.as_str()),
        Some("Final answer.")
    );
    assert_eq!(
        chain.get("selfComment").and_then(|v| v.as_str()),
        Some("Final comment.")
    );
}
