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

#[test]
fn full_chain_start_term_promotion_and_single_shot_finalization() {
    let workspace = temp_dir("facultyd-full-chain");
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
        json!({ "callerId": admin_id, "name": "Chemistry" }),
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
    let asst = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.create",
        json!({ "callerId": admin_id, "name": "Asha", "email": "asst@campus.edu", "role": "ASST_DEAN" }),
    );
    let asst_id = asst.get("userId").and_then(|v| v.as_str()).expect("asstId").to_string();
    let dean = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.create",
        json!({ "callerId": admin_id, "name": "Dina", "email": "dean@campus.edu", "role": "DEAN" }),
    );
    let dean_id = dean.get("userId").and_then(|v| v.as_str()).expect("deanId").to_string();

    let q1 = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "questions.upsert",
        json!({
            "callerId": hod_id,
            "term": "START",
            "text": "Describe a lesson that worked well.",
            "type": "TEXTAREA",
            "required": true,
            "order": 1,
        }),
    );
    let q1_id = q1.get("questionId").and_then(|v| v.as_str()).expect("q1").to_string();
    let q2 = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "questions.upsert",
        json!({
            "callerId": hod_id,
            "term": "START",
            "text": "Did you meet your professional development goals?",
            "type": "MCQ",
            "options": ["Yes", "Partially", "No"],
            "optionScores": [5, 3, 1],
            "order": 2,
        }),
    );
    let q2_id = q2.get("questionId").and_then(|v| v.as_str()).expect("q2").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "terms.setActive",
        json!({ "callerId": admin_id, "departmentId": dept_id, "term": "START", "year": 2025 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "terms.publishStage",
        json!({
            "callerId": admin_id,
            "departmentId": dept_id,
            "term": "START",
            "stage": "teacherReview",
            "year": 2025,
        }),
    );

    // Teacher submits two answers plus a self comment.
    let submit = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "reviews.submitTeacherAnswers",
        json!({
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "answers": [
                { "questionId": q1_id, "answer": "Flipped classroom on stoichiometry." },
                { "questionId": q2_id, "answer": "Yes" },
            ],
            "selfComment": "Strong start to the year.",
        }),
    );
    assert_eq!(submit.get("answersSaved").and_then(|v| v.as_i64()), Some(2));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "reviews.submitHod",
        json!({
            "callerId": hod_id,
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "comment": "Consistently well prepared.",
            "score": 9,
            "rubricScores": {
                "[Professionalism] Punctuality": 5,
                "[Responsibilities] Curriculum coverage": 4,
                "[Development] Workshop attendance": 4,
                "[Engagement] Student feedback": 5,
            },
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "reviews.submitAsst",
        json!({
            "callerId": asst_id,
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "comment": "Agree with the department head.",
            "score": 8,
        }),
    );
    let final_resp = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "reviews.submitFinal",
        json!({
            "callerId": dean_id,
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "comment": "Approved for promotion.",
            "finalScore": 85,
            "status": "PROMOTED",
        }),
    );
    // Sole teacher in the department: finalization completes the term.
    assert_eq!(
        final_resp.get("departmentComplete").and_then(|v| v.as_bool()),
        Some(true)
    );

    let state = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "terms.getState",
        json!({ "departmentId": dept_id, "year": 2025 }),
    );
    assert_eq!(
        state.get("startTermVisibility").and_then(|v| v.as_str()),
        Some("COMPLETE")
    );
    // START completion makes overall results visible.
    assert_eq!(
        state.get("overallVisibility").and_then(|v| v.as_str()),
        Some("PUBLISHED")
    );

    let chain = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "reviews.getChain",
        json!({ "teacherId": teacher_id, "term": "START", "year": 2025 }),
    );
    let final_review = chain.get("finalReview").expect("finalReview");
    assert_eq!(
        final_review.get("status").and_then(|v| v.as_str()),
        Some("PROMOTED")
    );
    let hod_review = chain.get("hodReview").expect("hodReview");
    // 18/20 rubric points -> 90 percent, computed on read.
    assert_eq!(hod_review.get("rubricTotal").and_then(|v| v.as_i64()), Some(90));

    // Finalization is single-shot.
    let second = request(
        &mut stdin,
        &mut reader,
        "18",
        "reviews.submitFinal",
        json!({
            "callerId": dean_id,
            "teacherId": teacher_id,
            "term": "START",
            "year": 2025,
            "comment": "Trying to change my mind.",
            "finalScore": 40,
            "status": "ON_HOLD",
        }),
    );
    assert_eq!(second.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        second
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("already_finalized")
    );

    // Projector row reflects the finalized chain.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "reports.forRole",
        json!({ "role": "TEACHER", "departmentId": dept_id, "term": "START", "year": 2025 }),
    );
    let rows = report.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("submitted").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(row.get("hodScore").and_then(|v| v.as_i64()), Some(9));
    assert_eq!(row.get("asstScore").and_then(|v| v.as_i64()), Some(8));
    assert_eq!(row.get("combinedScore").and_then(|v| v.as_i64()), Some(17));
    assert_eq!(row.get("performancePercent").and_then(|v| v.as_i64()), Some(85));
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("PROMOTED"));
    assert_eq!(row.get("promoted").and_then(|v| v.as_bool()), Some(true));
}
