use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::db;
use crate::score;
use crate::term_state::{self, Term, Visibility};

#[derive(Debug, Clone)]
pub struct ChainError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ChainError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    fn db_write(e: rusqlite::Error) -> Self {
        Self::new("db_insert_failed", e.to_string())
    }
}

impl From<term_state::StateError> for ChainError {
    fn from(e: term_state::StateError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub role: String,
    pub department_id: Option<String>,
    pub active: bool,
}

pub fn fetch_user(conn: &Connection, user_id: &str) -> Result<User, ChainError> {
    conn.query_row(
        "SELECT id, role, department_id, active FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok(User {
                id: r.get(0)?,
                role: r.get(1)?,
                department_id: r.get(2)?,
                active: r.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(ChainError::db)?
    .ok_or_else(|| {
        ChainError::with_details("not_found", "user not found", json!({ "userId": user_id }))
    })
}

fn require_active(user: &User) -> Result<(), ChainError> {
    if !user.active {
        return Err(ChainError::with_details(
            "unauthorized",
            "user is deactivated",
            json!({ "userId": user.id }),
        ));
    }
    Ok(())
}

fn require_department(user: &User) -> Result<String, ChainError> {
    user.department_id.clone().ok_or_else(|| {
        ChainError::with_details(
            "bad_params",
            format!("{} has no department", user.role),
            json!({ "userId": user.id }),
        )
    })
}

/// Three-valued Dean decision. HOD performance reviews only use the first two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Promoted,
    OnHold,
    NeedsImprovement,
}

impl Decision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PROMOTED" => Some(Self::Promoted),
            "ON_HOLD" => Some(Self::OnHold),
            "NEEDS_IMPROVEMENT" => Some(Self::NeedsImprovement),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promoted => "PROMOTED",
            Self::OnHold => "ON_HOLD",
            Self::NeedsImprovement => "NEEDS_IMPROVEMENT",
        }
    }
}

fn check_flat_score(score: i64) -> Result<(), ChainError> {
    if !(1..=10).contains(&score) {
        return Err(ChainError::with_details(
            "bad_params",
            "score must be between 1 and 10",
            json!({ "score": score }),
        ));
    }
    Ok(())
}

fn check_rubric(rubric: &BTreeMap<String, i64>) -> Result<(), ChainError> {
    if let Err((key, value)) = score::validate_rubric(rubric) {
        return Err(ChainError::with_details(
            "bad_params",
            "rubric scores must be integers between 1 and 5",
            json!({ "item": key, "value": value }),
        ));
    }
    Ok(())
}

/// Stage 1: the teacher's self-evaluation. Gated on the department's term
/// stage being PUBLISHED; freely re-submittable (answers upsert in place).
pub fn submit_teacher_answers(
    conn: &Connection,
    teacher: &User,
    term: Term,
    year: i64,
    answers: &[(String, String)],
    self_comment: &str,
) -> Result<usize, ChainError> {
    if teacher.role != "TEACHER" {
        return Err(ChainError::with_details(
            "bad_params",
            "subject is not a teacher",
            json!({ "userId": teacher.id, "role": teacher.role }),
        ));
    }
    require_active(teacher)?;
    let department_id = require_department(teacher)?;

    let state = term_state::get_state(conn, &department_id, year)?;
    let visibility = state.term_visibility(term);
    if visibility != Visibility::Published {
        return Err(ChainError::with_details(
            "prerequisite_not_met",
            format!("{} term is not open for teacher submissions", term.as_str()),
            json!({
                "required": "termPublished",
                "term": term.as_str(),
                "visibility": visibility.as_str(),
            }),
        ));
    }

    for (question_id, _) in answers {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT department_id, term FROM questions WHERE id = ?",
                [question_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(ChainError::db)?;
        let Some((q_dept, q_term)) = row else {
            return Err(ChainError::with_details(
                "not_found",
                "question not found",
                json!({ "questionId": question_id }),
            ));
        };
        if q_dept != department_id || q_term != term.as_str() {
            return Err(ChainError::with_details(
                "bad_params",
                "question does not belong to this department and term",
                json!({ "questionId": question_id }),
            ));
        }
    }

    let now = db::now_rfc3339();
    for (question_id, answer) in answers {
        conn.execute(
            "INSERT INTO teacher_answers(id, teacher_id, question_id, term, year, answer, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(teacher_id, question_id, term, year) DO UPDATE SET
               answer = excluded.answer,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &teacher.id,
                question_id,
                term.as_str(),
                year,
                answer,
                &now,
            ),
        )
        .map_err(ChainError::db_write)?;
    }

    conn.execute(
        "INSERT INTO self_comments(id, teacher_id, term, year, comment, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(teacher_id, term, year) DO UPDATE SET
           comment = excluded.comment,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &teacher.id,
            term.as_str(),
            year,
            self_comment,
            &now,
        ),
    )
    .map_err(ChainError::db_write)?;

    Ok(answers.len())
}

fn teacher_submission_exists(
    conn: &Connection,
    teacher_id: &str,
    term: Term,
    year: i64,
) -> Result<bool, ChainError> {
    let answers: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM teacher_answers WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| r.get(0),
        )
        .map_err(ChainError::db)?;
    if answers == 0 {
        return Ok(false);
    }
    let comment: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM self_comments WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| r.get(0),
        )
        .map_err(ChainError::db)?;
    Ok(comment > 0)
}

/// Stage 2: the HOD scores the teacher. Re-upsert is allowed; only the Dean
/// stage is single-shot.
pub fn submit_hod_review(
    conn: &Connection,
    hod: &User,
    teacher: &User,
    term: Term,
    year: i64,
    comment: &str,
    flat_score: i64,
    rubric: &BTreeMap<String, i64>,
    question_scores: Option<&serde_json::Value>,
) -> Result<(), ChainError> {
    if hod.role != "HOD" {
        return Err(ChainError::with_details(
            "unauthorized",
            "only a HOD may submit this review",
            json!({ "callerId": hod.id, "role": hod.role }),
        ));
    }
    require_active(hod)?;
    let hod_dept = require_department(hod)?;
    let teacher_dept = require_department(teacher)?;
    if hod_dept != teacher_dept {
        return Err(ChainError::with_details(
            "unauthorized",
            "teacher belongs to a different department",
            json!({ "teacherId": teacher.id }),
        ));
    }

    check_flat_score(flat_score)?;
    check_rubric(rubric)?;

    if !teacher_submission_exists(conn, &teacher.id, term, year)? {
        return Err(ChainError::with_details(
            "prerequisite_not_met",
            "teacher has not submitted a self-evaluation",
            json!({
                "missing": "teacherSubmission",
                "teacherId": teacher.id,
                "term": term.as_str(),
            }),
        ));
    }

    let scores_json = json!({
        "rubric": rubric,
        "questions": question_scores.cloned().unwrap_or(json!({})),
    });

    conn.execute(
        "INSERT INTO hod_reviews(id, teacher_id, hod_id, term, year, comment, score, scores, submitted, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(teacher_id, term, year) DO UPDATE SET
           hod_id = excluded.hod_id,
           comment = excluded.comment,
           score = excluded.score,
           scores = excluded.scores,
           submitted = 1,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &teacher.id,
            &hod.id,
            term.as_str(),
            year,
            comment,
            flat_score,
            scores_json.to_string(),
            db::now_rfc3339(),
        ),
    )
    .map_err(ChainError::db_write)?;
    Ok(())
}

fn stage_submitted(
    conn: &Connection,
    table: &str,
    teacher_id: &str,
    term: Term,
    year: i64,
) -> Result<bool, ChainError> {
    let sql = format!(
        "SELECT submitted FROM {} WHERE teacher_id = ? AND term = ? AND year = ?",
        table
    );
    let submitted: Option<i64> = conn
        .query_row(&sql, (teacher_id, term.as_str(), year), |r| r.get(0))
        .optional()
        .map_err(ChainError::db)?;
    Ok(submitted == Some(1))
}

/// Stage 3: the Assistant Dean scores the teacher, gated on the HOD review.
pub fn submit_asst_review(
    conn: &Connection,
    asst: &User,
    teacher: &User,
    term: Term,
    year: i64,
    comment: &str,
    flat_score: i64,
) -> Result<(), ChainError> {
    if asst.role != "ASST_DEAN" {
        return Err(ChainError::with_details(
            "unauthorized",
            "only an assistant dean may submit this review",
            json!({ "callerId": asst.id, "role": asst.role }),
        ));
    }
    require_active(asst)?;
    check_flat_score(flat_score)?;

    if !stage_submitted(conn, "hod_reviews", &teacher.id, term, year)? {
        return Err(ChainError::with_details(
            "prerequisite_not_met",
            "HOD review not completed",
            json!({
                "missing": "hodReview",
                "teacherId": teacher.id,
                "term": term.as_str(),
            }),
        ));
    }

    conn.execute(
        "INSERT INTO asst_reviews(id, teacher_id, asst_dean_id, term, year, comment, score, submitted, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(teacher_id, term, year) DO UPDATE SET
           asst_dean_id = excluded.asst_dean_id,
           comment = excluded.comment,
           score = excluded.score,
           submitted = 1,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &teacher.id,
            &asst.id,
            term.as_str(),
            year,
            comment,
            flat_score,
            db::now_rfc3339(),
        ),
    )
    .map_err(ChainError::db_write)?;
    Ok(())
}

fn linked_term_id(
    conn: &Connection,
    department_id: &str,
    term: Term,
    year: i64,
) -> Result<Option<String>, ChainError> {
    conn.query_row(
        "SELECT t.id FROM terms t
         JOIN term_departments td ON td.term_id = t.id
         WHERE td.department_id = ? AND t.year = ? AND t.status = ?
         ORDER BY t.id LIMIT 1",
        (department_id, year, term.as_str()),
        |r| r.get(0),
    )
    .optional()
    .map_err(ChainError::db)
}

/// Stage 4: the Dean's finalization. Single-shot per (teacher, term, year);
/// a second attempt after submitted=true fails with already_finalized. On
/// success, runs completion detection for the teacher's department and
/// returns true when the department just went COMPLETE for this term.
pub fn submit_final_review(
    conn: &Connection,
    dean: &User,
    teacher: &User,
    term: Term,
    year: i64,
    comment: &str,
    final_score: i64,
    status: Decision,
) -> Result<bool, ChainError> {
    if dean.role != "DEAN" {
        return Err(ChainError::with_details(
            "unauthorized",
            "only the dean may finalize a review",
            json!({ "callerId": dean.id, "role": dean.role }),
        ));
    }
    require_active(dean)?;
    if !(0..=100).contains(&final_score) {
        return Err(ChainError::with_details(
            "bad_params",
            "finalScore must be between 0 and 100",
            json!({ "finalScore": final_score }),
        ));
    }

    if !stage_submitted(conn, "asst_reviews", &teacher.id, term, year)? {
        return Err(ChainError::with_details(
            "prerequisite_not_met",
            "assistant dean review not completed",
            json!({
                "missing": "asstReview",
                "teacherId": teacher.id,
                "term": term.as_str(),
            }),
        ));
    }
    if stage_submitted(conn, "final_reviews", &teacher.id, term, year)? {
        return Err(ChainError::with_details(
            "already_finalized",
            "final review already submitted for this term",
            json!({
                "teacherId": teacher.id,
                "term": term.as_str(),
                "year": year,
            }),
        ));
    }

    let department_id = require_department(teacher)?;
    let term_id = linked_term_id(conn, &department_id, term, year)?;

    conn.execute(
        "INSERT INTO final_reviews(id, teacher_id, reviewer_id, term, year, term_id, final_comment, final_score, status, submitted, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(teacher_id, term, year) DO UPDATE SET
           reviewer_id = excluded.reviewer_id,
           term_id = excluded.term_id,
           final_comment = excluded.final_comment,
           final_score = excluded.final_score,
           status = excluded.status,
           submitted = 1,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &teacher.id,
            &dean.id,
            term.as_str(),
            year,
            term_id,
            comment,
            final_score,
            status.as_str(),
            db::now_rfc3339(),
        ),
    )
    .map_err(ChainError::db_write)?;

    detect_completion(conn, &department_id, term, year)
}

/// Read-count-then-write; benign under concurrent finalizations because
/// mark_complete is idempotent.
fn detect_completion(
    conn: &Connection,
    department_id: &str,
    term: Term,
    year: i64,
) -> Result<bool, ChainError> {
    let total: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'TEACHER' AND department_id = ? AND active = 1",
            [department_id],
            |r| r.get(0),
        )
        .map_err(ChainError::db)?;
    let finalized: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM final_reviews fr
             JOIN users u ON u.id = fr.teacher_id
             WHERE u.department_id = ? AND fr.term = ? AND fr.year = ? AND fr.submitted = 1",
            (department_id, term.as_str(), year),
            |r| r.get(0),
        )
        .map_err(ChainError::db)?;

    if total > 0 && finalized >= total {
        term_state::mark_complete(conn, department_id, year, term)?;
        return Ok(true);
    }
    Ok(false)
}

/// HOD performance reviews are deliberately not a chain: the Asst-Dean track
/// and the Dean track coexist per (hod, term, year) and may land in any order.
pub fn submit_hod_performance(
    conn: &Connection,
    reviewer: &User,
    hod: &User,
    term: Term,
    year: i64,
    comments: &str,
    rubric: &BTreeMap<String, i64>,
    status: Decision,
) -> Result<Option<i64>, ChainError> {
    if reviewer.role != "ASST_DEAN" && reviewer.role != "DEAN" {
        return Err(ChainError::with_details(
            "unauthorized",
            "only an assistant dean or the dean may review a HOD",
            json!({ "reviewerId": reviewer.id, "role": reviewer.role }),
        ));
    }
    require_active(reviewer)?;
    if hod.role != "HOD" {
        return Err(ChainError::with_details(
            "bad_params",
            "subject is not a HOD",
            json!({ "userId": hod.id, "role": hod.role }),
        ));
    }
    if status == Decision::NeedsImprovement {
        return Err(ChainError::with_details(
            "bad_params",
            "HOD performance status must be PROMOTED or ON_HOLD",
            json!({ "status": status.as_str() }),
        ));
    }
    check_rubric(rubric)?;

    let total = score::normalize(rubric);

    conn.execute(
        "INSERT INTO hod_performance_reviews(id, hod_id, reviewer_id, term, year, comments, scores, total_score, status, submitted, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(hod_id, term, year, reviewer_id) DO UPDATE SET
           comments = excluded.comments,
           scores = excluded.scores,
           total_score = excluded.total_score,
           status = excluded.status,
           submitted = 1,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &hod.id,
            &reviewer.id,
            term.as_str(),
            year,
            comments,
            json!(rubric).to_string(),
            total,
            status.as_str(),
            db::now_rfc3339(),
        ),
    )
    .map_err(ChainError::db_write)?;

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parse_accepts_all_three_values() {
        assert_eq!(Decision::parse("PROMOTED"), Some(Decision::Promoted));
        assert_eq!(Decision::parse("on_hold"), Some(Decision::OnHold));
        assert_eq!(
            Decision::parse("needs_improvement"),
            Some(Decision::NeedsImprovement)
        );
        assert_eq!(Decision::parse("FIRED"), None);
    }
}
