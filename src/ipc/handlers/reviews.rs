use crate::chain::{self, ChainError, Decision};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::score;
use crate::term_state::Term;
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn year_param(req: &Request) -> i64 {
    req.params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().year() as i64)
}

fn parse_term(req: &Request) -> Result<Term, serde_json::Value> {
    let raw = required_str(req, "term")?;
    Term::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "term must be START or END",
            Some(json!({ "term": raw })),
        )
    })
}

fn chain_err(req: &Request, e: ChainError) -> serde_json::Value {
    err(&req.id, e.code, e.message, e.details)
}

fn parse_rubric(req: &Request, key: &str) -> Result<BTreeMap<String, i64>, serde_json::Value> {
    let Some(value) = req.params.get(key) else {
        return Ok(BTreeMap::new());
    };
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    let Some(obj) = value.as_object() else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an object of integer scores", key),
            None,
        ));
    };
    let mut out = BTreeMap::new();
    for (k, v) in obj {
        let Some(n) = v.as_i64() else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} values must be integers", key),
                Some(json!({ "item": k })),
            ));
        };
        out.insert(k.clone(), n);
    }
    Ok(out)
}

fn required_score(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing/invalid {}", key), None))
}

fn fetch_user(
    conn: &Connection,
    req: &Request,
    user_id: &str,
) -> Result<chain::User, serde_json::Value> {
    chain::fetch_user(conn, user_id).map_err(|e| chain_err(req, e))
}

fn handle_submit_teacher_answers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    let self_comment = match required_str(req, "selfComment") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(answers_arr) = req.params.get("answers").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing answers[]", None);
    };

    let mut answers: Vec<(String, String)> = Vec::with_capacity(answers_arr.len());
    for (i, entry) in answers_arr.iter().enumerate() {
        let question_id = entry.get("questionId").and_then(|v| v.as_str());
        let answer = entry.get("answer").and_then(|v| v.as_str());
        match (question_id, answer) {
            (Some(q), Some(a)) => answers.push((q.to_string(), a.to_string())),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("answer at index {} needs questionId and answer", i),
                    None,
                )
            }
        }
    }

    let teacher = match fetch_user(conn, req, &teacher_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match chain::submit_teacher_answers(conn, &teacher, term, year, &answers, &self_comment) {
        Ok(saved) => ok(&req.id, json!({ "ok": true, "answersSaved": saved })),
        Err(e) => chain_err(req, e),
    }
}

fn handle_submit_hod(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let caller_id = match required_str(req, "callerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    let comment = match required_str(req, "comment") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let flat_score = match required_score(req, "score") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rubric = match parse_rubric(req, "rubricScores") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let question_scores = req.params.get("questionScores");

    let hod = match fetch_user(conn, req, &caller_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher = match fetch_user(conn, req, &teacher_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match chain::submit_hod_review(
        conn,
        &hod,
        &teacher,
        term,
        year,
        &comment,
        flat_score,
        &rubric,
        question_scores,
    ) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => chain_err(req, e),
    }
}

fn handle_submit_asst(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let caller_id = match required_str(req, "callerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    let comment = match required_str(req, "comment") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let flat_score = match required_score(req, "score") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let asst = match fetch_user(conn, req, &caller_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher = match fetch_user(conn, req, &teacher_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match chain::submit_asst_review(conn, &asst, &teacher, term, year, &comment, flat_score) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => chain_err(req, e),
    }
}

fn handle_submit_final(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let caller_id = match required_str(req, "callerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    let comment = match required_str(req, "comment") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let final_score = match required_score(req, "finalScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status_raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(status) = Decision::parse(&status_raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be PROMOTED, ON_HOLD or NEEDS_IMPROVEMENT",
            Some(json!({ "status": status_raw })),
        );
    };

    let dean = match fetch_user(conn, req, &caller_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher = match fetch_user(conn, req, &teacher_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match chain::submit_final_review(
        conn,
        &dean,
        &teacher,
        term,
        year,
        &comment,
        final_score,
        status,
    ) {
        Ok(department_complete) => ok(
            &req.id,
            json!({ "ok": true, "departmentComplete": department_complete }),
        ),
        Err(e) => chain_err(req, e),
    }
}

fn handle_submit_hod_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reviewer_id = match required_str(req, "reviewerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let hod_id = match required_str(req, "hodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    let comments = match required_str(req, "comments") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rubric = match parse_rubric(req, "rubricScores") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status_raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(status) = Decision::parse(&status_raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be PROMOTED or ON_HOLD",
            Some(json!({ "status": status_raw })),
        );
    };

    let reviewer = match fetch_user(conn, req, &reviewer_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let hod = match fetch_user(conn, req, &hod_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match chain::submit_hod_performance(conn, &reviewer, &hod, term, year, &comments, &rubric, status)
    {
        Ok(total) => ok(&req.id, json!({ "ok": true, "totalScore": total })),
        Err(e) => chain_err(req, e),
    }
}

fn rubric_from_stored(scores_json: Option<&str>) -> Option<BTreeMap<String, i64>> {
    let parsed: serde_json::Value = serde_json::from_str(scores_json?).ok()?;
    score::rubric_from_json(parsed.get("rubric").unwrap_or(&parsed))
}

pub(super) fn rubric_total_from_stored(scores_json: Option<&str>) -> Option<i64> {
    score::normalize(&rubric_from_stored(scores_json)?)
}

fn handle_get_chain(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    if let Err(e) = fetch_user(conn, req, &teacher_id) {
        return e;
    }

    let mut answers_stmt = match conn.prepare(
        "SELECT question_id, answer, updated_at FROM teacher_answers
         WHERE teacher_id = ? AND term = ? AND year = ? ORDER BY question_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let answers = answers_stmt
        .query_map((&teacher_id, term.as_str(), year), |r| {
            Ok(json!({
                "questionId": r.get::<_, String>(0)?,
                "answer": r.get::<_, String>(1)?,
                "updatedAt": r.get::<_, Option<String>>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let answers = match answers {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let self_comment: Option<String> = match conn
        .query_row(
            "SELECT comment FROM self_comments WHERE teacher_id = ? AND term = ? AND year = ?",
            (&teacher_id, term.as_str(), year),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let hod = match conn
        .query_row(
            "SELECT hod_id, comment, score, scores, submitted FROM hod_reviews
             WHERE teacher_id = ? AND term = ? AND year = ?",
            (&teacher_id, term.as_str(), year),
            |r| {
                let scores: Option<String> = r.get(3)?;
                Ok(json!({
                    "hodId": r.get::<_, String>(0)?,
                    "comment": r.get::<_, Option<String>>(1)?,
                    "score": r.get::<_, Option<i64>>(2)?,
                    "rubricTotal": rubric_total_from_stored(scores.as_deref()),
                    "submitted": r.get::<_, i64>(4)? != 0,
                }))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let asst = match conn
        .query_row(
            "SELECT asst_dean_id, comment, score, submitted FROM asst_reviews
             WHERE teacher_id = ? AND term = ? AND year = ?",
            (&teacher_id, term.as_str(), year),
            |r| {
                Ok(json!({
                    "asstDeanId": r.get::<_, String>(0)?,
                    "comment": r.get::<_, Option<String>>(1)?,
                    "score": r.get::<_, Option<i64>>(2)?,
                    "submitted": r.get::<_, i64>(3)? != 0,
                }))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let final_review = match conn
        .query_row(
            "SELECT reviewer_id, final_comment, final_score, status, submitted FROM final_reviews
             WHERE teacher_id = ? AND term = ? AND year = ?",
            (&teacher_id, term.as_str(), year),
            |r| {
                Ok(json!({
                    "reviewerId": r.get::<_, String>(0)?,
                    "comment": r.get::<_, Option<String>>(1)?,
                    "finalScore": r.get::<_, Option<i64>>(2)?,
                    "status": r.get::<_, String>(3)?,
                    "submitted": r.get::<_, i64>(4)? != 0,
                }))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "teacherId": teacher_id,
            "term": term.as_str(),
            "year": year,
            "answers": answers,
            "selfComment": self_comment,
            "hodReview": hod,
            "asstReview": asst,
            "finalReview": final_review,
        }),
    )
}

fn handle_get_hod_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let hod_id = match required_str(req, "hodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);
    if let Err(e) = fetch_user(conn, req, &hod_id) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT r.reviewer_id, u.role, r.comments, r.scores, r.total_score, r.status, r.submitted
         FROM hod_performance_reviews r
         JOIN users u ON u.id = r.reviewer_id
         WHERE r.hod_id = ? AND r.term = ? AND r.year = ?
         ORDER BY u.role",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&hod_id, term.as_str(), year), |r| {
            let scores: Option<String> = r.get(3)?;
            let stored_total: Option<i64> = r.get(4)?;
            let rubric = rubric_from_stored(scores.as_deref());
            // Older rows may predate the stored total; compute on read, never
            // write back.
            let total = stored_total.or_else(|| rubric.as_ref().and_then(score::normalize));
            Ok(json!({
                "reviewerId": r.get::<_, String>(0)?,
                "reviewerRole": r.get::<_, String>(1)?,
                "comments": r.get::<_, Option<String>>(2)?,
                "totalScore": total,
                "categories": rubric.as_ref().map(score::categorize),
                "status": r.get::<_, String>(5)?,
                "submitted": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(reviews) => ok(
            &req.id,
            json!({
                "hodId": hod_id,
                "term": term.as_str(),
                "year": year,
                "reviews": reviews,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reviews.submitTeacherAnswers" => Some(handle_submit_teacher_answers(state, req)),
        "reviews.submitHod" => Some(handle_submit_hod(state, req)),
        "reviews.submitAsst" => Some(handle_submit_asst(state, req)),
        "reviews.submitFinal" => Some(handle_submit_final(state, req)),
        "reviews.submitHodPerformance" => Some(handle_submit_hod_performance(state, req)),
        "reviews.getChain" => Some(handle_get_chain(state, req)),
        "reviews.getHodPerformance" => Some(handle_get_hod_performance(state, req)),
        _ => None,
    }
}
