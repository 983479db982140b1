use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::score;
use crate::term_state::Term;
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::reviews;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn year_param(req: &Request) -> i64 {
    req.params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().year() as i64)
}

struct ReportErr {
    code: &'static str,
    message: String,
}

impl ReportErr {
    fn db(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn person_scope(
    conn: &Connection,
    role: &str,
    department_id: Option<&str>,
) -> Result<Vec<(String, String, Option<String>)>, ReportErr> {
    let mut sql = String::from(
        "SELECT id, name, department_id FROM users WHERE role = ? AND active = 1",
    );
    let mut binds: Vec<String> = vec![role.to_string()];
    if let Some(dept) = department_id {
        sql.push_str(" AND department_id = ?");
        binds.push(dept.to_string());
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = conn.prepare(&sql).map_err(ReportErr::db)?;
    stmt.query_map(rusqlite::params_from_iter(binds), |r| {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(ReportErr::db)
}

/// One projector row for a teacher and term. Partial chains are normal: a
/// teacher with only a HOD review reports that stage and stays PENDING.
fn teacher_row(
    conn: &Connection,
    teacher_id: &str,
    teacher_name: &str,
    department_id: Option<&str>,
    term: Term,
    year: i64,
) -> Result<serde_json::Value, ReportErr> {
    let answers: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM teacher_answers WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| r.get(0),
        )
        .map_err(ReportErr::db)?;
    let has_comment: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM self_comments WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| r.get(0),
        )
        .map_err(ReportErr::db)?;
    let submitted = answers > 0 && has_comment > 0;

    let hod: Option<(String, Option<i64>, i64)> = conn
        .query_row(
            "SELECT hod_id, score, submitted FROM hod_reviews
             WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(ReportErr::db)?;
    let asst: Option<(String, Option<i64>, i64)> = conn
        .query_row(
            "SELECT asst_dean_id, score, submitted FROM asst_reviews
             WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(ReportErr::db)?;
    let final_review: Option<(String, Option<i64>, String, i64)> = conn
        .query_row(
            "SELECT reviewer_id, final_score, status, submitted FROM final_reviews
             WHERE teacher_id = ? AND term = ? AND year = ?",
            (teacher_id, term.as_str(), year),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(ReportErr::db)?;

    let hod_score = hod.as_ref().and_then(|(_, s, sub)| if *sub != 0 { *s } else { None });
    let asst_score = asst
        .as_ref()
        .and_then(|(_, s, sub)| if *sub != 0 { *s } else { None });
    let combined = score::combined_score(hod_score, asst_score);
    let percent = combined.and_then(|c| score::performance_percent(c, score::COMBINED_MAX));

    let finalized = final_review.as_ref().map(|(_, _, _, sub)| *sub != 0).unwrap_or(false);
    let status_label = if finalized {
        final_review
            .as_ref()
            .map(|(_, _, status, _)| status.clone())
            .unwrap_or_else(|| "PENDING".to_string())
    } else {
        "PENDING".to_string()
    };
    let promoted = finalized && status_label == "PROMOTED";

    Ok(json!({
        "personId": teacher_id,
        "personName": teacher_name,
        "role": "TEACHER",
        "departmentId": department_id,
        "term": term.as_str(),
        "year": year,
        "submitted": submitted,
        "hodReviewerId": hod.as_ref().map(|(id, _, _)| id.clone()),
        "hodScore": hod_score,
        "asstReviewerId": asst.as_ref().map(|(id, _, _)| id.clone()),
        "asstScore": asst_score,
        "finalReviewerId": final_review.as_ref().map(|(id, _, _, _)| id.clone()),
        "finalScore": final_review.as_ref().and_then(|(_, s, _, _)| *s),
        "combinedScore": combined,
        "performancePercent": percent,
        "promoted": promoted,
        "status": status_label,
    }))
}

fn hod_row(
    conn: &Connection,
    hod_id: &str,
    hod_name: &str,
    department_id: Option<&str>,
    term: Term,
    year: i64,
) -> Result<serde_json::Value, ReportErr> {
    let mut stmt = conn
        .prepare(
            "SELECT u.role, r.reviewer_id, r.total_score, r.scores, r.status, r.submitted
             FROM hod_performance_reviews r
             JOIN users u ON u.id = r.reviewer_id
             WHERE r.hod_id = ? AND r.term = ? AND r.year = ?",
        )
        .map_err(ReportErr::db)?;
    let tracks = stmt
        .query_map((hod_id, term.as_str(), year), |r| {
            let role: String = r.get(0)?;
            let reviewer_id: String = r.get(1)?;
            let stored_total: Option<i64> = r.get(2)?;
            let scores: Option<String> = r.get(3)?;
            let status: String = r.get(4)?;
            let submitted: i64 = r.get(5)?;
            Ok((role, reviewer_id, stored_total, scores, status, submitted))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportErr::db)?;

    let mut asst_track = serde_json::Value::Null;
    let mut dean_track = serde_json::Value::Null;
    let mut dean_status: Option<String> = None;
    for (role, reviewer_id, stored_total, scores, status, submitted) in tracks {
        let total = stored_total.or_else(|| reviews::rubric_total_from_stored(scores.as_deref()));
        let track = json!({
            "reviewerId": reviewer_id,
            "totalScore": total,
            "status": status,
            "submitted": submitted != 0,
        });
        match role.as_str() {
            "ASST_DEAN" => asst_track = track,
            "DEAN" => {
                if submitted != 0 {
                    dean_status = Some(status.clone());
                }
                dean_track = track;
            }
            _ => {}
        }
    }

    let status_label = dean_status.unwrap_or_else(|| "PENDING".to_string());
    let promoted = status_label == "PROMOTED";

    Ok(json!({
        "personId": hod_id,
        "personName": hod_name,
        "role": "HOD",
        "departmentId": department_id,
        "term": term.as_str(),
        "year": year,
        "asstDeanReview": asst_track,
        "deanReview": dean_track,
        "promoted": promoted,
        "status": status_label,
    }))
}

fn handle_reports_for_role(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_uppercase())
    {
        Some(r) if r == "TEACHER" || r == "HOD" => r,
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "role must be TEACHER or HOD",
                Some(json!({ "role": other })),
            )
        }
        None => return err(&req.id, "bad_params", "missing role", None),
    };
    let department_id = req
        .params
        .get("departmentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let year = year_param(req);
    let terms: Vec<Term> = match req.params.get("term").and_then(|v| v.as_str()) {
        Some(raw) => match Term::parse(raw) {
            Some(t) => vec![t],
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "term must be START or END",
                    Some(json!({ "term": raw })),
                )
            }
        },
        None => vec![Term::Start, Term::End],
    };

    let people = match person_scope(conn, &role, department_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut rows: Vec<serde_json::Value> = Vec::new();
    for (person_id, person_name, person_dept) in &people {
        for term in &terms {
            let row = if role == "TEACHER" {
                teacher_row(conn, person_id, person_name, person_dept.as_deref(), *term, year)
            } else {
                hod_row(conn, person_id, person_name, person_dept.as_deref(), *term, year)
            };
            match row {
                Ok(r) => rows.push(r),
                Err(e) => return e.response(&req.id),
            }
        }
    }

    ok(&req.id, json!({ "rows": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.forRole" => Some(handle_reports_for_role(state, req)),
        _ => None,
    }
}
