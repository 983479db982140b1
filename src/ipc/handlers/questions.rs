use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::term_state::Term;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const QUESTION_TYPES: [&str; 4] = ["TEXT", "TEXTAREA", "MCQ", "CHECKBOX"];

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

/// The question bank is owned by the HOD of its department. Returns the
/// caller's department id.
fn require_hod(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    let caller_id = required_str(req, "callerId")?;
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT role, department_id FROM users WHERE id = ? AND active = 1",
            [&caller_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match row {
        Some((role, Some(dept))) if role == "HOD" => Ok(dept),
        Some((role, _)) => Err(err(
            &req.id,
            "unauthorized",
            "caller must be a HOD",
            Some(json!({ "callerId": caller_id, "role": role })),
        )),
        None => Err(err(
            &req.id,
            "not_found",
            "caller not found",
            Some(json!({ "callerId": caller_id })),
        )),
    }
}

fn handle_questions_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match require_hod(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let text = match required_str(req, "text") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_raw = match required_str(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(term) = Term::parse(&term_raw) else {
        return err(
            &req.id,
            "bad_params",
            "term must be START or END",
            Some(json!({ "term": term_raw })),
        );
    };
    let qtype = match required_str(req, "type") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(e) => return e,
    };
    if !QUESTION_TYPES.contains(&qtype.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "type must be one of: TEXT, TEXTAREA, MCQ, CHECKBOX",
            Some(json!({ "type": qtype })),
        );
    }

    let options = req.params.get("options").and_then(|v| v.as_array()).cloned();
    let option_scores = req
        .params
        .get("optionScores")
        .and_then(|v| v.as_array())
        .cloned();
    let choice_type = qtype == "MCQ" || qtype == "CHECKBOX";
    if choice_type {
        let Some(opts) = &options else {
            return err(
                &req.id,
                "bad_params",
                format!("{} questions require options", qtype),
                None,
            );
        };
        if opts.is_empty() {
            return err(&req.id, "bad_params", "options must not be empty", None);
        }
        if let Some(scores) = &option_scores {
            if scores.len() != opts.len() {
                return err(
                    &req.id,
                    "bad_params",
                    "optionScores must match options length",
                    Some(json!({ "options": opts.len(), "optionScores": scores.len() })),
                );
            }
        }
    } else if options.is_some() || option_scores.is_some() {
        return err(
            &req.id,
            "bad_params",
            format!("{} questions take no options", qtype),
            None,
        );
    }

    let required = req
        .params
        .get("required")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let is_active = req
        .params
        .get("isActive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let sort_order = req.params.get("order").and_then(|v| v.as_i64()).unwrap_or(0);

    let question_id = req
        .params
        .get("questionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(qid) = &question_id {
        let owner: Option<String> = match conn
            .query_row("SELECT department_id FROM questions WHERE id = ?", [qid], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match owner {
            None => {
                return err(
                    &req.id,
                    "not_found",
                    "question not found",
                    Some(json!({ "questionId": qid })),
                )
            }
            Some(dept) if dept != department_id => {
                return err(
                    &req.id,
                    "unauthorized",
                    "question belongs to another department",
                    Some(json!({ "questionId": qid })),
                )
            }
            Some(_) => {}
        }

        let result = conn.execute(
            "UPDATE questions SET
               text = ?, term = ?, qtype = ?, options = ?, option_scores = ?,
               required = ?, is_active = ?, sort_order = ?
             WHERE id = ?",
            (
                &text,
                term.as_str(),
                &qtype,
                options.as_ref().map(|o| json!(o).to_string()),
                option_scores.as_ref().map(|s| json!(s).to_string()),
                required as i64,
                is_active as i64,
                sort_order,
                qid,
            ),
        );
        return match result {
            Ok(_) => ok(&req.id, json!({ "questionId": qid })),
            Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
        };
    }

    let new_id = Uuid::new_v4().to_string();
    let result = conn.execute(
        "INSERT INTO questions(id, department_id, term, text, qtype, options, option_scores, required, is_active, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &new_id,
            &department_id,
            term.as_str(),
            &text,
            &qtype,
            options.as_ref().map(|o| json!(o).to_string()),
            option_scores.as_ref().map(|s| json!(s).to_string()),
            required as i64,
            is_active as i64,
            sort_order,
        ),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "questionId": new_id })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "questions" })),
        ),
    }
}

fn handle_questions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_str())
        .and_then(Term::parse);
    let active_only = req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let mut sql = String::from(
        "SELECT id, term, text, qtype, options, option_scores, required, is_active, sort_order
         FROM questions WHERE department_id = ?",
    );
    let mut binds: Vec<String> = vec![department_id];
    if let Some(t) = term {
        sql.push_str(" AND term = ?");
        binds.push(t.as_str().to_string());
    }
    if active_only {
        sql.push_str(" AND is_active = 1");
    }
    sql.push_str(" ORDER BY sort_order, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let options: Option<String> = r.get(4)?;
            let option_scores: Option<String> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "term": r.get::<_, String>(1)?,
                "text": r.get::<_, String>(2)?,
                "type": r.get::<_, String>(3)?,
                "options": options
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                "optionScores": option_scores
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                "required": r.get::<_, i64>(6)? != 0,
                "isActive": r.get::<_, i64>(7)? != 0,
                "order": r.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match require_hod(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Deactivate instead of delete: submitted answers keep their question.
    let result = conn.execute(
        "UPDATE questions SET is_active = 0 WHERE id = ? AND department_id = ?",
        (&question_id, &department_id),
    );
    match result {
        Ok(0) => err(
            &req.id,
            "not_found",
            "question not found in caller's department",
            Some(json!({ "questionId": question_id })),
        ),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "questions.upsert" => Some(handle_questions_upsert(state, req)),
        "questions.list" => Some(handle_questions_list(state, req)),
        "questions.delete" => Some(handle_questions_delete(state, req)),
        _ => None,
    }
}
