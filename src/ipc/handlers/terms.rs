use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::term_state::{self, Stage, StateError, Term};
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::admin;

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

fn parse_term(req: &Request, key: &str) -> Result<Term, serde_json::Value> {
    let raw = required_str(req, key)?;
    Term::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "term must be START or END",
            Some(json!({ "term": raw })),
        )
    })
}

fn state_err(req: &Request, e: StateError) -> serde_json::Value {
    err(&req.id, e.code, e.message, e.details)
}

fn parse_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = req.params.get(key).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(_) => Ok(Some(raw.to_string())),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a YYYY-MM-DD date", key),
            Some(json!({ key: raw })),
        )),
    }
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = admin::require_admin(conn, req, false) {
        return e;
    }

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing year", None);
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        None => "INACTIVE".to_string(),
        Some(s) => {
            let upper = s.to_ascii_uppercase();
            if upper != "INACTIVE" && Term::parse(&upper).is_none() {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be INACTIVE, START or END",
                    Some(json!({ "status": s })),
                );
            }
            upper
        }
    };
    let start_date = match parse_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match parse_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_ids: Vec<String> = req
        .params
        .get("departmentIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    for dept in &department_ids {
        let found: Result<Option<i64>, _> = conn
            .query_row("SELECT 1 FROM departments WHERE id = ?", [dept], |r| {
                r.get(0)
            })
            .optional();
        match found {
            Ok(Some(_)) => {}
            Ok(None) => {
                return err(
                    &req.id,
                    "not_found",
                    "department not found",
                    Some(json!({ "departmentId": dept })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let term_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO terms(id, name, year, status, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&term_id, &name, year, &status, &start_date, &end_date),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "terms" })),
        );
    }
    for dept in &department_ids {
        if let Err(e) = conn.execute(
            "INSERT INTO term_departments(term_id, department_id) VALUES(?, ?)
             ON CONFLICT(term_id, department_id) DO NOTHING",
            (&term_id, dept),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "termId": term_id }))
}

fn handle_terms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = req.params.get("year").and_then(|v| v.as_i64());

    let mut sql = String::from(
        "SELECT id, name, year, status, start_date, end_date FROM terms",
    );
    if year.is_some() {
        sql.push_str(" WHERE year = ?");
    }
    sql.push_str(" ORDER BY year, name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "year": r.get::<_, i64>(2)?,
            "status": r.get::<_, String>(3)?,
            "startDate": r.get::<_, Option<String>>(4)?,
            "endDate": r.get::<_, Option<String>>(5)?,
        }))
    };
    let rows = match year {
        Some(y) => stmt
            .query_map([y], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    let mut terms = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    for term in &mut terms {
        let term_id = term
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut dept_stmt = match conn
            .prepare("SELECT department_id FROM term_departments WHERE term_id = ? ORDER BY department_id")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let depts = dept_stmt
            .query_map([&term_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match depts {
            Ok(d) => {
                term["departmentIds"] = json!(d);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    ok(&req.id, json!({ "terms": terms }))
}

fn handle_terms_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = admin::require_admin(conn, req, false) {
        return e;
    }
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);

    // An explicit null clears the active term marker.
    let term = match req.params.get("term") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_str().and_then(Term::parse) {
            Some(t) => Some(t),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "term must be START, END or null",
                    Some(json!({ "term": v.clone() })),
                )
            }
        },
    };

    match term_state::set_active_term(conn, &department_id, year, term) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => state_err(req, e),
    }
}

fn handle_terms_publish_stage(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = admin::require_admin(conn, req, false) {
        return e;
    }
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stage_raw = match required_str(req, "stage") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(stage) = Stage::parse(&stage_raw) else {
        return err(
            &req.id,
            "bad_params",
            "stage must be teacherReview or hodEvaluation",
            Some(json!({ "stage": stage_raw })),
        );
    };
    let year = year_param(req);

    match term_state::publish_stage(conn, &department_id, year, term, stage) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => state_err(req, e),
    }
}

fn handle_terms_get_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = year_param(req);

    match term_state::get_state(conn, &department_id, year) {
        Ok(s) => {
            let mut body = serde_json::to_value(&s).unwrap_or_else(|_| json!({}));
            body["departmentId"] = json!(department_id);
            body["year"] = json!(year);
            ok(&req.id, body)
        }
        Err(e) => state_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.list" => Some(handle_terms_list(state, req)),
        "terms.setActive" => Some(handle_terms_set_active(state, req)),
        "terms.publishStage" => Some(handle_terms_publish_stage(state, req)),
        "terms.getState" => Some(handle_terms_get_state(state, req)),
        _ => None,
    }
}
