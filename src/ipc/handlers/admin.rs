use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 5] = ["ADMIN", "DEAN", "ASST_DEAN", "HOD", "TEACHER"];

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

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

fn users_exist(conn: &Connection, req: &Request) -> Result<bool, serde_json::Value> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get::<_, i64>(0))
        .map(|n| n > 0)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

/// Mutating admin calls require an ADMIN caller. The very first user is the
/// exception: an empty workspace has nobody to vouch for the bootstrap admin.
pub(super) fn require_admin(
    conn: &Connection,
    req: &Request,
    allow_bootstrap: bool,
) -> Result<(), serde_json::Value> {
    if allow_bootstrap && !users_exist(conn, req)? {
        return Ok(());
    }
    let caller_id = required_str(req, "callerId")?;
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM users WHERE id = ? AND active = 1",
            [&caller_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match role.as_deref() {
        Some("ADMIN") => Ok(()),
        Some(other) => Err(err(
            &req.id,
            "unauthorized",
            "caller must be an administrator",
            Some(json!({ "callerId": caller_id, "role": other })),
        )),
        None => Err(err(
            &req.id,
            "not_found",
            "caller not found",
            Some(json!({ "callerId": caller_id })),
        )),
    }
}

/// HOD and TEACHER are department-scoped; ADMIN, DEAN and ASST_DEAN are
/// institution-wide and must not carry a department.
fn check_role_department(
    req: &Request,
    role: &str,
    department_id: Option<&str>,
) -> Result<(), serde_json::Value> {
    if !ROLES.contains(&role) {
        return Err(err(
            &req.id,
            "bad_params",
            "role must be one of: ADMIN, DEAN, ASST_DEAN, HOD, TEACHER",
            Some(json!({ "role": role })),
        ));
    }
    let scoped = role == "HOD" || role == "TEACHER";
    if scoped && department_id.is_none() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} requires a departmentId", role),
            None,
        ));
    }
    if !scoped && department_id.is_some() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} is institution-wide and takes no departmentId", role),
            None,
        ));
    }
    Ok(())
}

fn department_exists(
    conn: &Connection,
    req: &Request,
    department_id: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM departments WHERE id = ?",
            [department_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            "department not found",
            Some(json!({ "departmentId": department_id })),
        ));
    }
    Ok(())
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin(conn, req, true) {
        return e;
    }

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match required_str(req, "role") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(e) => return e,
    };
    let department_id = optional_str(req, "departmentId");

    if let Err(e) = check_role_department(req, &role, department_id.as_deref()) {
        return e;
    }
    if let Some(dept) = department_id.as_deref() {
        if let Err(e) = department_exists(conn, req, dept) {
            return e;
        }
    }

    let user_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO users(id, name, email, role, department_id, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&user_id, &name, &email, &role, &department_id, db::now_rfc3339()),
    ) {
        Ok(_) => ok(&req.id, json!({ "userId": user_id })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        ),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let role = optional_str(req, "role").map(|r| r.to_ascii_uppercase());
    let department_id = optional_str(req, "departmentId");
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut sql = String::from(
        "SELECT id, name, email, role, department_id, active FROM users WHERE 1 = 1",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(r) = &role {
        sql.push_str(" AND role = ?");
        binds.push(r.clone());
    }
    if let Some(d) = &department_id {
        sql.push_str(" AND department_id = ?");
        binds.push(d.clone());
    }
    if !include_inactive {
        sql.push_str(" AND active = 1");
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "departmentId": r.get::<_, Option<String>>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin(conn, req, false) {
        return e;
    }
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT role, department_id FROM users WHERE id = ?",
            [&user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((current_role, current_dept)) = existing else {
        return err(
            &req.id,
            "not_found",
            "user not found",
            Some(json!({ "userId": user_id })),
        );
    };

    let role = optional_str(req, "role")
        .map(|r| r.to_ascii_uppercase())
        .unwrap_or(current_role);
    let department_id = if req.params.get("departmentId").is_some() {
        optional_str(req, "departmentId")
    } else {
        current_dept
    };
    if let Err(e) = check_role_department(req, &role, department_id.as_deref()) {
        return e;
    }
    if let Some(dept) = department_id.as_deref() {
        if let Err(e) = department_exists(conn, req, dept) {
            return e;
        }
    }

    let name = optional_str(req, "name");
    let email = optional_str(req, "email");
    let result = conn.execute(
        "UPDATE users SET
           name = COALESCE(?, name),
           email = COALESCE(?, email),
           role = ?,
           department_id = ?
         WHERE id = ?",
        (&name, &email, &role, &department_id, &user_id),
    );
    match result {
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin(conn, req, false) {
        return e;
    }
    let user_id = match required_str(req, "userId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Deactivate rather than delete: review history keeps its foreign keys,
    // and completion detection stops counting the user.
    match conn.execute("UPDATE users SET active = 0 WHERE id = ?", [&user_id]) {
        Ok(0) => err(
            &req.id,
            "not_found",
            "user not found",
            Some(json!({ "userId": user_id })),
        ),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_departments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin(conn, req, false) {
        return e;
    }
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let department_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO departments(id, name) VALUES(?, ?)",
        (&department_id, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "departmentId": department_id })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "departments" })),
        ),
    }
}

fn handle_departments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM departments ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(departments) => ok(&req.id, json!({ "departments": departments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        "departments.create" => Some(handle_departments_create(state, req)),
        "departments.list" => Some(handle_departments_list(state, req)),
        _ => None,
    }
}
