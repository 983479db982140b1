use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    Start,
    End,
}

impl Term {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "START" => Some(Self::Start),
            "END" => Some(Self::End),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::End => "END",
        }
    }

    fn visibility_column(self) -> &'static str {
        match self {
            Self::Start => "start_visibility",
            Self::End => "end_visibility",
        }
    }
}

/// Forward-only per-stage lifecycle: DRAFT -> PUBLISHED -> COMPLETE.
/// COMPLETE is terminal; there is no path back and no DRAFT -> COMPLETE jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    Draft,
    Published,
    Complete,
}

impl Visibility {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "PUBLISHED" => Some(Self::Published),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Published => "PUBLISHED",
            Self::Complete => "COMPLETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TeacherReview,
    HodEvaluation,
}

impl Stage {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "teacherReview" => Some(Self::TeacherReview),
            "hodEvaluation" => Some(Self::HodEvaluation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermState {
    pub active_term: Option<String>,
    pub start_term_visibility: String,
    pub end_term_visibility: String,
    pub hod_visibility: String,
    pub overall_visibility: String,
}

impl TermState {
    fn draft() -> Self {
        Self {
            active_term: None,
            start_term_visibility: Visibility::Draft.as_str().to_string(),
            end_term_visibility: Visibility::Draft.as_str().to_string(),
            hod_visibility: Visibility::Draft.as_str().to_string(),
            overall_visibility: Visibility::Draft.as_str().to_string(),
        }
    }

    pub fn term_visibility(&self, term: Term) -> Visibility {
        let raw = match term {
            Term::Start => self.start_term_visibility.as_str(),
            Term::End => self.end_term_visibility.as_str(),
        };
        Visibility::parse(raw).unwrap_or(Visibility::Draft)
    }
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl StateError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(code: &'static str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

fn department_exists(conn: &Connection, department_id: &str) -> Result<bool, StateError> {
    conn.query_row(
        "SELECT 1 FROM departments WHERE id = ?",
        [department_id],
        |_| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(StateError::db)
}

/// Missing rows read as all-DRAFT with no active term. Reads never insert.
pub fn get_state(conn: &Connection, department_id: &str, year: i64) -> Result<TermState, StateError> {
    if !department_exists(conn, department_id)? {
        return Err(StateError::with_details(
            "not_found",
            "department not found",
            json!({ "departmentId": department_id }),
        ));
    }

    let row = conn
        .query_row(
            "SELECT active_term, start_visibility, end_visibility, hod_visibility, overall_visibility
             FROM term_states WHERE department_id = ? AND year = ?",
            (department_id, year),
            |r| {
                Ok(TermState {
                    active_term: r.get(0)?,
                    start_term_visibility: r.get(1)?,
                    end_term_visibility: r.get(2)?,
                    hod_visibility: r.get(3)?,
                    overall_visibility: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(StateError::db)?;

    Ok(row.unwrap_or_else(TermState::draft))
}

fn ensure_row(conn: &Connection, department_id: &str, year: i64) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO term_states(department_id, year, updated_at)
         VALUES(?, ?, ?)
         ON CONFLICT(department_id, year) DO NOTHING",
        (department_id, year, db::now_rfc3339()),
    )
    .map_err(|e| StateError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

/// Admin marker for which half-year is live. Does not touch visibility.
pub fn set_active_term(
    conn: &Connection,
    department_id: &str,
    year: i64,
    term: Option<Term>,
) -> Result<(), StateError> {
    if !department_exists(conn, department_id)? {
        return Err(StateError::with_details(
            "not_found",
            "department not found",
            json!({ "departmentId": department_id }),
        ));
    }
    ensure_row(conn, department_id, year)?;
    conn.execute(
        "UPDATE term_states SET active_term = ?, updated_at = ? WHERE department_id = ? AND year = ?",
        (term.map(Term::as_str), db::now_rfc3339(), department_id, year),
    )
    .map_err(|e| StateError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

/// DRAFT -> PUBLISHED for one stage gate. Re-publishing an already-PUBLISHED
/// stage is an allowed overwrite; a COMPLETE stage can never be re-opened.
pub fn publish_stage(
    conn: &Connection,
    department_id: &str,
    year: i64,
    term: Term,
    stage: Stage,
) -> Result<(), StateError> {
    let state = get_state(conn, department_id, year)?;

    let (column, current) = match stage {
        Stage::TeacherReview => (term.visibility_column(), state.term_visibility(term)),
        Stage::HodEvaluation => (
            "hod_visibility",
            Visibility::parse(&state.hod_visibility).unwrap_or(Visibility::Draft),
        ),
    };

    if current == Visibility::Complete {
        return Err(StateError::with_details(
            "term_not_transitionable",
            "cannot publish after completion",
            json!({
                "departmentId": department_id,
                "term": term.as_str(),
                "visibility": current.as_str(),
            }),
        ));
    }

    ensure_row(conn, department_id, year)?;
    let sql = format!(
        "UPDATE term_states SET {} = 'PUBLISHED', updated_at = ? WHERE department_id = ? AND year = ?",
        column
    );
    conn.execute(&sql, (db::now_rfc3339(), department_id, year))
        .map_err(|e| StateError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

/// System-only transition, driven by final-review completion detection.
/// START completion makes results visible (overall PUBLISHED); END completion
/// archives the year (overall COMPLETE). Idempotent: re-marking is a no-op.
pub fn mark_complete(
    conn: &Connection,
    department_id: &str,
    year: i64,
    term: Term,
) -> Result<(), StateError> {
    ensure_row(conn, department_id, year)?;
    let overall = match term {
        Term::Start => Visibility::Published,
        Term::End => Visibility::Complete,
    };
    let sql = format!(
        "UPDATE term_states SET {} = 'COMPLETE', overall_visibility = ?, updated_at = ?
         WHERE department_id = ? AND year = ?",
        term.visibility_column()
    );
    conn.execute(
        &sql,
        (overall.as_str(), db::now_rfc3339(), department_id, year),
    )
    .map_err(|e| StateError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}
