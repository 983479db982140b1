use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("faculty.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            department_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_department ON users(department_id)",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            year INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'INACTIVE',
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_departments(
            term_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            PRIMARY KEY(term_id, department_id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_departments_department ON term_departments(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_states(
            department_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            active_term TEXT,
            start_visibility TEXT NOT NULL DEFAULT 'DRAFT',
            end_visibility TEXT NOT NULL DEFAULT 'DRAFT',
            hod_visibility TEXT NOT NULL DEFAULT 'DRAFT',
            overall_visibility TEXT NOT NULL DEFAULT 'DRAFT',
            updated_at TEXT,
            PRIMARY KEY(department_id, year),
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            term TEXT NOT NULL,
            text TEXT NOT NULL,
            qtype TEXT NOT NULL,
            options TEXT,
            option_scores TEXT,
            required INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_department_term ON questions(department_id, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_answers(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            answer TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(teacher_id, question_id, term, year),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(question_id) REFERENCES questions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_answers_teacher ON teacher_answers(teacher_id, term, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS self_comments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            comment TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(teacher_id, term, year),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS hod_reviews(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            hod_id TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            comment TEXT,
            score INTEGER,
            scores TEXT,
            submitted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(teacher_id, term, year),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(hod_id) REFERENCES users(id)
        )",
        [],
    )?;
    // Workspaces created before rubric scoring shipped only carry the flat
    // 1-10 score column. Add the JSON scores column if needed.
    ensure_hod_reviews_scores(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hod_reviews_teacher ON hod_reviews(teacher_id, term, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS asst_reviews(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            asst_dean_id TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            comment TEXT,
            score INTEGER,
            submitted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(teacher_id, term, year),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(asst_dean_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_reviews(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            reviewer_id TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            term_id TEXT,
            final_comment TEXT,
            final_score INTEGER,
            status TEXT NOT NULL,
            submitted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(teacher_id, term, year),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(reviewer_id) REFERENCES users(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;
    ensure_final_reviews_term_id(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_reviews_teacher ON final_reviews(teacher_id, term, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS hod_performance_reviews(
            id TEXT PRIMARY KEY,
            hod_id TEXT NOT NULL,
            reviewer_id TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            comments TEXT,
            scores TEXT,
            total_score INTEGER,
            status TEXT NOT NULL,
            submitted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            UNIQUE(hod_id, term, year, reviewer_id),
            FOREIGN KEY(hod_id) REFERENCES users(id),
            FOREIGN KEY(reviewer_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hod_performance_hod ON hod_performance_reviews(hod_id, term, year)",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn ensure_hod_reviews_scores(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "hod_reviews", "scores")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE hod_reviews ADD COLUMN scores TEXT", [])?;
    Ok(())
}

fn ensure_final_reviews_term_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "final_reviews", "term_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE final_reviews ADD COLUMN term_id TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
