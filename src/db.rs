use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(16)
        .connect(url)
        .await
}

/// Idempotent schema bootstrap. The portal tables (users, courses,
/// offerings, enrollments) are owned by the surrounding application and only
/// read here; the qa_* and notifications tables belong to this service.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        display_name TEXT NOT NULL,
        is_admin INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS courses (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        teacher_id INTEGER NOT NULL REFERENCES users(id)
    )",
    "CREATE TABLE IF NOT EXISTS course_offerings (
        id INTEGER PRIMARY KEY,
        course_id INTEGER NOT NULL REFERENCES courses(id),
        term_start TEXT NOT NULL,
        term_end TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS enrollments (
        user_id INTEGER NOT NULL REFERENCES users(id),
        offering_id INTEGER NOT NULL REFERENCES course_offerings(id),
        UNIQUE(user_id, offering_id)
    )",
    // course_id is the primary key: one session per course, and the
    // constraint is what makes start-or-reactivate race-free.
    "CREATE TABLE IF NOT EXISTS qa_sessions (
        course_id INTEGER PRIMARY KEY REFERENCES courses(id),
        room_name TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS qa_questions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        room_name TEXT NOT NULL,
        sender TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_qa_questions_room ON qa_questions(room_name)",
    "CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id),
        message TEXT NOT NULL,
        link_path TEXT,
        link_text TEXT,
        is_read INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
];

/// Single-connection in-memory database for tests. One connection only:
/// every pooled connection to `sqlite::memory:` would otherwise get its own
/// empty database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
