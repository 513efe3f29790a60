//! Append-only question log, partitioned by room name.

use sqlx::SqlitePool;
use time::OffsetDateTime;

use super::events::WireQuestion;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub room_name: String,
    pub sender: String,
    pub message: String,
    pub timestamp: OffsetDateTime,
}

impl From<Question> for WireQuestion {
    fn from(q: Question) -> Self {
        Self {
            message: q.message,
            sender: q.sender,
            timestamp: q.timestamp,
        }
    }
}

/// Takes any sqlite executor so the end-of-session close comment can join
/// the registry update in one transaction.
pub async fn append<'e, E>(
    executor: E,
    room_name: &str,
    sender: &str,
    message: &str,
    timestamp: OffsetDateTime,
) -> Result<Question, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result =
        sqlx::query("INSERT INTO qa_questions (room_name,sender,message,timestamp) VALUES (?,?,?,?)")
            .bind(room_name)
            .bind(sender)
            .bind(message)
            .bind(timestamp)
            .execute(executor)
            .await?;

    Ok(Question {
        id: result.last_insert_rowid(),
        room_name: room_name.to_owned(),
        sender: sender.to_owned(),
        message: message.to_owned(),
        timestamp,
    })
}

/// Full history of a room, oldest first.
pub async fn fetch_ordered(
    db_pool: &SqlitePool,
    room_name: &str,
) -> Result<Vec<Question>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id,room_name,sender,message,timestamp FROM qa_questions \
         WHERE room_name=? ORDER BY timestamp,id",
    )
    .bind(room_name)
    .fetch_all(db_pool)
    .await
}

/// Delete a room's entire history. Only ever called for stale rooms after a
/// reactivation, so it never races writes to the live room.
pub async fn purge(db_pool: &SqlitePool, room_name: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM qa_questions WHERE room_name=?")
        .bind(room_name)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected())
}
