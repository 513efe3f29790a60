//! Out-of-band participant notification and stale-room cleanup.
//!
//! Everything here runs on background tasks after `start_or_reactivate`
//! returns; the session is live regardless of whether any of it succeeds,
//! so failures are logged with context and never surfaced to a live
//! participant.

use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::{courses, qa::log};

pub const QA_START_MESSAGE: &str = "A live Q&A session has started for one of your courses.";
pub const QA_START_LINK_TEXT: &str = "Join the session";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub user_id: i64,
    pub message: String,
    pub link_path: Option<String>,
    pub link_text: Option<String>,
    pub is_read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Notify every currently-enrolled student that the course's session is
/// live, linking to the session page.
pub async fn notify_students_of_qa_start(db_pool: SqlitePool, course_id: i64) {
    match create_qa_start_notifications(&db_pool, course_id).await {
        Ok(count) => info!(course_id, count, "notified enrolled students of Q&A start"),
        Err(err) => error!(course_id, %err, "failed to notify enrolled students of Q&A start"),
    }
}

async fn create_qa_start_notifications(
    db_pool: &SqlitePool,
    course_id: i64,
) -> Result<usize, sqlx::Error> {
    let students = courses::enrolled_students(db_pool, course_id).await?;
    let link_path = format!("/live-qa/{course_id}");
    let now = OffsetDateTime::now_utc();

    for user_id in &students {
        sqlx::query(
            "INSERT INTO notifications (id,user_id,message,link_path,link_text,created_at) \
             VALUES (?,?,?,?,?,?)",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(user_id)
        .bind(QA_START_MESSAGE)
        .bind(&link_path)
        .bind(QA_START_LINK_TEXT)
        .bind(now)
        .execute(db_pool)
        .await?;
    }

    Ok(students.len())
}

/// Drop the replaced room's history after a reactivation. The new room has a
/// different name, so this never races live traffic.
pub async fn purge_stale_room(db_pool: SqlitePool, room_name: String) {
    match log::purge(&db_pool, &room_name).await {
        Ok(deleted) => info!(room = %room_name, deleted, "purged stale Q&A room"),
        Err(err) => error!(room = %room_name, %err, "failed to purge stale Q&A room"),
    }
}

/// A user's notifications, newest first.
pub async fn fetch_for_user(
    db_pool: &SqlitePool,
    user_id: i64,
) -> Result<Vec<Notification>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id,user_id,message,link_path,link_text,is_read,created_at \
         FROM notifications WHERE user_id=? ORDER BY created_at DESC,id",
    )
    .bind(user_id)
    .fetch_all(db_pool)
    .await
}

pub async fn mark_read(db_pool: &SqlitePool, ids: &[String]) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut query =
        sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE notifications SET is_read=1 WHERE id IN (");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    query.push(")");

    Ok(query.build().execute(db_pool).await?.rows_affected())
}
