//! Durable session registry: one Q&A session per course.
//!
//! `start_or_reactivate` is the only place room names are minted, and the
//! only operation needing real atomicity: the `qa_sessions` primary key
//! makes exactly one concurrent caller the creator, and the conditional
//! update makes exactly one the reactivator.

use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Status of a room name, as seen by the gateway on connect and on every
/// inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Active,
    Ended,
    Unknown,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QaSession {
    pub course_id: i64,
    pub room_name: String,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no Q&A session exists for course {0}")]
    NotFound(i64),
    #[error("the Q&A session for course {0} has already ended")]
    AlreadyEnded(i64),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug)]
pub struct StartOutcome {
    pub created: bool,
    pub already_active: bool,
    /// The session's current room name after this call.
    pub room_name: String,
    /// Set when an ended session was reactivated: the replaced room name,
    /// whose history should be purged.
    pub stale_room: Option<String>,
}

/// Course id + wall-clock nanos + random suffix; unique even for rapid
/// restarts within one clock tick.
fn generate_room_name(course_id: i64) -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{course_id}-{nanos}-{suffix}")
}

pub async fn fetch(
    db_pool: &SqlitePool,
    course_id: i64,
) -> Result<Option<QaSession>, SessionError> {
    let session = sqlx::query_as(
        "SELECT course_id,room_name,status,created_at FROM qa_sessions WHERE course_id=?",
    )
    .bind(course_id)
    .fetch_optional(db_pool)
    .await?;
    Ok(session)
}

/// Start a session for the course, or reactivate an ended one under a fresh
/// room name. Re-issuing "start" while already live is an idempotent no-op
/// reported through `already_active`.
pub async fn start_or_reactivate(
    db_pool: &SqlitePool,
    course_id: i64,
) -> Result<StartOutcome, SessionError> {
    let room_name = generate_room_name(course_id);

    let inserted = sqlx::query(
        "INSERT INTO qa_sessions (course_id,room_name,status,created_at) VALUES (?,?,?,?) \
         ON CONFLICT(course_id) DO NOTHING",
    )
    .bind(course_id)
    .bind(&room_name)
    .bind(SessionStatus::Active)
    .bind(OffsetDateTime::now_utc())
    .execute(db_pool)
    .await?;

    if inserted.rows_affected() == 1 {
        return Ok(StartOutcome {
            created: true,
            already_active: false,
            room_name,
            stale_room: None,
        });
    }

    // A session row exists; rows are never deleted, so this read cannot miss.
    let existing = fetch(db_pool, course_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    if existing.status == SessionStatus::Active {
        return Ok(StartOutcome {
            created: false,
            already_active: true,
            room_name: existing.room_name,
            stale_room: None,
        });
    }

    // Reactivation. The status guard makes exactly one concurrent caller win;
    // losers report the session as already active and schedule no purge.
    let updated = sqlx::query(
        "UPDATE qa_sessions SET room_name=?, status=? WHERE course_id=? AND status=?",
    )
    .bind(&room_name)
    .bind(SessionStatus::Active)
    .bind(course_id)
    .bind(SessionStatus::Ended)
    .execute(db_pool)
    .await?;

    if updated.rows_affected() == 1 {
        Ok(StartOutcome {
            created: false,
            already_active: false,
            room_name,
            stale_room: Some(existing.room_name),
        })
    } else {
        let current = fetch(db_pool, course_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(StartOutcome {
            created: false,
            already_active: true,
            room_name: current.room_name,
            stale_room: None,
        })
    }
}

/// Mark the course's session ended. The room name is left in place so the
/// ended room's history stays readable. Ending a session that is already
/// ended means the caller is out of sync with session state, and is
/// surfaced rather than swallowed.
///
/// Takes a connection so the caller can bundle the close comment into the
/// same transaction.
pub async fn end(conn: &mut SqliteConnection, course_id: i64) -> Result<QaSession, SessionError> {
    let session: Option<QaSession> = sqlx::query_as(
        "SELECT course_id,room_name,status,created_at FROM qa_sessions WHERE course_id=?",
    )
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(session) = session else {
        return Err(SessionError::NotFound(course_id));
    };
    if session.status == SessionStatus::Ended {
        return Err(SessionError::AlreadyEnded(course_id));
    }

    sqlx::query("UPDATE qa_sessions SET status=? WHERE course_id=?")
        .bind(SessionStatus::Ended)
        .bind(course_id)
        .execute(&mut *conn)
        .await?;

    Ok(QaSession {
        status: SessionStatus::Ended,
        ..session
    })
}

pub async fn status_of(db_pool: &SqlitePool, room_name: &str) -> Result<RoomStatus, SessionError> {
    let row: Option<(SessionStatus,)> =
        sqlx::query_as("SELECT status FROM qa_sessions WHERE room_name=?")
            .bind(room_name)
            .fetch_optional(db_pool)
            .await?;

    Ok(match row {
        Some((SessionStatus::Active,)) => RoomStatus::Active,
        Some((SessionStatus::Ended,)) => RoomStatus::Ended,
        None => RoomStatus::Unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courses::seed;
    use crate::db;

    async fn pool_with_course(course_id: i64) -> SqlitePool {
        let pool = db::test_pool().await;
        seed::running_course(&pool, course_id, 10, &[]).await;
        pool
    }

    async fn end_now(pool: &SqlitePool, course_id: i64) -> Result<QaSession, SessionError> {
        let mut conn = pool.acquire().await.unwrap();
        end(&mut conn, course_id).await
    }

    #[tokio::test]
    async fn first_start_creates_an_active_session() {
        let pool = pool_with_course(1).await;

        let outcome = start_or_reactivate(&pool, 1).await.unwrap();
        assert!(outcome.created);
        assert!(!outcome.already_active);
        assert!(outcome.stale_room.is_none());

        let session = fetch(&pool, 1).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.room_name, outcome.room_name);
    }

    #[tokio::test]
    async fn starting_a_live_session_is_an_idempotent_noop() {
        let pool = pool_with_course(1).await;

        let first = start_or_reactivate(&pool, 1).await.unwrap();
        let second = start_or_reactivate(&pool, 1).await.unwrap();

        assert!(!second.created);
        assert!(second.already_active);
        assert_eq!(second.room_name, first.room_name);
        assert!(second.stale_room.is_none());
    }

    #[tokio::test]
    async fn concurrent_starts_yield_exactly_one_creator() {
        let pool = pool_with_course(1).await;

        let (a, b) = tokio::join!(
            start_or_reactivate(&pool, 1),
            start_or_reactivate(&pool, 1)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!([a.created, b.created].iter().filter(|&&c| c).count(), 1);
        assert_eq!(
            [a.already_active, b.already_active].iter().filter(|&&x| x).count(),
            1
        );
        assert_eq!(a.room_name, b.room_name);
    }

    #[tokio::test]
    async fn reactivation_mints_a_fresh_room_and_orphans_the_old_one() {
        let pool = pool_with_course(1).await;

        let first = start_or_reactivate(&pool, 1).await.unwrap();
        end_now(&pool, 1).await.unwrap();
        let second = start_or_reactivate(&pool, 1).await.unwrap();

        assert!(!second.created);
        assert!(!second.already_active);
        assert_ne!(second.room_name, first.room_name);
        assert_eq!(second.stale_room.as_deref(), Some(first.room_name.as_str()));

        let session = fetch(&pool, 1).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.room_name, second.room_name);
    }

    #[tokio::test]
    async fn room_names_never_repeat_across_restarts() {
        let pool = pool_with_course(1).await;
        let mut seen = std::collections::HashSet::new();

        for _ in 0..5 {
            let outcome = start_or_reactivate(&pool, 1).await.unwrap();
            assert!(seen.insert(outcome.room_name));
            end_now(&pool, 1).await.unwrap();
        }
    }

    #[tokio::test]
    async fn ending_twice_is_a_caller_error() {
        let pool = pool_with_course(1).await;
        start_or_reactivate(&pool, 1).await.unwrap();

        let ended = end_now(&pool, 1).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);

        assert!(matches!(
            end_now(&pool, 1).await,
            Err(SessionError::AlreadyEnded(1))
        ));
    }

    #[tokio::test]
    async fn ending_without_a_session_is_not_found() {
        let pool = pool_with_course(1).await;
        assert!(matches!(
            end_now(&pool, 1).await,
            Err(SessionError::NotFound(1))
        ));
    }

    #[tokio::test]
    async fn status_of_tracks_the_room_lifecycle() {
        let pool = pool_with_course(1).await;

        let outcome = start_or_reactivate(&pool, 1).await.unwrap();
        assert_eq!(
            status_of(&pool, &outcome.room_name).await.unwrap(),
            RoomStatus::Active
        );

        end_now(&pool, 1).await.unwrap();
        assert_eq!(
            status_of(&pool, &outcome.room_name).await.unwrap(),
            RoomStatus::Ended
        );

        assert_eq!(
            status_of(&pool, "never-issued").await.unwrap(),
            RoomStatus::Unknown
        );
    }
}
