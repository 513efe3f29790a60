pub mod bus;
pub mod events;
pub mod log;
pub mod registry;
mod ws;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tower_sessions::Session;

use crate::{
    AppError, AppResult, AppState, courses, notify,
    session::{self, Principal},
    tasks,
};

use self::bus::RoomBus;
use self::events::{RoomEvent, WireQuestion};
use self::registry::{QaSession, SessionError, SessionStatus};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{course_id}", get(session_state))
        .route("/{course_id}/start", post(start))
        .route("/{course_id}/end", post(end))
        .route("/{course_id}/{room_name}/ws", get(ws::qa_ws))
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub created: bool,
    pub already_active: bool,
    pub room_name: String,
}

async fn start(
    Path(course_id): Path<i64>,
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Json<StartResponse>> {
    let (_, principal) = require_manager(&state.db_pool, &session, course_id).await?;

    let outcome = registry::start_or_reactivate(&state.db_pool, course_id)
        .await
        .map_err(session_error)?;

    // Side effects stay off the request path: the owner gets their room
    // back immediately whether or not notification or cleanup succeed.
    if outcome.created || outcome.stale_room.is_some() {
        tasks::spawn(
            "qa-start-notifications",
            notify::notify_students_of_qa_start(state.db_pool.clone(), course_id),
        );
    }
    if let Some(stale_room) = outcome.stale_room.clone() {
        tasks::spawn(
            "qa-stale-room-purge",
            notify::purge_stale_room(state.db_pool.clone(), stale_room),
        );
    }

    tracing::info!(
        course_id,
        user = principal.id,
        room = %outcome.room_name,
        created = outcome.created,
        "Q&A session start requested"
    );

    Ok(Json(StartResponse {
        created: outcome.created,
        already_active: outcome.already_active,
        room_name: outcome.room_name,
    }))
}

async fn end(
    Path(course_id): Path<i64>,
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Json<QaSession>> {
    require_manager(&state.db_pool, &session, course_id).await?;
    let qa_session = end_and_announce(&state.db_pool, &state.bus, course_id).await?;
    Ok(Json(qa_session))
}

/// Flip the session to ended and append the closing comment in one
/// transaction, then tell the room. Connections react to the termination
/// event by delivering the close notice and disconnecting.
async fn end_and_announce(
    db_pool: &SqlitePool,
    bus: &RoomBus,
    course_id: i64,
) -> AppResult<QaSession> {
    let mut tx = db_pool.begin().await?;
    let qa_session = registry::end(&mut tx, course_id).await.map_err(session_error)?;
    let closing = log::append(
        &mut *tx,
        &qa_session.room_name,
        events::SYSTEM_SENDER,
        events::END_SESSION_MESSAGE,
        OffsetDateTime::now_utc(),
    )
    .await?;
    tx.commit().await?;

    bus.publish(&qa_session.room_name, RoomEvent::Terminated(closing.into()))
        .await;
    Ok(qa_session)
}

#[derive(Debug, Serialize)]
pub struct SessionStateResponse {
    #[serde(flatten)]
    pub session: QaSession,
    /// Archived history, present once the session has ended. A live room's
    /// history arrives over the websocket snapshot instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<WireQuestion>>,
}

async fn session_state(
    Path(course_id): Path<i64>,
    State(state): State<AppState>,
    session: Session,
) -> AppResult<Json<SessionStateResponse>> {
    let course = require_course(&state.db_pool, course_id).await?;
    let principal = require_principal(&session, &state.db_pool).await?;

    let authorized = courses::can_manage(&principal, &course)
        || courses::is_active_in_course(&state.db_pool, principal.id, course_id).await?;
    if !authorized {
        return Err(AppError::forbidden("not a participant of this course"));
    }

    let qa_session = registry::fetch(&state.db_pool, course_id)
        .await
        .map_err(session_error)?
        .ok_or_else(|| AppError::not_found(format!("no Q&A session exists for course {course_id}")))?;

    let questions = if qa_session.status == SessionStatus::Ended {
        let history = log::fetch_ordered(&state.db_pool, &qa_session.room_name).await?;
        Some(history.into_iter().map(Into::into).collect())
    } else {
        None
    };

    Ok(Json(SessionStateResponse {
        session: qa_session,
        questions,
    }))
}

async fn require_course(db_pool: &SqlitePool, course_id: i64) -> AppResult<courses::Course> {
    courses::fetch(db_pool, course_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no course with id {course_id}")))
}

async fn require_principal(session: &Session, db_pool: &SqlitePool) -> AppResult<Principal> {
    session::current_principal(session, db_pool)
        .await?
        .ok_or_else(|| AppError::unauthorized("sign in to use live Q&A"))
}

async fn require_manager(
    db_pool: &SqlitePool,
    session: &Session,
    course_id: i64,
) -> AppResult<(courses::Course, Principal)> {
    let course = require_course(db_pool, course_id).await?;
    let principal = require_principal(session, db_pool).await?;
    if !courses::can_manage(&principal, &course) {
        return Err(AppError::forbidden(
            "only the course teacher or an admin can manage Q&A sessions",
        ));
    }
    Ok((course, principal))
}

fn session_error(err: SessionError) -> AppError {
    match err {
        err @ SessionError::NotFound(_) => AppError::not_found(err.to_string()),
        err @ SessionError::AlreadyEnded(_) => AppError::conflict(err.to_string()),
        SessionError::Db(err) => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courses::seed;
    use crate::db;
    use axum::http::StatusCode;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn live_session(course_id: i64) -> (AppState, String) {
        let pool = db::test_pool().await;
        seed::running_course(&pool, course_id, 10, &[20]).await;
        let outcome = registry::start_or_reactivate(&pool, course_id).await.unwrap();
        let state = AppState {
            db_pool: pool,
            bus: RoomBus::new(),
        };
        (state, outcome.room_name)
    }

    #[tokio::test]
    async fn ending_broadcasts_termination_and_archives_the_close_comment() {
        let (state, room) = live_session(1).await;
        let mut rx = state.bus.subscribe(&room).await;

        let ended = end_and_announce(&state.db_pool, &state.bus, 1).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.room_name, room);

        match rx.recv().await.unwrap() {
            RoomEvent::Terminated(notice) => {
                assert_eq!(notice.message, events::END_SESSION_MESSAGE);
                assert_eq!(notice.sender, events::SYSTEM_SENDER);
            }
            other => panic!("expected termination event, got {other:?}"),
        }

        let history = log::fetch_ordered(&state.db_pool, &room).await.unwrap();
        assert_eq!(history.last().unwrap().message, events::END_SESSION_MESSAGE);
    }

    #[tokio::test]
    async fn no_messages_are_deliverable_after_termination() {
        let (state, room) = live_session(1).await;

        end_and_announce(&state.db_pool, &state.bus, 1).await.unwrap();

        let mut rx = state.bus.subscribe(&room).await;
        ws::handle_inbound(&state, &room, r#"{"message": "after end", "sender": "A"}"#).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn ending_twice_surfaces_a_conflict() {
        let (state, _room) = live_session(1).await;

        end_and_announce(&state.db_pool, &state.bus, 1).await.unwrap();
        let err = end_and_announce(&state.db_pool, &state.bus, 1)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn ending_an_unknown_course_is_not_found() {
        let pool = db::test_pool().await;
        let bus = RoomBus::new();
        let err = end_and_announce(&pool, &bus, 42).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
