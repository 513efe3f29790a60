//! Per-connection websocket gateway.
//!
//! A connection moves through connecting -> authorizing -> open -> closed.
//! The handshake is accepted before authorization because a custom close
//! code can only be delivered on an established websocket; a rejected
//! principal gets the unauthorized close and nothing else, not even the
//! snapshot.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tower_sessions::Session;
use tracing::{debug, error, warn};

use crate::{
    AppState, courses,
    session::{self, Principal},
};

use super::{
    events::{self, InboundQuestion, Outbound, RoomEvent},
    log,
    registry::{self, RoomStatus},
};

pub async fn qa_ws(
    Path((course_id, room_name)): Path<(i64, String)>,
    State(state): State<AppState>,
    session: Session,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // The cookie is only readable pre-upgrade; resolve the principal here
    // and finish authorization on the established socket.
    let principal = match session::current_principal(&session, &state.db_pool).await {
        Ok(principal) => principal,
        Err(err) => {
            error!(course_id, %err, "principal lookup failed, treating as unauthenticated");
            None
        }
    };

    ws.on_upgrade(move |socket| handle_connection(socket, state, principal, course_id, room_name))
}

/// Outcome of the authorizing phase, decided before any event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Open,
    Reject { code: u16, reason: &'static str },
}

async fn admit(
    state: &AppState,
    principal: &Principal,
    course_id: i64,
    room_name: &str,
) -> Admission {
    const UNAUTHORIZED: Admission = Admission::Reject {
        code: events::CLOSE_UNAUTHORIZED,
        reason: "unauthorized",
    };

    match authorize(&state.db_pool, principal, course_id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(course_id, user = principal.id, "rejecting unauthorized Q&A connection");
            return UNAUTHORIZED;
        }
        Err(err) => {
            // Fail closed.
            error!(course_id, %err, "authorization check failed");
            return UNAUTHORIZED;
        }
    }

    match registry::status_of(&state.db_pool, room_name).await {
        Ok(RoomStatus::Active) => Admission::Open,
        // Ended, or a room name the registry never issued (a stale page for
        // a purged incarnation). Either way the room is over.
        Ok(_) => Admission::Reject {
            code: events::CLOSE_SESSION_TERMINATED,
            reason: "session ended",
        },
        Err(err) => {
            error!(room = %room_name, %err, "session status lookup failed");
            Admission::Reject {
                code: 1011,
                reason: "internal error",
            }
        }
    }
}

async fn handle_connection(
    mut socket: WebSocket,
    state: AppState,
    principal: Option<Principal>,
    course_id: i64,
    room_name: String,
) {
    let Some(principal) = principal else {
        close_with(&mut socket, events::CLOSE_UNAUTHORIZED, "unauthorized").await;
        return;
    };

    match admit(&state, &principal, course_id, &room_name).await {
        Admission::Open => {}
        Admission::Reject { code, reason } => {
            close_with(&mut socket, code, reason).await;
            return;
        }
    }

    // Join before reading the snapshot so nothing published in between is
    // lost; anything early simply waits in the receiver.
    let rx = state.bus.subscribe(&room_name).await;

    let snapshot = match log::fetch_ordered(&state.db_pool, &room_name).await {
        Ok(questions) => Outbound::QuestionList {
            questions: questions.into_iter().map(Into::into).collect(),
        },
        Err(err) => {
            error!(room = %room_name, %err, "failed to load history snapshot");
            close_with(&mut socket, 1011, "internal error").await;
            state.bus.prune(&room_name).await;
            return;
        }
    };
    let Ok(snapshot) = serde_json::to_string(&snapshot) else {
        state.bus.prune(&room_name).await;
        return;
    };
    if socket.send(Message::Text(snapshot.into())).await.is_err() {
        state.bus.prune(&room_name).await;
        return;
    }

    debug!(room = %room_name, user = principal.id, "Q&A connection open");

    let (sender, receiver) = socket.split();
    let mut forward_task = tokio::spawn(forward_events(sender, rx, room_name.clone()));
    let mut recv_task = tokio::spawn(read_inbound(receiver, state.clone(), room_name.clone()));

    tokio::select! {
        _ = &mut forward_task => recv_task.abort(),
        _ = &mut recv_task => forward_task.abort(),
    }

    state.bus.prune(&room_name).await;
    debug!(room = %room_name, user = principal.id, "Q&A connection closed");
}

async fn authorize(
    db_pool: &SqlitePool,
    principal: &Principal,
    course_id: i64,
) -> Result<bool, sqlx::Error> {
    let Some(course) = courses::fetch(db_pool, course_id).await? else {
        return Ok(false);
    };
    if courses::can_manage(principal, &course) {
        return Ok(true);
    }
    courses::is_active_in_course(db_pool, principal.id, course_id).await
}

/// Pump bus events out to the socket. A termination event carries the close
/// notice and then shuts the connection with the terminated code.
async fn forward_events(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: broadcast::Receiver<RoomEvent>,
    room_name: String,
) {
    loop {
        match rx.recv().await {
            Ok(RoomEvent::Question(question)) => {
                let Ok(text) = serde_json::to_string(&Outbound::Question(question)) else {
                    continue;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Ok(RoomEvent::Terminated(notice)) => {
                if let Ok(text) = serde_json::to_string(&Outbound::Close(notice)) {
                    let _ = sender.send(Message::Text(text.into())).await;
                }
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: events::CLOSE_SESSION_TERMINATED,
                        reason: "session ended".into(),
                    })))
                    .await;
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(room = %room_name, skipped, "connection lagging behind room broadcast");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn read_inbound(mut receiver: SplitStream<WebSocket>, state: AppState, room_name: String) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => handle_inbound(&state, &room_name, text.as_str()).await,
            Message::Close(_) => break,
            // Binary, ping, pong: nothing to do.
            _ => {}
        }
    }
}

/// Validate, persist, and publish one inbound payload. Nothing here kills
/// the connection: bad input is logged and dropped.
pub(crate) async fn handle_inbound(state: &AppState, room_name: &str, text: &str) {
    let inbound: InboundQuestion = match serde_json::from_str(text) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(room = %room_name, %err, "ignoring malformed Q&A payload");
            return;
        }
    };

    if inbound.message.is_empty() {
        debug!(room = %room_name, "dropping empty question");
        return;
    }

    // The owner may have ended the session while this message was in
    // flight; a late arrival is dropped without notice, since the client
    // has already received (or will receive) the close notice.
    match registry::status_of(&state.db_pool, room_name).await {
        Ok(RoomStatus::Active) => {}
        Ok(_) => {
            debug!(room = %room_name, "dropping question for inactive room");
            return;
        }
        Err(err) => {
            error!(room = %room_name, %err, "session status lookup failed");
            return;
        }
    }

    let timestamp = OffsetDateTime::now_utc();
    let question = match log::append(
        &state.db_pool,
        room_name,
        &inbound.sender,
        &inbound.message,
        timestamp,
    )
    .await
    {
        Ok(question) => question,
        Err(err) => {
            // The sender simply never sees their message broadcast; the
            // connection and the rest of the room are unaffected.
            error!(room = %room_name, %err, "failed to persist question");
            return;
        }
    };

    state.bus.publish(room_name, RoomEvent::Question(question.into())).await;
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
