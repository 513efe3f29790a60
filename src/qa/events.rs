//! Wire protocol for the live Q&A websocket.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Close code delivered when the session has ended, whether the client
/// joined an already-ended room or the owner ended a live one.
pub const CLOSE_SESSION_TERMINATED: u16 = 4000;
/// Close code for unauthenticated or unenrolled principals.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

pub const SYSTEM_SENDER: &str = "System";
pub const END_SESSION_MESSAGE: &str = "The live Q&A session has ended.";

/// Participant -> server payload. `sender` is a display label chosen by the
/// client (students may post as "Anonymous"), not an identity reference.
#[derive(Debug, Deserialize)]
pub struct InboundQuestion {
    #[serde(default)]
    pub message: String,
    pub sender: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireQuestion {
    pub message: String,
    pub sender: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Server -> participant events, discriminated by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    /// History snapshot, sent once right after a successful join.
    #[serde(rename = "question.list")]
    QuestionList { questions: Vec<WireQuestion> },
    /// A live message fanned out to the room.
    #[serde(rename = "question.message")]
    Question(WireQuestion),
    /// Termination notice; the connection closes right after it.
    #[serde(rename = "close.connection")]
    Close(WireQuestion),
}

/// Event fanned out to a room's bus subscribers.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Question(WireQuestion),
    Terminated(WireQuestion),
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn question() -> WireQuestion {
        WireQuestion {
            message: "hello".into(),
            sender: "A".into(),
            timestamp: datetime!(2026-03-01 10:00 UTC),
        }
    }

    #[test]
    fn outbound_events_carry_discriminators() {
        let json = serde_json::to_value(Outbound::QuestionList { questions: vec![] }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "question.list", "questions": []}));

        let json = serde_json::to_value(Outbound::Question(question())).unwrap();
        assert_eq!(json["type"], "question.message");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["sender"], "A");
        assert_eq!(json["timestamp"], "2026-03-01T10:00:00Z");

        let json = serde_json::to_value(Outbound::Close(question())).unwrap();
        assert_eq!(json["type"], "close.connection");
    }

    #[test]
    fn inbound_requires_sender_but_not_message() {
        let parsed: InboundQuestion =
            serde_json::from_str(r#"{"sender": "A"}"#).unwrap();
        assert_eq!(parsed.message, "");

        assert!(serde_json::from_str::<InboundQuestion>(r#"{"message": "hi"}"#).is_err());
    }
}
