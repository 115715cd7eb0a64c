//! Wire protocol message types
//!
//! Peer mode sends `WireMessage`s as newline-delimited JSON. Relay mode
//! wraps events in `RelayEnvelope`s inside JSON request/response bodies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skillsync_core::ActionEvent;

/// Peer-mode messages, one per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Must be the first message on a connection
    Join { player: String },
    Leave {},
    /// Action event, fields flattened next to `type`
    Skill(ActionEvent),
    /// Current member names, host first
    Members { members: Vec<String> },
}

impl WireMessage {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Entries in a relay room's message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEnvelope {
    Skill {
        data: ActionEvent,
        /// Session that sent it, so pollers can drop their own events
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Uuid>,
    },
    Members {
        members: Vec<String>,
    },
    /// Terminal: the host left
    RoomDisbanded,
}

/// `POST /relay` bodies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayRequest {
    Init {
        room_code: String,
        player_name: String,
    },
    Poll {
        room_code: String,
        #[serde(default)]
        last_index: u64,
        /// Refreshes the caller's liveness when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_name: Option<String>,
    },
    Send {
        room_code: String,
        message: RelayEnvelope,
    },
    Leave {
        room_code: String,
        player_name: String,
    },
}

impl RelayRequest {
    pub fn room_code(&self) -> &str {
        match self {
            RelayRequest::Init { room_code, .. }
            | RelayRequest::Poll { room_code, .. }
            | RelayRequest::Send { room_code, .. }
            | RelayRequest::Leave { room_code, .. } => room_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitResponse {
    pub status: String,
    pub is_host: bool,
    pub room_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: String,
    pub messages: Vec<RelayEnvelope>,
    /// Cursor for the next poll
    pub index: u64,
}

/// Plain `{status}` reply to `send` and `leave`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK.to_string(),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub rooms: usize,
    pub connections: usize,
}

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> ActionEvent {
        ActionEvent {
            action_id: "fireball".into(),
            player_name: "alice".into(),
            timestamp: 100.25,
        }
    }

    #[test]
    fn test_peer_wire_shapes() {
        let cases = [
            (
                WireMessage::Join {
                    player: "alice".into(),
                },
                json!({"type": "join", "player": "alice"}),
            ),
            (WireMessage::Leave {}, json!({"type": "leave"})),
            (
                WireMessage::Skill(event()),
                json!({"type": "skill", "skill_id": "fireball", "player": "alice", "timestamp": 100.25}),
            ),
            (
                WireMessage::Members {
                    members: vec!["alice".into(), "bob".into()],
                },
                json!({"type": "members", "members": ["alice", "bob"]}),
            ),
        ];

        for (msg, expected) in cases {
            assert_eq!(serde_json::to_value(&msg).unwrap(), expected);
            let parsed = WireMessage::from_line(&expected.to_string()).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(WireMessage::from_line(r#"{"type":"ping"}"#).is_err());
        assert!(WireMessage::from_line(r#"{"player":"x"}"#).is_err());
    }

    #[test]
    fn test_relay_request_shapes() {
        let poll: RelayRequest =
            serde_json::from_value(json!({"type": "poll", "room_code": "ABC234"})).unwrap();
        assert_eq!(
            poll,
            RelayRequest::Poll {
                room_code: "ABC234".into(),
                last_index: 0,
                player_name: None
            }
        );

        let send = RelayRequest::Send {
            room_code: "ABC234".into(),
            message: RelayEnvelope::Skill {
                data: event(),
                origin: None,
            },
        };
        assert_eq!(
            serde_json::to_value(&send).unwrap(),
            json!({
                "type": "send",
                "room_code": "ABC234",
                "message": {
                    "type": "skill",
                    "data": {"skill_id": "fireball", "player": "alice", "timestamp": 100.25}
                }
            })
        );
        assert_eq!(send.room_code(), "ABC234");
    }

    #[test]
    fn test_disband_envelope() {
        assert_eq!(
            serde_json::to_value(RelayEnvelope::RoomDisbanded).unwrap(),
            json!({"type": "room_disbanded"})
        );
    }
}
