//! The wire envelope — a tagged union over every frame kind the server
//! routes, plus an explicit opaque fallback.
//!
//! Frames are flat JSON objects discriminated by a `type` field. Clients
//! that predate the envelope schema send free-form text; those frames
//! must keep flowing through the broadcast path untouched, so parsing
//! never fails — it produces [`InboundFrame::Opaque`] instead.
//!
//! Sender fields (`from`, `from_user_id`) are *always* overwritten
//! server-side from the connection's verified identity before a frame is
//! routed. A client-supplied sender is discarded by [`Envelope::stamp_sender`].

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Maximum accepted frame size in bytes. Oversized frames disconnect the
/// sender.
pub const MAX_FRAME_BYTES: usize = 512;

/// A routed frame, discriminated by the wire `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Chat text. `to_user_id == 0` means broadcast.
    #[serde(rename = "message")]
    Chat {
        /// Sender display name (server-stamped).
        #[serde(default)]
        from: String,
        /// Sender user id (server-stamped).
        #[serde(default)]
        from_user_id: i64,
        /// Recipient user id; `0` or absent broadcasts.
        #[serde(default)]
        to_user_id: i64,
        /// Message body.
        #[serde(default)]
        text: String,
    },
    /// A user announced itself to the room.
    Join {
        /// Sender display name (server-stamped).
        #[serde(default)]
        from: String,
        /// Sender user id (server-stamped).
        #[serde(default)]
        from_user_id: i64,
        /// Recipient user id; `0` or absent broadcasts.
        #[serde(default)]
        to_user_id: i64,
        /// Optional announcement text.
        #[serde(default)]
        text: String,
    },
    /// A user is leaving the room.
    Leave {
        /// Sender display name (server-stamped).
        #[serde(default)]
        from: String,
        /// Sender user id (server-stamped).
        #[serde(default)]
        from_user_id: i64,
        /// Recipient user id; `0` or absent broadcasts.
        #[serde(default)]
        to_user_id: i64,
        /// Optional text.
        #[serde(default)]
        text: String,
    },
    /// Application-level liveness probe; refreshes presence TTL.
    Heartbeat,
    /// Server reply to [`Envelope::Heartbeat`].
    HeartbeatAck,
    /// Presence change for some user, fanned out to every client.
    UserStatus {
        /// Subject user id.
        user_id: i64,
        /// Subject display name.
        username: String,
        /// Online flag.
        is_online: bool,
    },
    /// Server-generated error surfaced to exactly one client.
    Error {
        /// Origin label; `"System"` for synthetic errors.
        #[serde(default)]
        from: String,
        /// `0` for synthetic errors.
        #[serde(default)]
        from_user_id: i64,
        /// Human-readable description.
        #[serde(default)]
        text: String,
    },
}

/// Result of parsing one inbound frame: either a structured envelope or
/// the normalized raw text, preserved for broadcast pass-through.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Parsed according to the envelope schema.
    Envelope(Envelope),
    /// Anything else. Routed through the broadcast path verbatim.
    Opaque(String),
}

/// Collapse newlines to spaces and trim surrounding whitespace.
///
/// Newlines matter because the outbound pump coalesces queued frames into
/// one write separated by `\n`.
pub fn normalize(raw: &str) -> String {
    raw.replace('\n', " ").trim().to_string()
}

impl Envelope {
    /// Parse a normalized frame. Never fails; schema mismatches become
    /// [`InboundFrame::Opaque`].
    pub fn parse(raw: &str) -> InboundFrame {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => InboundFrame::Envelope(envelope),
            Err(_) => InboundFrame::Opaque(raw.to_string()),
        }
    }

    /// Overwrite sender identity with the connection's verified identity.
    ///
    /// Client-supplied `from`/`from_user_id` values are discarded here and
    /// nowhere else; every routed envelope passes through this exactly once.
    pub fn stamp_sender(&mut self, id: UserId, username: &str) {
        match self {
            Envelope::Chat {
                from, from_user_id, ..
            }
            | Envelope::Join {
                from, from_user_id, ..
            }
            | Envelope::Leave {
                from, from_user_id, ..
            }
            | Envelope::Error {
                from, from_user_id, ..
            } => {
                *from = username.to_string();
                *from_user_id = id.0;
            }
            Envelope::Heartbeat | Envelope::HeartbeatAck | Envelope::UserStatus { .. } => {}
        }
    }

    /// The addressed recipient, when present and nonzero.
    pub fn recipient(&self) -> Option<UserId> {
        match self {
            Envelope::Chat { to_user_id, .. }
            | Envelope::Join { to_user_id, .. }
            | Envelope::Leave { to_user_id, .. } => {
                (*to_user_id > 0).then_some(UserId(*to_user_id))
            }
            _ => None,
        }
    }

    /// Serialize to the flat wire JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Synthetic error sent back to a rate-limited sender.
    pub fn rate_limit_error() -> Self {
        Envelope::Error {
            from: "System".to_string(),
            from_user_id: 0,
            text: "Rate limit exceeded. Please slow down.".to_string(),
        }
    }

    /// Presence-change frame emitted by the hub on register/unregister.
    pub fn user_status(id: UserId, username: &str, is_online: bool) -> Self {
        Envelope::UserStatus {
            user_id: id.0,
            username: username.to_string(),
            is_online,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_chat_with_recipient() {
        let frame = Envelope::parse(r#"{"type":"message","to_user_id":2,"text":"hi"}"#);
        let InboundFrame::Envelope(env) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(env.recipient(), Some(UserId(2)));
        assert_matches!(env, Envelope::Chat { ref text, .. } if text == "hi");
    }

    #[test]
    fn missing_recipient_means_broadcast() {
        let frame = Envelope::parse(r#"{"type":"message","text":"all"}"#);
        let InboundFrame::Envelope(env) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(env.recipient(), None);
    }

    #[test]
    fn zero_recipient_means_broadcast() {
        let frame = Envelope::parse(r#"{"type":"message","to_user_id":0,"text":"all"}"#);
        let InboundFrame::Envelope(env) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(env.recipient(), None);
    }

    #[test]
    fn unknown_type_falls_back_to_opaque() {
        assert_matches!(
            Envelope::parse(r#"{"type":"dance","text":"x"}"#),
            InboundFrame::Opaque(_)
        );
    }

    #[test]
    fn free_text_falls_back_to_opaque() {
        assert_eq!(
            Envelope::parse("hello everyone"),
            InboundFrame::Opaque("hello everyone".to_string())
        );
    }

    #[test]
    fn stamping_discards_client_supplied_sender() {
        let frame =
            Envelope::parse(r#"{"type":"message","from":"mallory","from_user_id":999,"text":"x"}"#);
        let InboundFrame::Envelope(mut env) = frame else {
            panic!("expected envelope");
        };
        env.stamp_sender(UserId(1), "alice");
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["from_user_id"], 1);
        assert_eq!(json["from"], "alice");
    }

    #[test]
    fn heartbeat_round_trip() {
        let frame = Envelope::parse(r#"{"type":"heartbeat"}"#);
        assert_eq!(frame, InboundFrame::Envelope(Envelope::Heartbeat));
        let ack: serde_json::Value =
            serde_json::from_str(&Envelope::HeartbeatAck.encode().unwrap()).unwrap();
        assert_eq!(ack["type"], "heartbeat_ack");
    }

    #[test]
    fn user_status_wire_shape() {
        let env = Envelope::user_status(UserId(5), "eve", true);
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type":"user_status","user_id":5,"username":"eve","is_online":true})
        );
    }

    #[test]
    fn rate_limit_error_wire_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&Envelope::rate_limit_error().encode().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["from"], "System");
        assert_eq!(json["from_user_id"], 0);
    }

    #[test]
    fn normalize_collapses_newlines() {
        assert_eq!(normalize("  a\nb\n"), "a b");
    }

    #[test]
    fn chat_tag_is_message_for_wire_compat() {
        let env = Envelope::Chat {
            from: "a".into(),
            from_user_id: 1,
            to_user_id: 2,
            text: "hi".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "message");
    }
}
