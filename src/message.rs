//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol. Inbound frames decode into an
//! [`Envelope`] whose `type` is a closed [`MessageKind`] set, so an unknown
//! tag is a decode failure rather than a silently ignored frame.

use serde::{Deserialize, Serialize};

use crate::types::RoomId;

/// Envelope kind, serialized as the wire `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Message to every member of a room
    GroupChat,
    /// Message to a single user
    PrivateChat,
    /// Create a room named by `content`
    CreateRoom,
    /// Join the room given by `group_id`
    JoinRoom,
    /// Server notice (server → client only)
    Status,
    /// Presence list (server → client only)
    #[serde(rename = "userList")]
    UserList,
}

/// Wire-level chat envelope
///
/// `from` is always stamped server-side; whatever the client put there is
/// overwritten before dispatch. Once dispatched, the envelope is relayed
/// to recipients unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u64>,
}

impl Envelope {
    /// Decode a text frame
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The target room, if a non-zero `group_id` was given
    pub fn room_id(&self) -> Option<RoomId> {
        RoomId::from_wire(self.group_id)
    }
}

/// Server-originated notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Notice {
    /// Receipts, errors and confirmations
    #[serde(rename = "status")]
    Status { content: String },
    /// Presence broadcast
    #[serde(rename = "userList")]
    UserList { online_users: Vec<String> },
}

/// Anything placed into a session's outbound mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A chat envelope passed through from its sender
    Relay(Envelope),
    /// A notice produced by the server
    Notice(Notice),
}

impl ServerMessage {
    /// Build a presence list message
    pub fn user_list(online_users: Vec<String>) -> Self {
        ServerMessage::Notice(Notice::UserList { online_users })
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Envelope> for ServerMessage {
    fn from(envelope: Envelope) -> Self {
        ServerMessage::Relay(envelope)
    }
}

/// Human-readable status notices sent to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Private message reached the recipient's mailbox
    Delivered { to: String },
    /// No live session for the private message recipient
    RecipientNotFound { to: String },
    /// Room was persisted
    RoomCreated { name: String },
    /// Join target does not exist
    RoomNotFound,
    /// Join target already contains the client
    AlreadyMember,
    /// Join confirmation
    Joining { name: String },
    /// Broadcast to existing members when someone joins
    MemberJoined { username: String, total: usize },
    /// Group message target is unknown or the sender is not a member
    GroupNotFound,
    /// Chat content was empty
    ContentRequired,
    /// Join request without a group id
    GroupIdRequired,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Delivered { to } => write!(f, "Message delivered to {}", to),
            Status::RecipientNotFound { to } => {
                write!(f, "User {} is not found or not connected", to)
            }
            Status::RoomCreated { name } => write!(f, "Room {} created", name),
            Status::RoomNotFound => write!(f, "Room not found"),
            Status::AlreadyMember => write!(f, "You are already in this room"),
            Status::Joining { name } => write!(f, "You're joining {}", name),
            Status::MemberJoined { username, total } => {
                write!(f, "{} Connected. Total Members: {}", username, total)
            }
            Status::GroupNotFound => write!(f, "Group not found"),
            Status::ContentRequired => write!(f, "Message content is required"),
            Status::GroupIdRequired => write!(f, "Group ID is required"),
        }
    }
}

impl From<Status> for ServerMessage {
    fn from(status: Status) -> Self {
        ServerMessage::Notice(Notice::Status {
            content: status.to_string(),
        })
    }
}
