//! Basic type definitions for the chat hub
//!
//! Provides newtype wrappers for type safety:
//! - `SessionId`: UUID-based unique session identifier
//! - `RoomId`: sequential integer room identifier

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier (newtype pattern)
///
/// Every accepted connection gets a fresh id, so two sessions of the same
/// username are always distinguishable. Used as the arena key in the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room identifier
///
/// Assigned sequentially by the hub at creation time. Zero is never a valid
/// room id; on the wire it means "no group id".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl RoomId {
    /// Interpret a wire `group_id`, treating 0 as absent
    pub fn from_wire(raw: Option<u64>) -> Option<Self> {
        raw.filter(|id| *id != 0).map(Self)
    }

    /// The id following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
