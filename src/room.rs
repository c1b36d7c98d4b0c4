//! Room struct definition
//!
//! A room's live membership is a projection of its persisted roster onto
//! the sessions that are currently connected.

use std::collections::HashSet;

use crate::types::{RoomId, SessionId};

/// Chat room
///
/// Rooms are created explicitly or materialized lazily when a persisted
/// member reconnects. Once live they are never removed.
#[derive(Debug)]
pub struct Room {
    /// Room identifier
    pub id: RoomId,
    /// Room name
    pub name: String,
    /// Username of the creator
    pub creator: String,
    /// Live members (sessions currently registered with the hub)
    members: HashSet<SessionId>,
}

impl Room {
    /// Create a room with no live members
    pub fn new(id: RoomId, name: String, creator: String) -> Self {
        Self {
            id,
            name,
            creator,
            members: HashSet::new(),
        }
    }

    /// Add a live member
    ///
    /// Returns false if the session was already a member.
    pub fn add_member(&mut self, session: SessionId) -> bool {
        self.members.insert(session)
    }

    /// Remove a live member
    ///
    /// Returns true if the session was a member.
    pub fn remove_member(&mut self, session: SessionId) -> bool {
        self.members.remove(&session)
    }

    /// Check if a session is a live member
    pub fn contains(&self, session: SessionId) -> bool {
        self.members.contains(&session)
    }

    /// Number of live members
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Live members other than `except`
    pub fn members_except(&self, except: SessionId) -> Vec<SessionId> {
        self.members
            .iter()
            .copied()
            .filter(|id| *id != except)
            .collect()
    }

    /// All live members
    pub fn members(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.members.iter().copied()
    }
}
