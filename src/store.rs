//! Persistence contract
//!
//! The hub consumes user, message and room storage through [`ChatStore`].
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests; a database-backed store implements the same trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::RoomId;

/// A persisted user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chat message
///
/// Private messages carry `to`, group messages carry `group_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: u64,
    pub from: String,
    pub to: Option<String>,
    pub content: String,
    pub group_id: Option<RoomId>,
    pub created_at: DateTime<Utc>,
}

/// A persisted room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted room membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub room_id: RoomId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// Storage operations consumed by the hub and the gateway
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert the user, or refresh `updated_at` if it already exists
    async fn save_user(&self, username: &str) -> Result<(), StoreError>;

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    /// All users ordered by username
    async fn all_users(&self) -> Result<Vec<UserRecord>, StoreError>;

    async fn save_private_message(
        &self,
        from: &str,
        to: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn save_group_message(
        &self,
        from: &str,
        room_id: RoomId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// The most recent `limit` messages between two users, oldest first
    async fn private_history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// The most recent `limit` messages of a room, oldest first
    async fn group_history(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Persist a room under the id the hub assigned to it
    async fn save_room(
        &self,
        room_id: RoomId,
        name: &str,
        creator: &str,
    ) -> Result<(), StoreError>;

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, StoreError>;

    /// Add a member; adding an existing member is not an error
    async fn add_member(&self, room_id: RoomId, username: &str) -> Result<(), StoreError>;

    /// All rooms ordered by name
    async fn all_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;

    /// Members of a room in join order
    async fn room_members(&self, room_id: RoomId) -> Result<Vec<MemberRecord>, StoreError>;

    /// Rooms the user belongs to, ordered by name
    async fn rooms_for_user(&self, username: &str) -> Result<Vec<RoomRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeMap<String, UserRecord>,
    messages: Vec<MessageRecord>,
    rooms: BTreeMap<RoomId, RoomRecord>,
    members: HashMap<RoomId, Vec<MemberRecord>>,
}

/// In-memory [`ChatStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

/// Keep the newest `limit` records, returned oldest first
fn most_recent(mut records: Vec<MessageRecord>, limit: usize) -> Vec<MessageRecord> {
    records.sort_by_key(|m| (m.created_at, m.id));
    let skip = records.len().saturating_sub(limit);
    records.split_off(skip)
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn save_user(&self, username: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state()?;
        state
            .users
            .entry(username.to_string())
            .and_modify(|user| user.updated_at = now)
            .or_insert_with(|| UserRecord {
                username: username.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.state()?.users.get(username).cloned())
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.state()?.users.values().cloned().collect())
    }

    async fn save_private_message(
        &self,
        from: &str,
        to: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let id = state.messages.len() as u64 + 1;
        state.messages.push(MessageRecord {
            id,
            from: from.to_string(),
            to: Some(to.to_string()),
            content: content.to_string(),
            group_id: None,
            created_at: at,
        });
        Ok(())
    }

    async fn save_group_message(
        &self,
        from: &str,
        room_id: RoomId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if !state.rooms.contains_key(&room_id) {
            return Err(StoreError::NotFound(format!("room {}", room_id)));
        }
        let id = state.messages.len() as u64 + 1;
        state.messages.push(MessageRecord {
            id,
            from: from.to_string(),
            to: None,
            content: content.to_string(),
            group_id: Some(room_id),
            created_at: at,
        });
        Ok(())
    }

    async fn private_history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state()?;
        let between = state
            .messages
            .iter()
            .filter(|m| {
                let to = m.to.as_deref();
                (m.from == user_a && to == Some(user_b)) || (m.from == user_b && to == Some(user_a))
            })
            .cloned()
            .collect();
        Ok(most_recent(between, limit))
    }

    async fn group_history(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state()?;
        let in_room = state
            .messages
            .iter()
            .filter(|m| m.group_id == Some(room_id))
            .cloned()
            .collect();
        Ok(most_recent(in_room, limit))
    }

    async fn save_room(
        &self,
        room_id: RoomId,
        name: &str,
        creator: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.rooms.contains_key(&room_id) {
            return Err(StoreError::Backend(format!("room {} already exists", room_id)));
        }
        state.rooms.insert(
            room_id,
            RoomRecord {
                id: room_id,
                name: name.to_string(),
                created_by: creator.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.state()?.rooms.get(&room_id).cloned())
    }

    async fn add_member(&self, room_id: RoomId, username: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if !state.rooms.contains_key(&room_id) {
            return Err(StoreError::NotFound(format!("room {}", room_id)));
        }
        let members = state.members.entry(room_id).or_default();
        if !members.iter().any(|m| m.username == username) {
            members.push(MemberRecord {
                room_id,
                username: username.to_string(),
                joined_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn all_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let mut rooms: Vec<RoomRecord> = self.state()?.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rooms)
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<MemberRecord>, StoreError> {
        Ok(self
            .state()?
            .members
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn rooms_for_user(&self, username: &str) -> Result<Vec<RoomRecord>, StoreError> {
        let state = self.state()?;
        let mut rooms: Vec<RoomRecord> = state
            .members
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m.username == username))
            .filter_map(|(room_id, _)| state.rooms.get(room_id).cloned())
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rooms)
    }
}
