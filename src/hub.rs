//! Hub actor implementation
//!
//! The single task that owns the live registry: connected clients, the
//! username index and the room table. Sessions talk to it only through
//! [`HubHandle`]; every event is applied to completion before the next one
//! is received, so the registry needs no locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::cache::{self, RecipientCache, SessionDescriptor};
use crate::client::ClientHandle;
use crate::config::CACHE_TTL;
use crate::error::SendError;
use crate::message::{Envelope, ServerMessage, Status};
use crate::persist::{PersistJob, PersistQueue};
use crate::room::Room;
use crate::store::RoomRecord;
use crate::types::{RoomId, SessionId};

/// A persisted room and its roster, fetched before registration
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room: RoomRecord,
    pub members: Vec<String>,
}

/// Events sent from sessions to the hub
///
/// All events share one ordered queue, so everything a single session
/// sends is applied in the order it was sent.
#[derive(Debug)]
pub enum HubEvent {
    /// Session completed its handshake
    Register {
        client: ClientHandle,
        rooms: Vec<RoomSnapshot>,
    },
    /// Session's reader hit a connection error
    Unregister { session: SessionId },
    /// Chat to a single user (`envelope.to`)
    PrivateMessage {
        from: SessionId,
        envelope: Envelope,
    },
    /// Chat to every other member of a room
    GroupMessage {
        from: SessionId,
        room_id: RoomId,
        envelope: Envelope,
    },
    /// Create a room with the sender as its first member
    CreateRoom { creator: SessionId, name: String },
    /// Add the sender to an existing room
    JoinRoom {
        session: SessionId,
        room_id: RoomId,
    },
}

/// Cloneable handle for posting events to the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
    shutdown: Arc<Notify>,
}

impl HubHandle {
    /// Post an event, waiting for queue capacity
    pub async fn send(&self, event: HubEvent) -> Result<(), SendError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Ask the hub to close every session and stop
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Check if the hub has stopped
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn from_sender(events: mpsc::Sender<HubEvent>) -> Self {
        Self {
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// The hub actor
pub struct Hub {
    /// Live client set: SessionId -> ClientHandle
    clients: HashMap<SessionId, ClientHandle>,
    /// Username index: username -> SessionId
    usernames: HashMap<String, SessionId>,
    /// Live rooms: RoomId -> Room
    rooms: HashMap<RoomId, Room>,
    /// Highest room id in use, live or persisted
    last_room_id: RoomId,
    /// Set whenever the live client set changes
    presence_stale: bool,
    cache: Arc<dyn RecipientCache>,
    cache_ttl: Duration,
    persist: PersistQueue,
    events: mpsc::Receiver<HubEvent>,
    shutdown: Arc<Notify>,
}

impl Hub {
    /// Create a hub and the handle used to reach it
    pub fn new(
        capacity: usize,
        cache: Arc<dyn RecipientCache>,
        persist: PersistQueue,
    ) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        let shutdown = Arc::new(Notify::new());
        let hub = Self {
            clients: HashMap::new(),
            usernames: HashMap::new(),
            rooms: HashMap::new(),
            last_room_id: RoomId(0),
            presence_stale: false,
            cache,
            cache_ttl: CACHE_TTL,
            persist,
            events: rx,
            shutdown: shutdown.clone(),
        };
        let handle = HubHandle {
            events: tx,
            shutdown,
        };
        (hub, handle)
    }

    /// Set the expiry used when populating the recipient cache
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Reserve ids up to the highest persisted room id
    pub fn with_last_room_id(mut self, last: RoomId) -> Self {
        self.last_room_id = self.last_room_id.max(last);
        self
    }

    /// Run the hub event loop
    ///
    /// Stops on shutdown or when every handle has been dropped.
    pub async fn run(mut self) {
        info!("Hub started");

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    self.close_all();
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        info!("Hub shutting down");
    }

    /// Apply a single event
    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register { client, rooms } => self.handle_register(client, rooms),
            HubEvent::Unregister { session } => self.handle_unregister(session),
            HubEvent::PrivateMessage { from, envelope } => {
                self.handle_private_message(from, envelope).await;
            }
            HubEvent::GroupMessage {
                from,
                room_id,
                envelope,
            } => self.handle_group_message(from, room_id, envelope),
            HubEvent::CreateRoom { creator, name } => self.handle_create_room(creator, name),
            HubEvent::JoinRoom { session, room_id } => self.handle_join_room(session, room_id),
        }

        if self.presence_stale {
            self.broadcast_presence();
        }
    }

    /// Handle session registration
    fn handle_register(&mut self, client: ClientHandle, rooms: Vec<RoomSnapshot>) {
        let id = client.id;
        let username = client.username.clone();

        // Last registration wins; the old session is evicted entirely
        if let Some(previous) = self.usernames.get(&username).copied() {
            if previous != id {
                info!(
                    session = %previous,
                    "{} registered again, closing previous session", username
                );
                self.remove_client(previous);
            }
        }

        self.clients.insert(id, client);
        self.usernames.insert(username.clone(), id);

        info!(session = %id, "{} is connected", username);
        info!("Total connected users: {}", self.clients.len());

        for snapshot in rooms {
            let room_id = snapshot.room.id;
            if !self.rooms.contains_key(&room_id) {
                let mut room = Room::new(room_id, snapshot.room.name, snapshot.room.created_by);
                for member in &snapshot.members {
                    if let Some(session) = self.usernames.get(member) {
                        room.add_member(*session);
                    }
                }
                debug!("Total {} members: {}", room.name, snapshot.members.len());
                self.last_room_id = self.last_room_id.max(room_id);
                self.rooms.insert(room_id, room);
            }
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.add_member(id);
            }
        }

        self.presence_stale = true;
    }

    /// Handle session unregistration (no-op if already gone)
    fn handle_unregister(&mut self, session: SessionId) {
        match self.remove_client(session) {
            Some(client) => {
                info!(session = %session, "{} is disconnected", client.username);
                info!("Total connected users: {}", self.clients.len());
            }
            None => debug!("Session {} already unregistered", session),
        }
    }

    /// Handle a private message: cached session first, then the live index
    async fn handle_private_message(&mut self, from: SessionId, envelope: Envelope) {
        if !self.clients.contains_key(&from) {
            return;
        }

        let to = envelope.to.clone();
        let delivered = !to.is_empty()
            && (self.deliver_cached(&envelope).await || self.deliver_live(&envelope).await);

        if delivered {
            self.persist.submit(PersistJob::PrivateMessage {
                from: envelope.from,
                to: to.clone(),
                content: envelope.content,
                at: Utc::now(),
            });
            self.deliver(from, Status::Delivered { to }.into());
        } else {
            self.deliver(from, Status::RecipientNotFound { to }.into());
        }
    }

    /// Fast path: use the cached session only if it is still live as `to`
    async fn deliver_cached(&mut self, envelope: &Envelope) -> bool {
        let descriptor = match cache::lookup(self.cache.as_ref(), &envelope.to).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return false,
            Err(e) => {
                warn!("Recipient cache lookup for {} failed: {}", envelope.to, e);
                return false;
            }
        };

        let live = descriptor.username == envelope.to
            && self
                .clients
                .get(&descriptor.session_id)
                .is_some_and(|c| c.username == envelope.to);
        if !live {
            debug!("Stale cache entry for {}", envelope.to);
            return false;
        }

        debug!("Sending private message to cached session of {}", envelope.to);
        self.deliver(descriptor.session_id, envelope.clone().into())
    }

    /// Slow path: resolve through the live registry and refresh the cache
    async fn deliver_live(&mut self, envelope: &Envelope) -> bool {
        let Some(session) = self.usernames.get(&envelope.to).copied() else {
            return false;
        };
        if !self.deliver(session, envelope.clone().into()) {
            return false;
        }

        let descriptor = SessionDescriptor {
            username: envelope.to.clone(),
            session_id: session,
        };
        if let Err(e) = cache::remember(self.cache.as_ref(), &descriptor, self.cache_ttl).await {
            warn!("Error setting cache for {}: {}", envelope.to, e);
        }
        true
    }

    /// Handle a group message: fan out to every other live member
    fn handle_group_message(&mut self, from: SessionId, room_id: RoomId, envelope: Envelope) {
        if !self.clients.contains_key(&from) {
            return;
        }

        let recipients = match self.rooms.get(&room_id) {
            Some(room) if room.contains(from) => room.members_except(from),
            _ => {
                self.deliver(from, Status::GroupNotFound.into());
                return;
            }
        };

        self.persist.submit(PersistJob::GroupMessage {
            from: envelope.from.clone(),
            room_id,
            content: envelope.content.clone(),
            at: Utc::now(),
        });

        let msg = ServerMessage::from(envelope);
        for member in recipients {
            self.deliver(member, msg.clone());
        }
    }

    /// Handle room creation
    ///
    /// The creator is confirmed by the persister once the room is stored.
    fn handle_create_room(&mut self, creator: SessionId, name: String) {
        let Some(client) = self.clients.get(&creator) else {
            return;
        };
        let creator_name = client.username.clone();
        let reply = client.downgrade();

        let id = self.next_room_id();
        let mut room = Room::new(id, name.clone(), creator_name.clone());
        room.add_member(creator);
        self.rooms.insert(id, room);

        debug!("Room {} created by {} with ID {}", name, creator_name, id);

        self.persist.submit(PersistJob::CreateRoom {
            room_id: id,
            name,
            creator: creator_name,
            reply,
        });
    }

    /// Handle a room join
    fn handle_join_room(&mut self, session: SessionId, room_id: RoomId) {
        let Some(client) = self.clients.get(&session) else {
            return;
        };
        let username = client.username.clone();

        let Some(room) = self.rooms.get_mut(&room_id) else {
            self.deliver(session, Status::RoomNotFound.into());
            return;
        };
        if !room.add_member(session) {
            self.deliver(session, Status::AlreadyMember.into());
            return;
        }

        let name = room.name.clone();
        let total = room.member_count();
        let others = room.members_except(session);

        info!("{} joined room {} ({})", username, name, room_id);

        self.persist.submit(PersistJob::AddMember {
            room_id,
            username: username.clone(),
        });

        self.deliver(session, Status::Joining { name }.into());

        let notice = ServerMessage::from(Status::MemberJoined { username, total });
        for member in others {
            self.deliver(member, notice.clone());
        }
    }

    /// Send the full online list to every live session
    ///
    /// Repeats while deliveries evict sessions, so survivors always end up
    /// with the exact live set.
    fn broadcast_presence(&mut self) {
        while self.presence_stale {
            self.presence_stale = false;

            let online = self.online_users();
            debug!("Broadcasting online users: {:?}", online);

            let msg = ServerMessage::user_list(online);
            let sessions: Vec<SessionId> = self.clients.keys().copied().collect();
            for session in sessions {
                self.deliver(session, msg.clone());
            }
        }
    }

    /// Sorted usernames of all live sessions
    fn online_users(&self) -> Vec<String> {
        let mut online: Vec<String> = self.clients.values().map(|c| c.username.clone()).collect();
        online.sort();
        online
    }

    /// Non-blocking enqueue; a full or closed mailbox evicts the recipient
    ///
    /// Returns true if the message was queued.
    fn deliver(&mut self, to: SessionId, msg: ServerMessage) -> bool {
        let Some(client) = self.clients.get(&to) else {
            return false;
        };
        match client.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %to, "Evicting {}: {}", client.username, e);
                self.remove_client(to);
                false
            }
        }
    }

    /// Remove a session from the client set, the username index and every
    /// room. Dropping the returned handle closes its mailbox.
    fn remove_client(&mut self, session: SessionId) -> Option<ClientHandle> {
        let client = self.clients.remove(&session)?;

        if self.usernames.get(&client.username) == Some(&session) {
            self.usernames.remove(&client.username);
        }
        for room in self.rooms.values_mut() {
            room.remove_member(session);
        }

        self.presence_stale = true;
        Some(client)
    }

    /// Close every live session
    fn close_all(&mut self) {
        info!("Closing {} sessions", self.clients.len());

        let sessions: Vec<SessionId> = self.clients.keys().copied().collect();
        for session in sessions {
            self.remove_client(session);
        }
    }

    /// Allocate the next room id
    fn next_room_id(&mut self) -> RoomId {
        let by_count = RoomId(self.rooms.len() as u64);
        let id = self.last_room_id.max(by_count).next();
        self.last_room_id = id;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{recipient_key, MemoryCache};
    use crate::message::{MessageKind, Notice};
    use crate::persist::Persister;
    use crate::store::{ChatStore, MemoryStore};
    use serde_json::Value;
    use tokio::time::timeout;

    struct TestClient {
        id: SessionId,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn new(username: &str, capacity: usize) -> (Self, ClientHandle) {
            let (tx, rx) = mpsc::channel(capacity);
            let id = SessionId::new();
            let handle = ClientHandle::new(id, username.to_string(), tx);
            (Self { id, rx }, handle)
        }

        /// Everything queued so far
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }

        /// Queued relayed envelopes only
        fn drain_relays(&mut self) -> Vec<ServerMessage> {
            self.drain()
                .into_iter()
                .filter(|m| matches!(m, ServerMessage::Relay(_)))
                .collect()
        }

        /// Queued messages other than presence lists
        fn drain_chat(&mut self) -> Vec<ServerMessage> {
            self.drain()
                .into_iter()
                .filter(|m| !matches!(m, ServerMessage::Notice(Notice::UserList { .. })))
                .collect()
        }

        fn is_closed(&mut self) -> bool {
            self.drain();
            matches!(
                self.rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            )
        }
    }

    struct Fixture {
        hub: Hub,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let cache = Arc::new(MemoryCache::new());
            let (persister, queue) = Persister::new(store.clone());
            tokio::spawn(persister.run());
            let (hub, _handle) = Hub::new(16, cache.clone(), queue);
            Self { hub, store, cache }
        }

        async fn connect(&mut self, username: &str) -> TestClient {
            self.connect_with_capacity(username, 64).await
        }

        async fn connect_with_capacity(&mut self, username: &str, capacity: usize) -> TestClient {
            let (client, handle) = TestClient::new(username, capacity);
            self.hub
                .handle_event(HubEvent::Register {
                    client: handle,
                    rooms: Vec::new(),
                })
                .await;
            self.assert_invariants();
            client
        }

        async fn apply(&mut self, event: HubEvent) {
            self.hub.handle_event(event).await;
            self.assert_invariants();
        }

        fn assert_invariants(&self) {
            let hub = &self.hub;
            assert_eq!(hub.clients.len(), hub.usernames.len());
            for (username, session) in &hub.usernames {
                let client = hub.clients.get(session).expect("index points at live client");
                assert_eq!(&client.username, username);
            }
            for room in hub.rooms.values() {
                for member in room.members() {
                    assert!(hub.clients.contains_key(&member), "room holds dead session");
                }
            }
        }
    }

    fn chat(
        from: &str,
        to: &str,
        kind: MessageKind,
        content: &str,
        group_id: Option<u64>,
    ) -> Envelope {
        Envelope {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            content: content.to_string(),
            group_id,
        }
    }

    fn status_text(msg: &ServerMessage) -> Option<&str> {
        match msg {
            ServerMessage::Notice(Notice::Status { content }) => Some(content),
            _ => None,
        }
    }

    fn last_user_list(msgs: &[ServerMessage]) -> Option<Vec<String>> {
        msgs.iter().rev().find_map(|m| match m {
            ServerMessage::Notice(Notice::UserList { online_users }) => Some(online_users.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_presence_after_register_and_unregister() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;
        let mut bob = fx.connect("bob").await;

        assert_eq!(
            last_user_list(&alice.drain()),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(
            last_user_list(&bob.drain()),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );

        fx.apply(HubEvent::Unregister { session: bob.id }).await;

        assert_eq!(
            last_user_list(&alice.drain()),
            Some(vec!["alice".to_string()])
        );
        assert!(bob.is_closed());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;
        let bob = fx.connect("bob").await;

        fx.apply(HubEvent::Unregister { session: bob.id }).await;
        alice.drain();

        fx.apply(HubEvent::Unregister { session: bob.id }).await;
        fx.apply(HubEvent::Unregister {
            session: SessionId::new(),
        })
        .await;

        // No new presence broadcast for no-op unregisters
        assert!(alice.drain().is_empty());
        assert_eq!(fx.hub.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_previous_session() {
        let mut fx = Fixture::new();
        let mut first = fx.connect("alice").await;
        let mut second = fx.connect("alice").await;

        assert!(first.is_closed());
        assert_eq!(fx.hub.clients.len(), 1);
        assert_eq!(fx.hub.usernames.get("alice"), Some(&second.id));
        assert_eq!(
            last_user_list(&second.drain()),
            Some(vec!["alice".to_string()])
        );

        // The old reader's unregister must not remove the new session
        fx.apply(HubEvent::Unregister { session: first.id }).await;
        assert_eq!(fx.hub.usernames.get("alice"), Some(&second.id));
    }

    #[tokio::test]
    async fn test_group_chat_scenario() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;

        fx.apply(HubEvent::CreateRoom {
            creator: alice.id,
            name: "team".to_string(),
        })
        .await;
        assert!(fx.hub.rooms.contains_key(&RoomId(1)));

        let confirmation = timeout(Duration::from_secs(1), async {
            loop {
                match alice.rx.recv().await {
                    Some(ServerMessage::Notice(Notice::UserList { .. })) => continue,
                    other => break other,
                }
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status_text(&confirmation), Some("Room team created"));

        let mut bob = fx.connect("bob").await;
        alice.drain();
        fx.apply(HubEvent::JoinRoom {
            session: bob.id,
            room_id: RoomId(1),
        })
        .await;

        let bob_msgs = bob.drain_chat();
        assert_eq!(status_text(&bob_msgs[0]), Some("You're joining team"));
        let alice_msgs = alice.drain_chat();
        assert_eq!(
            status_text(&alice_msgs[0]),
            Some("bob Connected. Total Members: 2")
        );

        let envelope = chat("alice", "", MessageKind::GroupChat, "hi", Some(1));
        fx.apply(HubEvent::GroupMessage {
            from: alice.id,
            room_id: RoomId(1),
            envelope: envelope.clone(),
        })
        .await;

        let bob_msgs = bob.drain_chat();
        assert_eq!(bob_msgs, vec![ServerMessage::Relay(envelope)]);
        assert!(alice.drain_chat().is_empty());

        let json: Value = serde_json::from_str(&bob_msgs[0].to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "group_chat");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["content"], "hi");
    }

    #[tokio::test]
    async fn test_join_errors() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;

        fx.apply(HubEvent::JoinRoom {
            session: alice.id,
            room_id: RoomId(9),
        })
        .await;
        assert_eq!(
            status_text(&alice.drain_chat()[0]),
            Some("Room not found")
        );

        fx.apply(HubEvent::CreateRoom {
            creator: alice.id,
            name: "team".to_string(),
        })
        .await;
        fx.apply(HubEvent::JoinRoom {
            session: alice.id,
            room_id: RoomId(1),
        })
        .await;
        let texts: Vec<String> = alice
            .drain_chat()
            .iter()
            .filter_map(|m| status_text(m).map(str::to_string))
            .collect();
        assert!(texts.contains(&"You are already in this room".to_string()));
    }

    #[tokio::test]
    async fn test_group_message_requires_membership() {
        let mut fx = Fixture::new();
        let alice = fx.connect("alice").await;
        let mut bob = fx.connect("bob").await;

        fx.apply(HubEvent::CreateRoom {
            creator: alice.id,
            name: "team".to_string(),
        })
        .await;
        bob.drain();

        fx.apply(HubEvent::GroupMessage {
            from: bob.id,
            room_id: RoomId(1),
            envelope: chat("bob", "", MessageKind::GroupChat, "hi", Some(1)),
        })
        .await;
        assert_eq!(
            bob.drain_chat()
                .iter()
                .map(|m| status_text(m).map(str::to_string))
                .collect::<Vec<_>>(),
            vec![Some("Group not found".to_string())]
        );
    }

    #[tokio::test]
    async fn test_private_message_to_unknown_user() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;
        alice.drain();

        fx.apply(HubEvent::PrivateMessage {
            from: alice.id,
            envelope: chat("alice", "carol", MessageKind::PrivateChat, "hello", None),
        })
        .await;

        let msgs = alice.drain();
        assert_eq!(msgs.len(), 1);
        let json: Value = serde_json::from_str(&msgs[0].to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "status",
                "content": "User carol is not found or not connected"
            })
        );
    }

    #[tokio::test]
    async fn test_private_message_delivery_populates_cache() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;
        let mut bob = fx.connect("bob").await;
        alice.drain();
        bob.drain();

        let first = chat("alice", "bob", MessageKind::PrivateChat, "A", None);
        let second = chat("alice", "bob", MessageKind::PrivateChat, "B", None);
        for envelope in [first.clone(), second.clone()] {
            fx.apply(HubEvent::PrivateMessage {
                from: alice.id,
                envelope,
            })
            .await;
        }

        assert_eq!(
            bob.drain(),
            vec![ServerMessage::Relay(first), ServerMessage::Relay(second)]
        );
        let receipts: Vec<Option<String>> = alice
            .drain()
            .iter()
            .map(|m| status_text(m).map(str::to_string))
            .collect();
        assert_eq!(
            receipts,
            vec![
                Some("Message delivered to bob".to_string()),
                Some("Message delivered to bob".to_string())
            ]
        );

        let cached = cache::lookup(fx.cache.as_ref(), "bob").await.unwrap().unwrap();
        assert_eq!(cached.session_id, bob.id);

        // Persisted asynchronously
        let history = timeout(Duration::from_secs(1), async {
            loop {
                let history = fx.store.private_history("alice", "bob", 10).await.unwrap();
                if history.len() == 2 {
                    break history;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(history[0].content, "A");
        assert_eq!(history[1].content, "B");
    }

    #[tokio::test]
    async fn test_stale_cache_entry_falls_back_to_live_lookup() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;

        // Entry for a session that no longer exists
        let stale = SessionDescriptor {
            username: "bob".to_string(),
            session_id: SessionId::new(),
        };
        cache::remember(fx.cache.as_ref(), &stale, Duration::from_secs(60))
            .await
            .unwrap();

        let mut bob = fx.connect("bob").await;
        alice.drain();
        bob.drain();

        let envelope = chat("alice", "bob", MessageKind::PrivateChat, "hi", None);
        fx.apply(HubEvent::PrivateMessage {
            from: alice.id,
            envelope: envelope.clone(),
        })
        .await;

        assert_eq!(bob.drain(), vec![ServerMessage::Relay(envelope)]);
        assert_eq!(
            status_text(&alice.drain()[0]),
            Some("Message delivered to bob")
        );
        let refreshed = cache::lookup(fx.cache.as_ref(), "bob").await.unwrap().unwrap();
        assert_eq!(refreshed.session_id, bob.id);
    }

    #[tokio::test]
    async fn test_mismatched_or_garbage_cache_entry_is_ignored() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;
        let mut bob = fx.connect("bob").await;
        alice.drain();
        bob.drain();

        // Entry under bob's key that names alice's session
        let wrong = SessionDescriptor {
            username: "alice".to_string(),
            session_id: alice.id,
        };
        fx.cache
            .set(&recipient_key("bob"), wrong.encode().unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let envelope = chat("alice", "bob", MessageKind::PrivateChat, "one", None);
        fx.apply(HubEvent::PrivateMessage {
            from: alice.id,
            envelope: envelope.clone(),
        })
        .await;
        assert_eq!(bob.drain(), vec![ServerMessage::Relay(envelope)]);

        fx.cache
            .set(&recipient_key("bob"), "garbage".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let envelope = chat("alice", "bob", MessageKind::PrivateChat, "two", None);
        fx.apply(HubEvent::PrivateMessage {
            from: alice.id,
            envelope: envelope.clone(),
        })
        .await;
        assert_eq!(bob.drain(), vec![ServerMessage::Relay(envelope)]);
        assert!(alice
            .drain()
            .iter()
            .all(|m| status_text(m) == Some("Message delivered to bob")));
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_without_blocking_fan_out() {
        let mut fx = Fixture::new();
        let mut alice = fx.connect("alice").await;
        let mut bob = fx.connect("bob").await;
        // Capacity 1 and never drained: the first presence list fills it
        let mut stuck = fx.connect_with_capacity("stuck", 1).await;

        fx.apply(HubEvent::CreateRoom {
            creator: alice.id,
            name: "team".to_string(),
        })
        .await;
        for session in [bob.id, stuck.id] {
            fx.hub
                .rooms
                .get_mut(&RoomId(1))
                .unwrap()
                .add_member(session);
        }
        alice.drain();
        bob.drain();

        let envelope = chat("alice", "", MessageKind::GroupChat, "hi", Some(1));
        fx.apply(HubEvent::GroupMessage {
            from: alice.id,
            room_id: RoomId(1),
            envelope: envelope.clone(),
        })
        .await;

        assert!(!fx.hub.clients.contains_key(&stuck.id));
        assert!(!fx.hub.usernames.contains_key("stuck"));
        assert!(!fx.hub.rooms[&RoomId(1)].contains(stuck.id));
        assert!(stuck.is_closed());

        let bob_msgs = bob.drain();
        assert!(bob_msgs.contains(&ServerMessage::Relay(envelope)));
        assert_eq!(
            last_user_list(&bob_msgs),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(
            last_user_list(&alice.drain()),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[tokio::test]
    async fn test_registration_rehydrates_persisted_rooms() {
        let mut fx = Fixture::new();
        let team = RoomId(1);
        fx.store.save_room(team, "team", "alice").await.unwrap();
        fx.store.add_member(team, "alice").await.unwrap();
        fx.store.add_member(team, "bob").await.unwrap();
        let snapshot = RoomSnapshot {
            room: fx.store.find_room(team).await.unwrap().unwrap(),
            members: vec!["alice".to_string(), "bob".to_string()],
        };

        let mut bob = fx.connect("bob").await;

        let (mut alice, handle) = TestClient::new("alice", 64);
        fx.apply(HubEvent::Register {
            client: handle,
            rooms: vec![snapshot],
        })
        .await;

        let room = &fx.hub.rooms[&team];
        assert!(room.contains(alice.id));
        assert!(room.contains(bob.id));
        bob.drain();
        alice.drain();

        // New rooms never reuse the rehydrated id
        fx.apply(HubEvent::CreateRoom {
            creator: bob.id,
            name: "ops".to_string(),
        })
        .await;
        assert!(fx.hub.rooms.contains_key(&RoomId(2)));

        let envelope = chat("alice", "", MessageKind::GroupChat, "back", Some(team.0));
        fx.apply(HubEvent::GroupMessage {
            from: alice.id,
            room_id: team,
            envelope: envelope.clone(),
        })
        .await;
        assert_eq!(bob.drain_relays(), vec![ServerMessage::Relay(envelope)]);
        assert!(alice.drain_relays().is_empty());
    }

    #[tokio::test]
    async fn test_room_ids_skip_persisted_rooms() {
        let store = Arc::new(MemoryStore::new());
        let (_persister, queue) = Persister::new(store);
        let (hub, _handle) = Hub::new(16, Arc::new(MemoryCache::new()), queue);
        let mut hub = hub.with_last_room_id(RoomId(5));

        assert_eq!(hub.next_room_id(), RoomId(6));
        assert_eq!(hub.next_room_id(), RoomId(7));
    }

    #[tokio::test]
    async fn test_registry_consistency_under_churn() {
        let mut fx = Fixture::new();
        let mut clients = Vec::new();
        for name in ["a", "b", "c", "a", "d", "b"] {
            clients.push(fx.connect(name).await);
        }
        fx.apply(HubEvent::CreateRoom {
            creator: clients[4].id,
            name: "r".to_string(),
        })
        .await;
        fx.apply(HubEvent::JoinRoom {
            session: clients[5].id,
            room_id: RoomId(1),
        })
        .await;

        for client in clients.iter().step_by(2) {
            fx.apply(HubEvent::Unregister { session: client.id }).await;
        }

        let online = fx.hub.online_users();
        assert_eq!(online, vec!["a".to_string(), "b".to_string()]);
        assert!(fx.hub.rooms[&RoomId(1)].contains(clients[5].id));
        assert!(!fx.hub.rooms[&RoomId(1)].contains(clients[4].id));

        for client in clients.iter_mut() {
            if fx.hub.clients.contains_key(&client.id) {
                assert_eq!(last_user_list(&client.drain()), Some(online.clone()));
            } else {
                assert!(client.is_closed());
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let store = Arc::new(MemoryStore::new());
        let (_persister, queue) = Persister::new(store);
        let (hub, handle) = Hub::new(16, Arc::new(MemoryCache::new()), queue);
        let task = tokio::spawn(hub.run());

        let (mut alice, alice_handle) = TestClient::new("alice", 64);
        let (mut bob, bob_handle) = TestClient::new("bob", 64);
        handle
            .send(HubEvent::Register {
                client: alice_handle,
                rooms: Vec::new(),
            })
            .await
            .unwrap();
        handle
            .send(HubEvent::Register {
                client: bob_handle,
                rooms: Vec::new(),
            })
            .await
            .unwrap();

        handle.shutdown();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        for client in [&mut alice, &mut bob] {
            let drained = timeout(Duration::from_secs(1), async {
                while client.rx.recv().await.is_some() {}
            })
            .await;
            assert!(drained.is_ok());
        }
        assert!(handle.is_closed());
    }
}
