//! Persistence worker
//!
//! The hub never awaits the store. Durability writes are queued here and
//! applied in order by a dedicated task, so store latency cannot stall
//! message fan-out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::message::{ServerMessage, Status};
use crate::store::ChatStore;
use crate::types::RoomId;

/// A durability write requested by the hub
#[derive(Debug)]
pub enum PersistJob {
    PrivateMessage {
        from: String,
        to: String,
        content: String,
        at: DateTime<Utc>,
    },
    GroupMessage {
        from: String,
        room_id: RoomId,
        content: String,
        at: DateTime<Utc>,
    },
    /// Persist a room plus its creator's membership, then confirm to the
    /// creator. No confirmation is sent if either write fails.
    CreateRoom {
        room_id: RoomId,
        name: String,
        creator: String,
        reply: mpsc::WeakSender<ServerMessage>,
    },
    AddMember {
        room_id: RoomId,
        username: String,
    },
}

/// Sending side of the persistence queue
#[derive(Debug, Clone)]
pub struct PersistQueue {
    sender: mpsc::UnboundedSender<PersistJob>,
}

impl PersistQueue {
    /// Queue a job without waiting
    pub fn submit(&self, job: PersistJob) {
        if let Err(e) = self.sender.send(job) {
            error!("Persistence worker stopped, dropping {:?}", e.0);
        }
    }
}

/// Applies queued jobs to a [`ChatStore`]
pub struct Persister {
    store: Arc<dyn ChatStore>,
    receiver: mpsc::UnboundedReceiver<PersistJob>,
}

impl Persister {
    /// Create a worker and the queue that feeds it
    pub fn new(store: Arc<dyn ChatStore>) -> (Self, PersistQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { store, receiver }, PersistQueue { sender })
    }

    /// Run until every queue handle is dropped
    pub async fn run(mut self) {
        info!("Persister started");

        while let Some(job) = self.receiver.recv().await {
            self.apply(job).await;
        }

        info!("Persister shutting down");
    }

    async fn apply(&self, job: PersistJob) {
        match job {
            PersistJob::PrivateMessage {
                from,
                to,
                content,
                at,
            } => {
                if let Err(e) = self
                    .store
                    .save_private_message(&from, &to, &content, at)
                    .await
                {
                    error!(from = %from, to = %to, "Failed to save private message: {}", e);
                }
            }
            PersistJob::GroupMessage {
                from,
                room_id,
                content,
                at,
            } => {
                if let Err(e) = self
                    .store
                    .save_group_message(&from, room_id, &content, at)
                    .await
                {
                    error!(
                        from = %from,
                        room_id = %room_id,
                        "Failed to save group message: {}", e
                    );
                }
            }
            PersistJob::CreateRoom {
                room_id,
                name,
                creator,
                reply,
            } => self.create_room(room_id, name, creator, reply).await,
            PersistJob::AddMember { room_id, username } => {
                if let Err(e) = self.store.add_member(room_id, &username).await {
                    error!(
                        room_id = %room_id,
                        username = %username,
                        "Failed to add room member: {}", e
                    );
                }
            }
        }
    }

    async fn create_room(
        &self,
        room_id: RoomId,
        name: String,
        creator: String,
        reply: mpsc::WeakSender<ServerMessage>,
    ) {
        if let Err(e) = self.store.save_room(room_id, &name, &creator).await {
            error!(room = %name, creator = %creator, "Error creating room: {}", e);
            return;
        }
        if let Err(e) = self.store.add_member(room_id, &creator).await {
            error!(room = %name, creator = %creator, "Error adding room creator: {}", e);
            return;
        }

        info!("Room {} created by {} with ID {}", name, creator, room_id);

        let Some(mailbox) = reply.upgrade() else {
            debug!("Creator {} left before room {} was confirmed", creator, name);
            return;
        };
        if mailbox.try_send(Status::RoomCreated { name }.into()).is_err() {
            warn!("Could not confirm room creation to {}", creator);
        }
    }
}
