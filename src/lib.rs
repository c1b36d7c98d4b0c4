//! Real-time WebSocket Chat Hub Library
//!
//! A WebSocket chat server built with tokio-tungstenite using the Actor
//! pattern for connection and room state.
//!
//! # Features
//! - Username taken from the upgrade request query string
//! - Private messages routed by username
//! - Persistent group rooms with membership fan-out
//! - Presence broadcasts of the online user list
//! - Heartbeat pings and read/write deadlines
//! - Slow-consumer eviction without stalling other sessions
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the single owner of sessions, the username index and rooms
//! - Each connection runs a `Reader` and a `Writer` task
//! - Store writes go through the `Persister` worker, never the hub loop
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_hub::{serve, Hub, MemoryCache, MemoryStore, Persister, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let store = Arc::new(MemoryStore::new());
//!     let (persister, queue) = Persister::new(store.clone());
//!     let (hub, handle) = Hub::new(256, Arc::new(MemoryCache::new()), queue);
//!
//!     tokio::spawn(persister.run());
//!     tokio::spawn(hub.run());
//!     serve(listener, handle, store, SessionConfig::default()).await;
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod persist;
pub mod room;
pub mod session;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use cache::{MemoryCache, RecipientCache};
pub use client::ClientHandle;
pub use config::{Config, SessionConfig};
pub use error::{AppError, CacheError, ConfigError, SendError, StoreError};
pub use handler::{handle_connection, serve};
pub use hub::{Hub, HubEvent, HubHandle};
pub use message::{Envelope, MessageKind, ServerMessage};
pub use persist::{PersistQueue, Persister};
pub use room::Room;
pub use store::{ChatStore, MemoryStore};
pub use types::{RoomId, SessionId};
