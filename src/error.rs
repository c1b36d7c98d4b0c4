//! Error types for the chat hub
//!
//! Defines connection-level errors, persistence and cache errors, and
//! mailbox send errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Connection-level errors
///
/// All of these are fatal for the one connection they occur on and never
/// for the hub.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The upgrade request carried no usable username
    #[error("Username is required")]
    MissingUsername,

    /// The hub is no longer accepting events
    #[error("Hub closed")]
    HubClosed,

    /// Persistence failed while setting up the session
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced user or room does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store failed
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Recipient cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend failed
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// A cached descriptor could not be encoded or decoded
    #[error("Invalid session descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment override could not be parsed
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Message send errors
///
/// Occurs when a non-blocking enqueue into a session mailbox fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The mailbox is at capacity (slow or stuck consumer)
    #[error("Mailbox full")]
    MailboxFull,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
