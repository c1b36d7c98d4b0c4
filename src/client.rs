//! Client handle definition
//!
//! The hub's view of a connected session: identity plus the sending side of
//! its outbound mailbox. The connection itself is owned by the session tasks.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::SessionId;

/// Connected client information
///
/// The hub keeps exactly one `ClientHandle` per live session. Its `sender`
/// is the only strong sender of the session mailbox, so dropping the handle
/// closes the mailbox and lets the writer send a close frame.
#[derive(Debug)]
pub struct ClientHandle {
    /// Unique identifier for this session
    pub id: SessionId,
    /// Username supplied at handshake
    pub username: String,
    /// Server → Client mailbox
    sender: mpsc::Sender<ServerMessage>,
}

impl ClientHandle {
    /// Create a new handle with the given ID, username and mailbox sender
    pub fn new(id: SessionId, username: String, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            username,
            sender,
        }
    }

    /// Enqueue a message without waiting
    ///
    /// A full mailbox is reported instead of awaited, so the caller never
    /// blocks on a slow consumer.
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::MailboxFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// A weak sender for deferred confirmations
    ///
    /// Holding it does not keep the mailbox open after the hub drops this
    /// handle.
    pub fn downgrade(&self) -> mpsc::WeakSender<ServerMessage> {
        self.sender.downgrade()
    }
}
