//! Per-connection session tasks
//!
//! Each connection runs a [`Reader`] and a [`Writer`] as separate tasks.
//! Neither touches hub state: the reader posts [`HubEvent`]s, the writer
//! drains the session mailbox onto the socket.
//!
//! The reader alone sends `Unregister`. The writer only stops itself, which
//! the reader notices through the `writer_done` channel.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

use crate::config::SessionConfig;
use crate::hub::{HubEvent, HubHandle};
use crate::message::{Envelope, MessageKind, ServerMessage, Status};
use crate::types::SessionId;

/// Outcome of validating one inbound envelope
#[derive(Debug)]
pub enum Inbound {
    /// Pass to the hub
    Dispatch(HubEvent),
    /// Answer the sender locally, nothing reaches the hub
    Reply(Status),
    /// Drop without a reply
    Ignore,
}

/// Recipient stamped on group messages that name none
pub const DEFAULT_GROUP_RECIPIENT: &str = "general";

/// Stamp the sender and validate an envelope
pub fn route(session: SessionId, username: &str, mut envelope: Envelope) -> Inbound {
    envelope.from = username.to_string();
    if envelope.kind == MessageKind::GroupChat && envelope.to.is_empty() {
        envelope.to = DEFAULT_GROUP_RECIPIENT.to_string();
    }

    match envelope.kind {
        MessageKind::GroupChat | MessageKind::PrivateChat | MessageKind::CreateRoom
            if envelope.content.is_empty() =>
        {
            Inbound::Reply(Status::ContentRequired)
        }
        MessageKind::GroupChat => match envelope.room_id() {
            Some(room_id) => Inbound::Dispatch(HubEvent::GroupMessage {
                from: session,
                room_id,
                envelope,
            }),
            None => Inbound::Ignore,
        },
        MessageKind::PrivateChat => Inbound::Dispatch(HubEvent::PrivateMessage {
            from: session,
            envelope,
        }),
        MessageKind::CreateRoom => Inbound::Dispatch(HubEvent::CreateRoom {
            creator: session,
            name: envelope.content,
        }),
        MessageKind::JoinRoom => match envelope.room_id() {
            Some(room_id) => Inbound::Dispatch(HubEvent::JoinRoom { session, room_id }),
            None => Inbound::Reply(Status::GroupIdRequired),
        },
        MessageKind::Status | MessageKind::UserList => Inbound::Ignore,
    }
}

/// Inbound half of a session
pub struct Reader {
    pub session: SessionId,
    pub username: String,
    pub hub: HubHandle,
    /// Weak so that only the hub keeps the mailbox open
    pub mailbox: mpsc::WeakSender<ServerMessage>,
    pub pong_wait: Duration,
}

impl Reader {
    /// Read frames until the connection fails, then unregister once
    pub async fn run<S>(self, mut stream: S, mut writer_done: oneshot::Receiver<()>)
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            // Any received frame, pongs included, restarts the deadline
            let frame = tokio::select! {
                frame = timeout(self.pong_wait, stream.next()) => frame,
                _ = &mut writer_done => {
                    debug!(session = %self.session, "Writer stopped, closing reader");
                    break;
                }
            };

            let msg = match frame {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    debug!(session = %self.session, "Read error for {}: {}", self.username, e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(session = %self.session, "Read deadline exceeded for {}", self.username);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    if !self.handle_text(&text).await {
                        break;
                    }
                }
                Message::Close(_) => {
                    debug!("Client {} sent close frame", self.username);
                    break;
                }
                Message::Pong(_) => {
                    debug!("Pong from {}", self.username);
                }
                _ => {
                    // Binary and ping frames carry no envelopes
                }
            }
        }

        if self
            .hub
            .send(HubEvent::Unregister {
                session: self.session,
            })
            .await
            .is_err()
        {
            debug!("Hub closed before {} unregistered", self.username);
        }
        debug!(session = %self.session, "Read task ended for {}", self.username);
    }

    /// Returns false once the hub is gone
    async fn handle_text(&self, text: &str) -> bool {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Invalid envelope from {}: {}", self.username, e);
                return true;
            }
        };

        match route(self.session, &self.username, envelope) {
            Inbound::Dispatch(event) => {
                if self.hub.send(event).await.is_err() {
                    debug!("Hub closed, ending read task for {}", self.username);
                    return false;
                }
            }
            Inbound::Reply(status) => self.reply(status),
            Inbound::Ignore => {
                debug!("Ignoring envelope from {}", self.username);
            }
        }
        true
    }

    fn reply(&self, status: Status) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        if mailbox.try_send(status.into()).is_err() {
            warn!("Dropping local notice for {}", self.username);
        }
    }
}

/// Outbound half of a session
pub struct Writer {
    pub session: SessionId,
    pub mailbox: mpsc::Receiver<ServerMessage>,
    pub config: SessionConfig,
}

impl Writer {
    /// Drain the mailbox and send heartbeats until the mailbox closes or a
    /// write fails. Dropping `_done` on return wakes the reader.
    pub async fn run<S>(mut self, mut sink: S, _done: oneshot::Sender<()>)
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let period = self.config.ping_period;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    let Some(msg) = msg else {
                        // Mailbox closed by the hub
                        let close = sink.send(Message::Close(None));
                        let _ = timeout(self.config.write_wait, close).await;
                        break;
                    };
                    match timeout(self.config.write_wait, self.write_batch(&mut sink, msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(session = %self.session, "Write failed: {}", e);
                            break;
                        }
                        Err(_) => {
                            debug!(session = %self.session, "Write deadline exceeded");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = sink.send(Message::Ping(Default::default()));
                    let ping = timeout(self.config.write_wait, ping);
                    if !matches!(ping.await, Ok(Ok(()))) {
                        debug!(session = %self.session, "Ping failed");
                        break;
                    }
                }
            }
        }

        debug!(session = %self.session, "Write task ended");
    }

    /// Write `first` plus whatever is already queued, then flush once
    async fn write_batch<S>(&mut self, sink: &mut S, first: ServerMessage) -> Result<(), WsError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        if let Some(frame) = encode(&first) {
            sink.feed(frame).await?;
        }
        while let Ok(next) = self.mailbox.try_recv() {
            if let Some(frame) = encode(&next) {
                sink.feed(frame).await?;
            }
        }
        sink.flush().await
    }
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match msg.to_json() {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}
