//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake with
//! username extraction, user upsert, room prefetch and registration with
//! the hub, then spawns the session's reader and writer tasks.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::client::ClientHandle;
use crate::config::SessionConfig;
use crate::error::AppError;
use crate::hub::{HubEvent, HubHandle, RoomSnapshot};
use crate::session::{Reader, Writer};
use crate::store::ChatStore;
use crate::types::SessionId;

/// Accept connections until the listener fails
pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    store: Arc<dyn ChatStore>,
    config: SessionConfig,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let hub = hub.clone();
                let store = store.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub, store, config).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection
///
/// A request without a `username` query parameter is rejected with
/// 400 before any session exists.
pub async fn handle_connection(
    stream: TcpStream,
    hub: HubHandle,
    store: Arc<dyn ChatStore>,
    config: SessionConfig,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut username = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match username_from_query(req.uri().query()) {
            Some(name) => {
                username = Some(name);
                Ok(response)
            }
            None => Err(bad_request("Username is required")),
        }
    };
    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        ..Default::default()
    };

    let ws_stream =
        match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
        {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                warn!("Handshake with {} rejected: {}", peer_addr, e);
                return Err(e.into());
            }
        };
    let Some(username) = username else {
        return Err(AppError::MissingUsername);
    };

    // Register user to the store
    store.save_user(&username).await?;
    let rooms = load_rooms(store.as_ref(), &username).await;

    let session = SessionId::new();
    info!(session = %session, "{} connected from {}", username, peer_addr);

    let (msg_tx, msg_rx) = mpsc::channel(config.mailbox_capacity);
    let mailbox = msg_tx.downgrade();

    hub.send(HubEvent::Register {
        client: ClientHandle::new(session, username.clone(), msg_tx),
        rooms,
    })
    .await
    .map_err(|_| AppError::HubClosed)?;

    let (ws_sender, ws_receiver) = ws_stream.split();
    let (done_tx, done_rx) = oneshot::channel();

    let writer = Writer {
        session,
        mailbox: msg_rx,
        config,
    };
    let reader = Reader {
        session,
        username: username.clone(),
        hub,
        mailbox,
        pong_wait: config.pong_wait,
    };

    let write_task = tokio::spawn(writer.run(ws_sender, done_tx));
    let read_task = tokio::spawn(reader.run(ws_receiver, done_rx));

    let (read_result, write_result) = tokio::join!(read_task, write_task);
    if let Err(e) = read_result.and(write_result) {
        error!(session = %session, "Session task failed: {}", e);
    }

    info!(session = %session, "{} disconnected", username);

    Ok(())
}

/// Fetch the user's persisted rooms and their rosters
///
/// Failures are logged; the session still registers with whatever loaded.
pub async fn load_rooms(store: &dyn ChatStore, username: &str) -> Vec<RoomSnapshot> {
    let rooms = match store.rooms_for_user(username).await {
        Ok(rooms) => rooms,
        Err(e) => {
            error!("Failed to get rooms of {}: {}", username, e);
            return Vec::new();
        }
    };

    let mut snapshots = Vec::with_capacity(rooms.len());
    for room in rooms {
        match store.room_members(room.id).await {
            Ok(members) => snapshots.push(RoomSnapshot {
                members: members.into_iter().map(|m| m.username).collect(),
                room,
            }),
            Err(e) => error!("Failed to get members of room {}: {}", room.id, e),
        }
    }
    snapshots
}

/// Extract a non-empty `username` from a query string
///
/// The first `username` pair wins. Names containing control characters
/// are treated as missing.
pub fn username_from_query(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "username")
        .map(|(_, value)| value.into_owned())
        .filter(|name| !name.is_empty() && !name.chars().any(char::is_control))
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
