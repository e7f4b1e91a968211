//! WebSocket channel endpoint.
//!
//! Each connection is one `(vault, device)` channel. Inbound frames are
//! JSON [`ChannelMessage`]s; CRDT updates are applied under the vault
//! writer lock, materialized text is committed through the engine's
//! `Applier` implementation, and the original frame is relayed verbatim to
//! every peer device of the vault.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use scion_core::crdt::{Applier, UpdateOrigin};
use scion_core::{validate_vault_name, ErrorKind, ScionError};

use crate::registry::VaultHandle;
use crate::sync::{ChannelMessage, MessageKind, SERVER_DEVICE_ID};
use crate::AppState;

/// Query parameters for the channel endpoint.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

/// GET /vault/:v/ws?deviceId=<id>
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(vault): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if validate_vault_name(&vault).is_err() {
        return (StatusCode::BAD_REQUEST, "invalid vault name").into_response();
    }
    let Some(device_id) = query.device_id.filter(|d| !d.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing deviceId").into_response();
    };

    let handle = match state.registry.get_or_create(&vault).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(vault, "failed to open vault for channel: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, handle, vault, device_id))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    handle: Arc<VaultHandle>,
    vault: String,
    device_id: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (conn_id, mut outbound) = state.hub.register(&vault, &device_id).await;
    info!(vault, device = %device_id, "channel connected");

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.touch(&vault, &device_id).await;
                        let msg: ChannelMessage = match serde_json::from_str(&text) {
                            Ok(msg) => msg,
                            Err(err) => {
                                debug!(vault, device = %device_id, "undecodable frame: {err}");
                                continue;
                            }
                        };
                        if let Some(reply) =
                            process_message(&state, &handle, &vault, &device_id, msg).await
                        {
                            let Ok(json) = serde_json::to_string(&reply) else {
                                continue;
                            };
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        state.hub.touch(&vault, &device_id).await;
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(vault, device = %device_id, "socket error: {err}");
                        break;
                    }
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(msg) => {
                        let Ok(json) = serde_json::to_string(&msg) else {
                            continue;
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Sender dropped: displaced by a newer connection for
                    // this device, or evicted by the heartbeat sweep.
                    None => break,
                }
            }
        }
    }

    state.hub.unregister(&vault, &device_id, &conn_id).await;
    info!(vault, device = %device_id, "channel disconnected");
}

/// Handle one inbound frame. The return value, if any, is sent back on the
/// same channel.
async fn process_message(
    state: &AppState,
    handle: &VaultHandle,
    vault: &str,
    device_id: &str,
    msg: ChannelMessage,
) -> Option<ChannelMessage> {
    match msg.kind {
        MessageKind::Ping => Some(ChannelMessage::pong(vault, SERVER_DEVICE_ID)),

        // Liveness was already refreshed on receipt.
        MessageKind::Pong => None,

        MessageKind::YjsUpdate => {
            let Some(file_id) = msg.file_id.clone() else {
                return Some(ChannelMessage::error(
                    vault,
                    SERVER_DEVICE_ID,
                    "yjs-update: missing fileId",
                ));
            };
            let Some(update) = msg.decoded_payload() else {
                return Some(ChannelMessage::error(
                    vault,
                    SERVER_DEVICE_ID,
                    format!("yjs-update: missing or invalid payload for '{file_id}'"),
                ));
            };

            let mirror = {
                let mut guard = handle.writer.lock().await;
                let writer = &mut *guard;

                let text = {
                    let note = match writer.crdt.note(&file_id) {
                        Ok(note) => note,
                        Err(err) => {
                            error!(vault, file_id, "note doc load failed: {err}");
                            return Some(ChannelMessage::error(
                                vault,
                                SERVER_DEVICE_ID,
                                format!("yjs-update: storage failure for '{file_id}'"),
                            ));
                        }
                    };
                    if let Err(err) = note.apply_update(&update, UpdateOrigin::Remote) {
                        warn!(vault, file_id, "rejected yjs update: {err}");
                        return Some(ChannelMessage::error(
                            vault,
                            SERVER_DEVICE_ID,
                            format!("yjs-update: undecodable update for '{file_id}'"),
                        ));
                    }
                    note.text()
                };

                match writer.engine.apply_text(&file_id, &text) {
                    Ok(applied) => writer
                        .crdt
                        .record_structure(&file_id, &applied.path, Some(&applied.hash), false)
                        .unwrap_or_else(|err| {
                            warn!(vault, file_id, "structure refresh failed: {err}");
                            None
                        }),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        // Text for a file the identity store has not seen
                        // yet; the CRDT state is kept and commits once the
                        // file is created.
                        debug!(vault, file_id, "text update for unknown file");
                        None
                    }
                    Err(err) => {
                        error!(vault, file_id, "commit of materialized text failed: {err}");
                        None
                    }
                }
            };

            // Relay the update verbatim, then any structure refresh.
            state.hub.broadcast(vault, device_id, &msg).await;
            if let Some(update) = mirror {
                let frame = ChannelMessage::update(
                    MessageKind::StructureUpdate,
                    vault,
                    SERVER_DEVICE_ID,
                    None,
                    &update,
                );
                state.hub.broadcast(vault, SERVER_DEVICE_ID, &frame).await;
            }
            None
        }

        MessageKind::StructureUpdate => {
            let Some(update) = msg.decoded_payload() else {
                return Some(ChannelMessage::error(
                    vault,
                    SERVER_DEVICE_ID,
                    "structure-update: missing or invalid payload",
                ));
            };
            {
                let writer = handle.writer.lock().await;
                if let Err(err) = writer
                    .crdt
                    .structure()
                    .apply_update(&update, UpdateOrigin::Remote)
                {
                    warn!(vault, "rejected structure update: {err}");
                    return Some(ChannelMessage::error(
                        vault,
                        SERVER_DEVICE_ID,
                        "structure-update: undecodable update",
                    ));
                }
                if let Err(err) = writer.crdt.structure().save() {
                    warn!(vault, "structure snapshot save failed: {err}");
                }
            }
            state.hub.broadcast(vault, device_id, &msg).await;
            None
        }

        // No server-side state for binary attachments; relay only.
        MessageKind::BinaryUpdate => {
            state.hub.broadcast(vault, device_id, &msg).await;
            None
        }

        MessageKind::SyncRequest => {
            let peer_sv = msg.decoded_payload();
            let result: Result<Vec<u8>, ScionError> = {
                let mut guard = handle.writer.lock().await;
                match &msg.file_id {
                    Some(file_id) => guard.crdt.note_state(file_id, peer_sv.as_deref()),
                    None => guard.crdt.structure_state(peer_sv.as_deref()),
                }
            };
            match result {
                Ok(stateful) => Some(ChannelMessage::sync_response(
                    vault,
                    SERVER_DEVICE_ID,
                    msg.file_id.clone(),
                    &stateful,
                )),
                Err(err) => {
                    warn!(vault, "sync-request failed: {err}");
                    Some(ChannelMessage::error(
                        vault,
                        SERVER_DEVICE_ID,
                        "sync-request: failed to encode state",
                    ))
                }
            }
        }

        MessageKind::SyncResponse | MessageKind::Error => {
            debug!(vault, device = %device_id, kind = ?msg.kind, "ignoring client frame");
            None
        }

        MessageKind::Unknown => {
            warn!(vault, device = %device_id, "dropping frame of unknown type");
            None
        }
    }
}
