//! WebSocket endpoint: one socket per game per client.
//!
//! Every inbound mutation resolves the session, runs through its
//! mutation lane, and is answered by the resulting broadcast; the
//! originating socket receives that same broadcast rather than a
//! separate ack. Errors and pongs are the only targeted replies.

use std::collections::BTreeMap;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::ws::{Message, WebSocket};

use gametable_engine::{Seat, SerializedValue};

use crate::errors::ApiError;
use crate::server::AppContext;
use crate::session::GameSession;

/// Query parameters of the upgrade URL:
/// `/games/{id}?playerId={id}&player={seat}&spectator={bool}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub player: Option<Seat>,
    #[serde(default)]
    pub spectator: Option<bool>,
}

/// Client-to-server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Action {
        action: String,
        #[serde(default)]
        args: BTreeMap<String, SerializedValue>,
        #[serde(default)]
        #[allow(dead_code)]
        request_id: Option<String>,
    },
    Ping,
    GetState,
    GetLobby,
    ClaimSeat { seat: Seat, name: String },
    UpdateName { name: String },
    SetReady { ready: bool },
    AddSlot,
    RemoveSlot { seat: Seat },
    #[serde(rename_all = "camelCase")]
    SetSlotAI {
        seat: Seat,
        #[serde(rename = "isAI")]
        is_ai: bool,
        #[serde(default)]
        ai_level: Option<String>,
    },
    LeaveSeat,
    KickPlayer { seat: Seat },
    #[serde(rename_all = "camelCase")]
    UpdatePlayerOptions { player_options: Map<String, Value> },
    #[serde(rename_all = "camelCase")]
    UpdateSlotPlayerOptions {
        seat: Seat,
        player_options: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateGameOptions { game_options: Map<String, Value> },
}

pub async fn handle_socket(socket: WebSocket, game_id: String, query: WsQuery, ctx: AppContext) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session = match ctx.store().require_game(&game_id) {
        Ok(session) => session,
        Err(err) => {
            let body = serde_json::json!({ "type": "error", "error": err.message });
            let _ = ws_tx.send(Message::text(body.to_string())).await;
            let _ = ws_tx.send(Message::close()).await;
            return;
        }
    };

    let player_id = query
        .player_id
        .clone()
        .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()));
    let spectator = query.spectator.unwrap_or(false);

    let (tx, rx) = mpsc::unbounded_channel();
    let conn_id = match session.connect(&player_id, query.player, spectator, tx).await {
        Ok(id) => id,
        Err(err) => {
            let body = serde_json::json!({ "type": "error", "error": err.message });
            let _ = ws_tx.send(Message::text(body.to_string())).await;
            let _ = ws_tx.send(Message::close()).await;
            return;
        }
    };

    // Outbound pump: the session pushes ServerMessages, we frame them as
    // JSON text. The pump ends when the session drops the sender (for
    // example when a newer connection supersedes this one).
    let send_task = tokio::spawn(async move {
        let mut rx = UnboundedReceiverStream::new(rx);
        while let Some(message) = rx.next().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize server message");
                    continue;
                }
            };
            if ws_tx.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::close()).await;
    });

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(game_id = %game_id, error = %err, "websocket read error");
                break;
            }
        };
        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(client_message) => {
                if let Err(err) =
                    dispatch(&session, conn_id, &player_id, client_message).await
                {
                    ctx.metrics().record_failure();
                    session.send_error_to(conn_id, &err).await;
                }
            }
            Err(err) => {
                session
                    .send_error_to(conn_id, &ApiError::invalid_args(format!("bad message: {err}")))
                    .await;
            }
        }
    }

    session.disconnect(conn_id).await;
    send_task.abort();
}

async fn dispatch(
    session: &GameSession,
    conn_id: u64,
    player_id: &str,
    message: ClientMessage,
) -> Result<(), ApiError> {
    match message {
        ClientMessage::Action { action, args, .. } => {
            let seat = session
                .connection_seat(conn_id)
                .await
                .ok_or_else(|| ApiError::forbidden("spectators cannot act"))?;
            session.perform_action(&action, seat, args).await?;
        }
        ClientMessage::Ping => session.ping(conn_id).await,
        ClientMessage::GetState | ClientMessage::GetLobby => {
            session.push_state_to(conn_id).await;
        }
        ClientMessage::ClaimSeat { seat, name } => {
            session.claim_seat(seat, player_id, &name).await?;
        }
        ClientMessage::UpdateName { name } => {
            session.update_slot_name(player_id, &name).await?;
        }
        ClientMessage::SetReady { ready } => {
            session.set_ready(player_id, ready).await?;
        }
        ClientMessage::AddSlot => {
            session.add_slot(player_id).await?;
        }
        ClientMessage::RemoveSlot { seat } => {
            session.remove_slot(player_id, seat).await?;
        }
        ClientMessage::SetSlotAI { seat, is_ai, ai_level } => {
            session
                .set_slot_ai(player_id, seat, is_ai, ai_level.as_deref())
                .await?;
        }
        ClientMessage::LeaveSeat => {
            session.leave_seat(player_id).await?;
        }
        ClientMessage::KickPlayer { seat } => {
            session.kick_player(player_id, seat).await?;
        }
        ClientMessage::UpdatePlayerOptions { player_options } => {
            session.update_player_options(player_id, &player_options).await?;
        }
        ClientMessage::UpdateSlotPlayerOptions { seat, player_options } => {
            session
                .update_slot_player_options(player_id, seat, &player_options)
                .await?;
        }
        ClientMessage::UpdateGameOptions { game_options } => {
            session.update_game_options(player_id, &game_options).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_the_wire_names() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{ "type": "action", "action": "noop", "args": {} }"#)
                .expect("action");
        assert!(matches!(msg, ClientMessage::Action { .. }));

        let msg: ClientMessage = serde_json::from_str(r#"{ "type": "ping" }"#).expect("ping");
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage =
            serde_json::from_str(r#"{ "type": "claimSeat", "seat": 1, "name": "A" }"#)
                .expect("claimSeat");
        assert!(matches!(msg, ClientMessage::ClaimSeat { seat: 1, .. }));

        let msg: ClientMessage = serde_json::from_str(
            r#"{ "type": "setSlotAI", "seat": 2, "isAI": true, "aiLevel": "hard" }"#,
        )
        .expect("setSlotAI");
        let ClientMessage::SetSlotAI { seat, is_ai, ai_level } = msg else { panic!() };
        assert_eq!(seat, 2);
        assert!(is_ai);
        assert_eq!(ai_level.as_deref(), Some("hard"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{ "type": "updatePlayerOptions", "playerOptions": { "color": "red" } }"#,
        )
        .expect("updatePlayerOptions");
        assert!(matches!(msg, ClientMessage::UpdatePlayerOptions { .. }));
    }

    #[test]
    fn unknown_message_types_fail_to_parse() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{ "type": "hack" }"#);
        assert!(parsed.is_err());
    }
}
