use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::dispatch::{self, Dispatch};
use crate::hub::{AgentConnection, OutboundFrame};
use crate::relay::Relay;

#[derive(Debug, Deserialize)]
pub struct AgentSocketQuery {
    #[serde(rename = "clientId", alias = "client_id", default)]
    client_id: Option<String>,
}

pub async fn connect_agent(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<AgentSocketQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client_id = query
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("agent-{}", uuid::Uuid::new_v4().simple()));
    ws.on_upgrade(move |socket| run_agent_socket(relay, client_id, socket))
}

async fn run_agent_socket(relay: Arc<Relay>, client_id: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbox) = AgentConnection::channel();
    let connection_id = connection.id();

    relay.hub().register(client_id.clone(), connection.clone());
    tracing::info!(
        client_id = %client_id,
        connection_id,
        clients = relay.hub().client_count(),
        "agent connected"
    );
    connection.send_json(&json!({
        "type": "welcome",
        "clientId": client_id,
        "connectionId": connection_id,
        "serverTime": chrono::Utc::now().timestamp_millis(),
    }));

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(err) => {
                tracing::debug!(client_id = %client_id, connection_id, error = %err, "agent socket read failed");
                break;
            }
        };

        if dispatch::handle_agent_message(&relay, connection_id, &text) == Dispatch::Pong {
            connection.send_json(&json!({ "type": "pong" }));
        }
    }

    writer.abort();
    let was_sole = relay.hub().unregister(&client_id, connection_id);
    tracing::info!(client_id = %client_id, connection_id, was_sole, "agent disconnected");
    if was_sole && relay.agent_disconnected() {
        tracing::warn!(client_id = %client_id, "active turn failed: agent disconnected");
    }
}
