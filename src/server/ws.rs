// WebSocket connection handling - upgrade, per-client read/write tasks,
// and the inbound message protocol
//
// Each accepted socket gets a client id, a welcome frame, and a writer
// task that drains the client's hub queue onto the socket (one frame in
// flight at a time). The read loop routes subscribe/unsubscribe/ping
// messages; unknown types get an error frame and the connection stays up.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;

use super::hub::WsHub;
use super::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub.clone()))
}

async fn handle_socket(socket: WebSocket, hub: Arc<WsHub>) {
    let (client_id, mut outbound) = hub.register();
    let (mut sink, mut stream) = socket.split();

    hub.send_to(
        &client_id,
        &json!({
            "type": "welcome",
            "client_id": client_id,
            "timestamp": Utc::now(),
        }),
    );

    // Writer task: the only place that touches the sink, so per-socket
    // sends are serialized by construction
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_client_message(&hub, &client_id, &text),
            Ok(Message::Close(_)) | Err(_) => break,
            // Transport-level pings are answered by axum; binary is ignored
            Ok(_) => {}
        }
    }

    hub.disconnect(&client_id);
    writer.abort();
}

/// Route one inbound protocol message.
fn handle_client_message(hub: &WsHub, client_id: &str, text: &str) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            hub.send_to(
                client_id,
                &json!({"type": "error", "message": "invalid JSON"}),
            );
            return;
        }
    };

    let msg_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "subscribe" => match parsed.get("channel").and_then(Value::as_str) {
            Some(channel) if !channel.is_empty() => {
                hub.subscribe(client_id, channel);
                hub.send_to(
                    client_id,
                    &json!({"type": "subscribed", "channel": channel}),
                );
            }
            _ => {
                hub.send_to(
                    client_id,
                    &json!({"type": "error", "message": "subscribe requires a channel"}),
                );
            }
        },
        "unsubscribe" => match parsed.get("channel").and_then(Value::as_str) {
            Some(channel) if !channel.is_empty() => {
                hub.unsubscribe(client_id, channel);
                hub.send_to(
                    client_id,
                    &json!({"type": "unsubscribed", "channel": channel}),
                );
            }
            _ => {
                hub.send_to(
                    client_id,
                    &json!({"type": "error", "message": "unsubscribe requires a channel"}),
                );
            }
        },
        "ping" => {
            hub.send_to(client_id, &json!({"type": "pong", "timestamp": Utc::now()}));
        }
        other => {
            tracing::debug!(client = %client_id, msg_type = other, "unknown message type");
            hub.send_to(
                client_id,
                &json!({"type": "error", "message": format!("unknown message type: {other}")}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::hub::CHANNEL_EVENTS;

    async fn next_frame(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_is_acknowledged_and_takes_effect() {
        let hub = WsHub::new();
        let (client, mut rx) = hub.register();

        handle_client_message(&hub, &client, r#"{"type":"subscribe","channel":"events"}"#);
        let ack = next_frame(&mut rx).await;
        assert_eq!(ack["type"], json!("subscribed"));
        assert_eq!(ack["channel"], json!("events"));
        assert_eq!(hub.subscriber_count(CHANNEL_EVENTS), 1);

        handle_client_message(&hub, &client, r#"{"type":"unsubscribe","channel":"events"}"#);
        let ack = next_frame(&mut rx).await;
        assert_eq!(ack["type"], json!("unsubscribed"));
        assert_eq!(hub.subscriber_count(CHANNEL_EVENTS), 0);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let hub = WsHub::new();
        let (client, mut rx) = hub.register();

        handle_client_message(&hub, &client, r#"{"type":"ping"}"#);
        let pong = next_frame(&mut rx).await;
        assert_eq!(pong["type"], json!("pong"));
        assert!(pong["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_type_gets_error_frame_not_disconnect() {
        let hub = WsHub::new();
        let (client, mut rx) = hub.register();

        handle_client_message(&hub, &client, r#"{"type":"teleport"}"#);
        let err = next_frame(&mut rx).await;
        assert_eq!(err["type"], json!("error"));
        assert!(err["message"].as_str().unwrap().contains("teleport"));
        // Still connected
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_json_and_missing_channel() {
        let hub = WsHub::new();
        let (client, mut rx) = hub.register();

        handle_client_message(&hub, &client, "not json");
        assert_eq!(next_frame(&mut rx).await["type"], json!("error"));

        handle_client_message(&hub, &client, r#"{"type":"subscribe"}"#);
        assert_eq!(next_frame(&mut rx).await["type"], json!("error"));
    }
}
