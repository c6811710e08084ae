use serde_json::Value;

use crate::normalize;
use crate::relay::Relay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Text updates applied to the active turn.
    Applied(usize),
    Finished,
    Forwarded,
    /// The sender asked for a `pong`.
    Pong,
    Dropped(&'static str),
}

/// Entry point for raw text frames read off an agent socket.
pub fn handle_agent_message(relay: &Relay, connection_id: u64, text: &str) -> Dispatch {
    match serde_json::from_str::<Value>(text) {
        Ok(message) => dispatch_message(relay, connection_id, message),
        Err(err) => {
            tracing::debug!(connection_id, error = %err, "dropping malformed agent message");
            Dispatch::Dropped("malformed_json")
        }
    }
}

pub fn dispatch_message(relay: &Relay, connection_id: u64, message: Value) -> Dispatch {
    if !relay.hub().is_sole(connection_id) {
        tracing::debug!(connection_id, "ignoring message from superseded agent connection");
        return Dispatch::Dropped("not_sole_client");
    }

    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if kind == "ping" {
        return Dispatch::Pong;
    }

    let Some(active_id) = relay.active_session_id() else {
        tracing::debug!(connection_id, kind = %kind, "no active turn; message dropped");
        return Dispatch::Dropped("no_active_turn");
    };
    let target = message.get("id").and_then(Value::as_str);
    if target.is_some_and(|id| id != active_id) {
        tracing::debug!(
            connection_id,
            kind = %kind,
            message_id = ?target,
            session_id = %active_id,
            "message for a stale turn dropped"
        );
        return Dispatch::Dropped("stale_turn");
    }
    let session_id = Some(active_id.as_str());

    match kind.as_str() {
        "sse" => {
            let updates = normalize::normalize(&message);
            if updates.is_empty() {
                return Dispatch::Applied(0);
            }
            let count = updates.len();
            if relay.apply_updates(session_id, updates) {
                Dispatch::Applied(count)
            } else {
                Dispatch::Dropped("no_active_turn")
            }
        }
        "done" | "closed" => {
            let final_text = message.get("text").and_then(Value::as_str);
            if relay.complete(session_id, final_text) {
                Dispatch::Finished
            } else {
                Dispatch::Dropped("no_active_turn")
            }
        }
        "error" => {
            let detail = message
                .get("message")
                .or_else(|| message.get("error"))
                .map(|value| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "agent reported an error".to_string());
            tracing::warn!(connection_id, session_id = %active_id, error = %detail, "agent reported error");
            if relay.fail(session_id, "upstream_error", detail) {
                Dispatch::Finished
            } else {
                Dispatch::Dropped("no_active_turn")
            }
        }
        _ => {
            if relay.passthrough(session_id, message) {
                Dispatch::Forwarded
            } else {
                Dispatch::Dropped("no_active_turn")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::hub::AgentConnection;
    use crate::prompt::TurnRequest;
    use crate::relay::{RelayConfig, TurnBody};
    use crate::responses::ResponseStatus;

    fn setup() -> (Arc<Relay>, u64, tokio::sync::mpsc::UnboundedReceiver<crate::hub::OutboundFrame>) {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let (conn, outbox) = AgentConnection::channel();
        let id = conn.id();
        relay.hub().register("agent", conn);
        (relay, id, outbox)
    }

    fn start(relay: &Arc<Relay>) -> (String, tokio::sync::oneshot::Receiver<crate::responses::ResponseObject>) {
        let started = relay
            .start_turn(TurnRequest {
                prompt: "q".to_string(),
                input: json!("q"),
                instructions: None,
                model: None,
                metadata: json!({}),
                stream: false,
                new_chat: false,
            })
            .expect("turn");
        match started.body {
            TurnBody::Buffered(rx) => (started.session_id, rx),
            TurnBody::Stream(_) => panic!("expected buffered"),
        }
    }

    #[tokio::test]
    async fn sse_then_done_completes_turn() {
        let (relay, conn, _outbox) = setup();
        let (_id, rx) = start(&relay);

        let sse = json!({"type": "sse", "data": {"v": "Hello "}}).to_string();
        assert_eq!(handle_agent_message(&relay, conn, &sse), Dispatch::Applied(1));
        let snapshot = json!({
            "type": "sse",
            "data": {"message": {"author": {"role": "assistant"}, "content": {"parts": ["Hello world"]}}}
        });
        assert_eq!(dispatch_message(&relay, conn, snapshot), Dispatch::Applied(1));
        assert_eq!(
            dispatch_message(&relay, conn, json!({"type": "done"})),
            Dispatch::Finished
        );

        let response = rx.await.expect("resolved");
        assert_eq!(response.status, ResponseStatus::Completed);
        assert_eq!(response.output_text, "Hello world");
    }

    #[tokio::test]
    async fn error_message_finalizes_immediately() {
        let (relay, conn, _outbox) = setup();
        let (_id, rx) = start(&relay);
        assert_eq!(
            dispatch_message(&relay, conn, json!({"type": "error", "message": "captcha"})),
            Dispatch::Finished
        );
        let response = rx.await.expect("resolved");
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.map(|err| err.message), Some("captcha".to_string()));
    }

    #[tokio::test]
    async fn malformed_stale_and_foreign_messages_are_dropped() {
        let (relay, conn, _outbox) = setup();
        let (id, _rx) = start(&relay);

        assert_eq!(
            handle_agent_message(&relay, conn, "{not json"),
            Dispatch::Dropped("malformed_json")
        );
        assert_eq!(
            dispatch_message(&relay, conn, json!({"type": "done", "id": "resp_old"})),
            Dispatch::Dropped("stale_turn")
        );
        assert_eq!(
            dispatch_message(&relay, conn + 1000, json!({"type": "done"})),
            Dispatch::Dropped("not_sole_client")
        );
        assert_eq!(relay.active_session_id(), Some(id));
    }

    #[tokio::test]
    async fn unknown_types_pass_through_and_ping_gets_pong() {
        let (relay, conn, _outbox) = setup();
        assert_eq!(
            dispatch_message(&relay, conn, json!({"type": "title", "title": "x"})),
            Dispatch::Dropped("no_active_turn")
        );
        let (_id, _rx) = start(&relay);
        assert_eq!(
            dispatch_message(&relay, conn, json!({"type": "title", "title": "x"})),
            Dispatch::Forwarded
        );
        assert_eq!(dispatch_message(&relay, conn, json!({"type": "ping"})), Dispatch::Pong);
    }

    #[tokio::test]
    async fn done_with_final_text_applies_snapshot() {
        let (relay, conn, _outbox) = setup();
        let (id, rx) = start(&relay);
        dispatch_message(
            &relay,
            conn,
            json!({"type": "closed", "id": id, "text": "final answer finished_successfully"}),
        );
        let response = rx.await.expect("resolved");
        assert_eq!(response.output_text, "final answer");
    }
}
