use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::body::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use turn_relay_error::RelayError;

use crate::hub::ConnectionHub;
use crate::normalize::UpstreamUpdate;
use crate::prompt::TurnRequest;
use crate::responses::ResponseObject;
use crate::session::{EventSink, InflightSession, TurnOutcome, TIMEOUT_ERROR_CODE};

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MODEL: &str = "chat-relay";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub turn_timeout: Duration,
    pub default_model: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Outbound `prompt` message delivered to the sole agent.
#[derive(Debug, Serialize)]
struct PromptMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    id: &'a str,
    created: i64,
    input: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    new_chat: bool,
}

#[derive(Debug)]
pub enum TurnBody {
    Stream(mpsc::UnboundedReceiver<Bytes>),
    Buffered(oneshot::Receiver<ResponseObject>),
}

#[derive(Debug)]
pub struct StartedTurn {
    pub session_id: String,
    pub body: TurnBody,
}

/// Single owner of the in-flight turn and the agent hub.
///
/// Every session mutation happens under `slot`, and nothing awaits while it
/// is held. The hub has its own lock and never takes this one.
#[derive(Debug)]
pub struct Relay {
    config: RelayConfig,
    hub: ConnectionHub,
    slot: Mutex<Option<InflightSession>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            hub: ConnectionHub::new(),
            slot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.slot
            .lock()
            .expect("session slot lock")
            .as_ref()
            .map(|session| session.id().to_string())
    }

    /// Conflict first, then agent presence.
    pub fn check_available(&self) -> Result<(), RelayError> {
        if let Some(session_id) = self.active_session_id() {
            return Err(RelayError::TurnInProgress { session_id });
        }
        if self.hub.current().is_none() {
            return Err(RelayError::AgentUnavailable);
        }
        Ok(())
    }

    pub fn start_turn(self: &Arc<Self>, request: TurnRequest) -> Result<StartedTurn, RelayError> {
        let mut slot = self.slot.lock().expect("session slot lock");
        if let Some(existing) = slot.as_ref() {
            return Err(RelayError::TurnInProgress {
                session_id: existing.id().to_string(),
            });
        }
        let Some(sole) = self.hub.current() else {
            return Err(RelayError::AgentUnavailable);
        };

        let (sink, body) = if request.stream {
            let (sink, rx) = EventSink::stream();
            (sink, TurnBody::Stream(rx))
        } else {
            let (sink, rx) = EventSink::buffered();
            (sink, TurnBody::Buffered(rx))
        };
        let mut session = InflightSession::new(&request, &self.config.default_model, sink);
        let session_id = session.id().to_string();

        let prompt = PromptMessage {
            kind: "prompt",
            id: &session_id,
            created: session.created_at(),
            input: &request.prompt,
            new_chat: request.new_chat,
        };
        if !self.hub.send(&prompt) {
            tracing::warn!(
                session_id = %session_id,
                client_id = %sole.client_id,
                "failed to deliver prompt to agent"
            );
            session.finalize(TurnOutcome::failed(
                "agent_unreachable",
                format!("failed to deliver prompt to agent {}", sole.client_id),
            ));
            return Ok(StartedTurn { session_id, body });
        }

        tracing::info!(
            session_id = %session_id,
            client_id = %sole.client_id,
            stream = request.stream,
            new_chat = request.new_chat,
            prompt_len = request.prompt.len(),
            "turn started"
        );
        session.begin();
        session.set_timeout(self.spawn_timeout(session_id.clone()));
        *slot = Some(session);

        Ok(StartedTurn { session_id, body })
    }

    fn spawn_timeout(self: &Arc<Self>, session_id: String) -> tokio::task::AbortHandle {
        let relay: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.turn_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(relay) = relay.upgrade() {
                relay.expire(&session_id);
            }
        })
        .abort_handle()
    }

    /// Runs `f` on the active session when it matches `session_id` (any
    /// session when `None`).
    fn with_session<R>(
        &self,
        session_id: Option<&str>,
        f: impl FnOnce(&mut InflightSession) -> R,
    ) -> Option<R> {
        let mut slot = self.slot.lock().expect("session slot lock");
        let session = slot.as_mut()?;
        if session_id.is_some_and(|id| id != session.id()) {
            return None;
        }
        Some(f(session))
    }

    pub fn apply_updates(&self, session_id: Option<&str>, updates: Vec<UpstreamUpdate>) -> bool {
        self.with_session(session_id, |session| {
            for update in updates {
                session.apply(update);
            }
        })
        .is_some()
    }

    pub fn passthrough(&self, session_id: Option<&str>, message: Value) -> bool {
        self.with_session(session_id, |session| session.passthrough(message))
            .is_some()
    }

    pub fn complete(&self, session_id: Option<&str>, final_text: Option<&str>) -> bool {
        self.finish(session_id, |session| {
            if let Some(text) = final_text {
                session.apply_full_snapshot(text);
            }
            session.finalize(TurnOutcome::Completed)
        })
    }

    pub fn fail(&self, session_id: Option<&str>, code: &str, message: impl Into<String>) -> bool {
        let outcome = TurnOutcome::failed(code, message);
        self.finish(session_id, |session| session.finalize(outcome))
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        self.finish(Some(session_id), |session| {
            session.finalize(TurnOutcome::Cancelled)
        })
    }

    pub fn expire(&self, session_id: &str) -> bool {
        let timeout_ms = self.config.turn_timeout.as_millis() as u64;
        let finished = self.fail(
            Some(session_id),
            TIMEOUT_ERROR_CODE,
            format!("no terminal signal from agent within {timeout_ms}ms"),
        );
        if finished {
            tracing::warn!(session_id = %session_id, timeout_ms, "turn timed out");
        }
        finished
    }

    pub fn agent_disconnected(&self) -> bool {
        self.fail(None, "agent_disconnected", "remote agent disconnected")
    }

    /// Takes the session out of the slot before finalizing so the terminal
    /// transition happens exactly once.
    fn finish(
        &self,
        session_id: Option<&str>,
        finalize: impl FnOnce(&mut InflightSession) -> bool,
    ) -> bool {
        let mut slot = self.slot.lock().expect("session slot lock");
        let matches = slot
            .as_ref()
            .is_some_and(|session| session_id.map_or(true, |id| id == session.id()));
        if !matches {
            return false;
        }
        match slot.take() {
            Some(mut session) => finalize(&mut session),
            None => false,
        }
    }
}

/// Cancels the turn when the HTTP caller goes away before it resolves.
#[derive(Debug)]
pub struct CancelOnDrop {
    relay: Arc<Relay>,
    session_id: String,
    armed: bool,
}

impl CancelOnDrop {
    pub fn new(relay: Arc<Relay>, session_id: String) -> Self {
        Self {
            relay,
            session_id,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.relay.cancel(&self.session_id) {
            tracing::info!(session_id = %self.session_id, "caller disconnected; turn cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hub::{AgentConnection, OutboundFrame};
    use crate::responses::ResponseStatus;

    fn request(stream: bool) -> TurnRequest {
        TurnRequest {
            prompt: "ping".to_string(),
            input: json!("ping"),
            instructions: None,
            model: None,
            metadata: json!({}),
            stream,
            new_chat: false,
        }
    }

    fn relay_with_agent() -> (Arc<Relay>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let (conn, rx) = AgentConnection::channel();
        relay.hub().register("agent", conn);
        (relay, rx)
    }

    #[tokio::test]
    async fn rejects_without_agent_then_conflicts_while_active() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        assert!(matches!(
            relay.start_turn(request(false)),
            Err(RelayError::AgentUnavailable)
        ));

        let (conn, mut outbox) = AgentConnection::channel();
        relay.hub().register("agent", conn);
        let started = relay.start_turn(request(false)).expect("first turn");
        assert!(matches!(
            relay.start_turn(request(false)),
            Err(RelayError::TurnInProgress { .. })
        ));
        assert!(matches!(
            relay.check_available(),
            Err(RelayError::TurnInProgress { .. })
        ));

        let Some(OutboundFrame::Text(text)) = outbox.recv().await else {
            panic!("expected prompt frame");
        };
        let prompt: Value = serde_json::from_str(&text).expect("prompt json");
        assert_eq!(prompt["type"], "prompt");
        assert_eq!(prompt["id"], started.session_id.as_str());
        assert_eq!(prompt["input"], "ping");
        assert!(prompt.get("new_chat").is_none());

        assert!(relay.complete(Some(&started.session_id), Some("pong")));
        assert!(relay.active_session_id().is_none());
        relay.start_turn(request(false)).expect("after completion");
    }

    #[tokio::test]
    async fn terminal_paths_finalize_exactly_once() {
        let (relay, _outbox) = relay_with_agent();
        let started = relay.start_turn(request(false)).expect("turn");
        let TurnBody::Buffered(rx) = started.body else {
            panic!("expected buffered body");
        };

        assert!(relay.fail(None, "upstream_error", "boom"));
        assert!(!relay.complete(None, None));
        assert!(!relay.cancel(&started.session_id));
        assert!(!relay.expire(&started.session_id));

        let response = rx.await.expect("resolved");
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(
            response.error.map(|err| err.code),
            Some("upstream_error".to_string())
        );
    }

    #[tokio::test]
    async fn stale_session_ids_are_ignored() {
        let (relay, _outbox) = relay_with_agent();
        let started = relay.start_turn(request(true)).expect("turn");
        assert!(!relay.apply_updates(Some("resp_other"), vec![UpstreamUpdate::Delta("x".into())]));
        assert!(!relay.cancel("resp_other"));
        assert!(relay.apply_updates(
            Some(&started.session_id),
            vec![UpstreamUpdate::Delta("x".into())]
        ));
        assert!(relay.cancel(&started.session_id));
    }

    #[tokio::test]
    async fn send_failure_finalizes_without_created_cascade() {
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        let (conn, outbox) = AgentConnection::channel();
        relay.hub().register("agent", conn);
        drop(outbox);

        let started = relay.start_turn(request(true)).expect("turn accepted");
        assert!(relay.active_session_id().is_none());
        let TurnBody::Stream(mut rx) = started.body else {
            panic!("expected stream body");
        };
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(!text.contains("response.created"));
        assert!(text.contains("agent_unreachable"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_frees_the_slot() {
        let relay = Arc::new(Relay::new(RelayConfig {
            turn_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        }));
        let (conn, _outbox) = AgentConnection::channel();
        relay.hub().register("agent", conn);

        let started = relay.start_turn(request(false)).expect("turn");
        let TurnBody::Buffered(rx) = started.body else {
            panic!("expected buffered body");
        };
        let response = rx.await.expect("resolved by timeout");
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.map(|err| err.code), Some("timeout".to_string()));
        assert!(relay.active_session_id().is_none());
    }

    #[tokio::test]
    async fn dropping_cancel_guard_cancels_turn() {
        let (relay, _outbox) = relay_with_agent();
        let started = relay.start_turn(request(false)).expect("turn");
        let TurnBody::Buffered(rx) = started.body else {
            panic!("expected buffered body");
        };
        drop(CancelOnDrop::new(relay.clone(), started.session_id.clone()));

        let response = rx.await.expect("resolved");
        assert_eq!(response.status, ResponseStatus::Cancelled);
        assert!(relay.active_session_id().is_none());
    }
}
