use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for an agent socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Handle to one live agent socket.
#[derive(Debug, Clone)]
pub struct AgentConnection {
    id: u64,
    outbox: mpsc::UnboundedSender<OutboundFrame>,
}

impl AgentConnection {
    pub fn new(outbox: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbox,
        }
    }

    /// Connection plus the receiving end its writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send_text(&self, text: String) -> bool {
        self.outbox.send(OutboundFrame::Text(text)).is_ok()
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(text),
            Err(err) => {
                tracing::warn!(connection_id = self.id, error = %err, "failed to serialize outbound message");
                false
            }
        }
    }

    fn close(&self) {
        let _ = self.outbox.send(OutboundFrame::Close);
    }
}

#[derive(Debug, Clone)]
pub struct SoleClient {
    pub client_id: String,
    pub connection: AgentConnection,
}

#[derive(Debug, Default)]
struct HubState {
    clients: HashMap<String, AgentConnection>,
    sole: Option<SoleClient>,
}

/// Registry of agent sockets. The most recent registration is the sole
/// client every turn is relayed through.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    state: Mutex<HubState>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: impl Into<String>, connection: AgentConnection) {
        let client_id = client_id.into();
        let mut state = self.state.lock().expect("hub lock");
        if let Some(previous) = state.clients.insert(client_id.clone(), connection.clone()) {
            if previous.id != connection.id {
                tracing::info!(
                    client_id = %client_id,
                    connection_id = previous.id,
                    "closing replaced agent connection"
                );
                previous.close();
            }
        }
        state.sole = Some(SoleClient {
            client_id,
            connection,
        });
    }

    /// Drops the entry only if it still refers to `connection_id`. Returns
    /// true when the sole client went away.
    pub fn unregister(&self, client_id: &str, connection_id: u64) -> bool {
        let mut state = self.state.lock().expect("hub lock");
        if state
            .clients
            .get(client_id)
            .is_some_and(|conn| conn.id == connection_id)
        {
            state.clients.remove(client_id);
        }
        let was_sole = state
            .sole
            .as_ref()
            .is_some_and(|sole| sole.connection.id == connection_id);
        if was_sole {
            state.sole = None;
        }
        was_sole
    }

    pub fn current(&self) -> Option<SoleClient> {
        self.state.lock().expect("hub lock").sole.clone()
    }

    pub fn is_sole(&self, connection_id: u64) -> bool {
        self.state
            .lock()
            .expect("hub lock")
            .sole
            .as_ref()
            .is_some_and(|sole| sole.connection.id == connection_id)
    }

    #[cfg(test)]
    fn get(&self, client_id: &str) -> Option<AgentConnection> {
        self.state.lock().expect("hub lock").clients.get(client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().expect("hub lock").clients.len()
    }

    /// Sends to the sole client. A missing connection or a closed socket is
    /// reported as `false`.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        match self.current() {
            Some(sole) => sole.connection.send_json(message),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn send_without_connection_reports_failure() {
        let hub = ConnectionHub::new();
        assert!(!hub.send(&json!({"type": "prompt"})));
        assert!(hub.current().is_none());
    }

    #[test]
    fn latest_registration_is_sole_client() {
        let hub = ConnectionHub::new();
        let (first, mut first_rx) = AgentConnection::channel();
        let (second, mut second_rx) = AgentConnection::channel();
        hub.register("a", first);
        hub.register("b", second.clone());

        assert_eq!(hub.current().map(|sole| sole.client_id), Some("b".to_string()));
        assert_eq!(hub.client_count(), 2);
        assert!(hub.send(&json!({"n": 1})));
        assert_eq!(second_rx.try_recv().ok(), Some(OutboundFrame::Text("{\"n\":1}".to_string())));
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn replacing_same_key_closes_previous_connection() {
        let hub = ConnectionHub::new();
        let (old, mut old_rx) = AgentConnection::channel();
        let (new, _new_rx) = AgentConnection::channel();
        hub.register("agent", old);
        hub.register("agent", new.clone());

        assert_eq!(old_rx.try_recv().ok(), Some(OutboundFrame::Close));
        assert_eq!(hub.get("agent").map(|conn| conn.id()), Some(new.id()));
    }

    #[test]
    fn replacing_a_dead_connection_does_not_fail() {
        let hub = ConnectionHub::new();
        let (old, old_rx) = AgentConnection::channel();
        drop(old_rx);
        hub.register("agent", old);
        let (new, _new_rx) = AgentConnection::channel();
        hub.register("agent", new);
        assert!(hub.send(&json!({})));
    }

    #[test]
    fn send_to_closed_socket_reports_failure() {
        let hub = ConnectionHub::new();
        let (conn, rx) = AgentConnection::channel();
        hub.register("agent", conn);
        drop(rx);
        assert!(!hub.send(&json!({})));
    }

    #[test]
    fn stale_unregister_keeps_replacement() {
        let hub = ConnectionHub::new();
        let (old, _old_rx) = AgentConnection::channel();
        let old_id = old.id();
        let (new, _new_rx) = AgentConnection::channel();
        hub.register("agent", old);
        hub.register("agent", new.clone());

        assert!(!hub.unregister("agent", old_id));
        assert!(hub.is_sole(new.id()));
        assert!(hub.unregister("agent", new.id()));
        assert!(hub.current().is_none());
        assert_eq!(hub.client_count(), 0);
    }
}
