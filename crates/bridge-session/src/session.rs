//! Event session: connection lifecycle and rule dispatch

use std::sync::Arc;
use std::time::Duration;

use bridge_config::BridgeConfig;
use bridge_deliver::DeliverySink;
use bridge_protocol::{ClientMessage, ServerMessage, StateChanged};
use bridge_rules::{Rule, RuleStore};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

use crate::backoff::Backoff;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Connection lifecycle state, observable through [`SessionHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet running
    Idle,
    /// Socket dial in progress
    Connecting,
    /// Socket open, waiting for the auth exchange to finish
    AuthPending,
    /// Credentials accepted
    Authenticated,
    /// Receiving state-change events
    Subscribed,
    /// Waiting out a backoff delay
    Reconnecting,
    /// Stopped, either explicitly or after an auth rejection; terminal
    Closed,
}

/// Connection parameters and timing knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket API endpoint
    pub url: String,
    /// Long-lived access token
    pub access_token: String,
    /// Ping interval while connected
    pub keepalive: Duration,
    /// First reconnect delay
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling
    pub backoff_max: Duration,
}

impl SessionConfig {
    /// Connection parameters from the loaded bridge configuration
    pub fn from_bridge(config: &BridgeConfig) -> Self {
        Self {
            url: config.url.clone(),
            access_token: config.access_token.clone(),
            keepalive: config.session.keepalive(),
            backoff_initial: config.session.backoff_initial(),
            backoff_max: config.session.backoff_max(),
        }
    }
}

/// How a single connection ended
enum SessionEnd {
    /// Explicit stop; the run loop exits
    Stopped,
    /// Server rejected the access token; retrying cannot succeed
    AuthRejected,
    /// Transient closure or error; reconnect after backoff
    ConnectionLost,
}

/// Handle for observing and stopping a running [`EventSession`]
#[derive(Clone)]
pub struct SessionHandle {
    shutdown: broadcast::Sender<()>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Request the session stop
    ///
    /// Idempotent; safe to call before [`EventSession::run`] starts or
    /// after the session already closed.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch channel for state transitions
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// Persistent subscription to the Home Assistant event bus
///
/// Owns the reconnect loop, the auth handshake, the keepalive timer,
/// and the per-event load/match/deliver/retire cycle. Runs until
/// [`SessionHandle::stop`] is called or the server rejects the access
/// token.
pub struct EventSession {
    config: SessionConfig,
    store: RuleStore,
    sink: Arc<dyn DeliverySink>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    state_tx: watch::Sender<SessionState>,
    /// Outgoing message id counter; reset on every new connection
    next_id: u64,
}

impl EventSession {
    pub fn new(config: SessionConfig, store: RuleStore, sink: Arc<dyn DeliverySink>) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            store,
            sink,
            shutdown_tx,
            shutdown_rx,
            state_tx,
            next_id: 0,
        }
    }

    /// Handle for stopping and observing this session
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shutdown: self.shutdown_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Run the session until stopped or fatally rejected
    ///
    /// Transient connection failures are logged and retried after an
    /// exponential backoff delay; an `auth_invalid` reply stops the
    /// session for good, since retrying with the same token cannot
    /// succeed.
    pub async fn run(mut self) {
        let mut shutdown_rx =
            std::mem::replace(&mut self.shutdown_rx, self.shutdown_tx.subscribe());
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            match self.connect_and_run(&mut shutdown_rx, &mut backoff).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::AuthRejected) => break,
                Ok(SessionEnd::ConnectionLost) => {
                    warn!("Connection to Home Assistant lost");
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                }
            }

            let delay = backoff.next_delay();
            self.set_state(SessionState::Reconnecting);
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.set_state(SessionState::Closed);
        info!("Event session closed");
    }

    /// One connection attempt: dial, handshake, subscribe, event loop
    async fn connect_and_run(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, SessionError> {
        self.set_state(SessionState::Connecting);
        debug!(url = %self.config.url, "Connecting to Home Assistant");

        let (ws, _) = connect_async(self.config.url.as_str()).await?;

        // Successful open resets both the backoff and the id counter.
        backoff.reset();
        self.next_id = 0;

        let (mut writer, mut reader) = ws.split();
        self.set_state(SessionState::AuthPending);

        match self.authenticate(&mut writer, &mut reader, shutdown_rx).await? {
            AuthOutcome::Ok => {}
            AuthOutcome::Stopped => return Ok(SessionEnd::Stopped),
            AuthOutcome::Rejected => return Ok(SessionEnd::AuthRejected),
            AuthOutcome::ConnectionLost => return Ok(SessionEnd::ConnectionLost),
        }

        self.set_state(SessionState::Authenticated);

        let id = self.next_id();
        send(&mut writer, &ClientMessage::subscribe_state_changed(id)).await?;
        self.set_state(SessionState::Subscribed);
        info!("Subscribed to state_changed events");

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.config.keepalive,
            self.config.keepalive,
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
                _ = keepalive.tick() => {
                    let id = self.next_id();
                    send(&mut writer, &ClientMessage::Ping { id }).await?;
                    trace!(id, "Sent keepalive ping");
                }
                frame = reader.next() => {
                    match frame {
                        None => return Ok(SessionEnd::ConnectionLost),
                        Some(Err(e)) => {
                            warn!(error = %e, "Socket error");
                            return Ok(SessionEnd::ConnectionLost);
                        }
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = writer.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(SessionEnd::ConnectionLost),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Server-driven auth exchange
    ///
    /// The client sends nothing until the server asks for auth.
    async fn authenticate(
        &mut self,
        writer: &mut WsWriter,
        reader: &mut WsReader,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<AuthOutcome, SessionError> {
        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(AuthOutcome::Stopped);
                }
                frame = reader.next() => frame,
            };

            let text = match frame {
                None => return Ok(AuthOutcome::ConnectionLost),
                Some(Err(e)) => {
                    warn!(error = %e, "Socket error during auth");
                    return Ok(AuthOutcome::ConnectionLost);
                }
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => return Ok(AuthOutcome::ConnectionLost),
                Some(Ok(_)) => continue,
            };

            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::AuthRequired { ha_version }) => {
                    debug!(ha_version = %ha_version, "Server requested auth");
                    send(writer, &ClientMessage::auth(self.config.access_token.clone())).await?;
                }
                Ok(ServerMessage::AuthOk { ha_version }) => {
                    info!(ha_version = %ha_version, "Authenticated");
                    return Ok(AuthOutcome::Ok);
                }
                Ok(ServerMessage::AuthInvalid { message }) => {
                    error!(message = %message, "Access token rejected; not reconnecting");
                    let _ = writer.send(Message::Close(None)).await;
                    return Ok(AuthOutcome::Rejected);
                }
                Ok(other) => {
                    debug!(message = ?other, "Ignoring message during auth");
                }
                Err(e) => {
                    warn!(error = %e, "Discarding unparsable frame during auth");
                }
            }
        }
    }

    /// Handle one inbound text frame while subscribed
    async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Event { id, event }) => {
                trace!(id, event_type = %event.event_type, "Received event");
                if let Some(changed) = event.state_changed() {
                    self.handle_state_changed(changed).await;
                }
            }
            Ok(ServerMessage::Result { id, success, error }) => {
                if success {
                    trace!(id, "Command acknowledged");
                } else {
                    let (code, message) = error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_default();
                    warn!(id, code = %code, message = %message, "Command rejected");
                }
            }
            Ok(ServerMessage::Pong { id }) => {
                trace!(id, "Received pong");
            }
            Ok(other) => {
                debug!(message = ?other, "Ignoring message");
            }
            Err(e) => {
                warn!(error = %e, "Discarding unparsable frame");
            }
        }
    }

    /// Evaluate one state transition against the rule store
    ///
    /// Loads the rules fresh, delivers the trigger text for every match,
    /// then retires matched one-shot rules in a single save. The
    /// load-evaluate-save cycle is not locked against concurrent events;
    /// retirements can race and the last write wins, which is acceptable
    /// at residential event rates.
    async fn handle_state_changed(&self, changed: StateChanged) {
        let (old, new) = match (&changed.old_state, &changed.new_state) {
            (Some(old), Some(new)) => (old, new),
            // Entity appeared or disappeared; there is no transition.
            _ => return,
        };

        if old.state == new.state {
            return;
        }

        let rules = self.store.load().await;
        let matched: Vec<&Rule> = rules
            .iter()
            .filter(|r| r.matches(&changed.entity_id, &old.state, &new.state))
            .collect();

        if matched.is_empty() {
            return;
        }

        debug!(
            entity_id = %changed.entity_id,
            from = %old.state,
            to = %new.state,
            count = matched.len(),
            "Rules matched"
        );

        let label = new.friendly_name().unwrap_or(changed.entity_id.as_str());
        for rule in &matched {
            let text = format!(
                "{} ({}) changed from \"{}\" to \"{}\": {}",
                label, changed.entity_id, old.state, new.state, rule.message
            );
            if let Err(e) = self.sink.deliver(&text).await {
                warn!(rule_id = %rule.id, error = %e, "Delivery failed");
            }
        }

        let retired: Vec<&str> = matched
            .iter()
            .filter(|r| r.one_shot)
            .map(|r| r.id.as_str())
            .collect();

        if retired.is_empty() {
            return;
        }

        let remaining: Vec<Rule> = rules
            .iter()
            .filter(|r| !retired.contains(&r.id.as_str()))
            .cloned()
            .collect();

        match self.store.save(&remaining).await {
            Ok(()) => info!(count = retired.len(), "Retired one-shot rules"),
            Err(e) => warn!(error = %e, "Failed to persist one-shot retirement"),
        }
    }
}

/// Auth exchange outcome
enum AuthOutcome {
    Ok,
    Stopped,
    Rejected,
    ConnectionLost,
}

/// Serialize and send one outbound message
async fn send(writer: &mut WsWriter, msg: &ClientMessage) -> Result<(), SessionError> {
    let json = serde_json::to_string(msg)?;
    writer.send(Message::Text(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_deliver::{DeliverError, DeliverResult};
    use bridge_rules::RuleInput;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn deliver(&self, message: &str) -> DeliverResult<()> {
            self.delivered.lock().await.push(message.to_string());
            if self.fail {
                return Err(DeliverError::NoActiveSession);
            }
            Ok(())
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            url: "ws://127.0.0.1:1/api/websocket".to_string(),
            access_token: "token".to_string(),
            keepalive: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    fn session_with(
        dir: &TempDir,
        sink: Arc<dyn DeliverySink>,
    ) -> (EventSession, RuleStore) {
        let store = RuleStore::new(dir.path().join("rules.json"));
        let session = EventSession::new(test_config(), store.clone(), sink);
        (session, store)
    }

    fn transition(entity: &str, old: Option<&str>, new: Option<&str>) -> StateChanged {
        let mut value = serde_json::json!({ "entity_id": entity });
        value["old_state"] = match old {
            Some(s) => serde_json::json!({"state": s, "attributes": {}}),
            None => serde_json::Value::Null,
        };
        value["new_state"] = match new {
            Some(s) => serde_json::json!({"state": s, "attributes": {}}),
            None => serde_json::Value::Null,
        };
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_ignored() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let (session, store) = session_with(&dir, sink.clone());

        store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: None,
                message: "changed".to_string(),
                one_shot: true,
            })
            .await
            .unwrap();

        session
            .handle_state_changed(transition("light.bedroom", None, Some("on")))
            .await;
        session
            .handle_state_changed(transition("light.bedroom", Some("on"), None))
            .await;

        assert!(sink.delivered.lock().await.is_empty());
        // One-shot rule must survive: nothing fired.
        assert_eq!(store.load().await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_op_transition_is_ignored() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let (session, store) = session_with(&dir, sink.clone());

        store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: None,
                message: "changed".to_string(),
                one_shot: false,
            })
            .await
            .unwrap();

        session
            .handle_state_changed(transition("light.bedroom", Some("on"), Some("on")))
            .await;

        assert!(sink.delivered.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_matching_rules_fire_and_one_shots_retire() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let (session, store) = session_with(&dir, sink.clone());

        store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: Some("on".to_string()),
                message: "one-shot fired".to_string(),
                one_shot: true,
            })
            .await
            .unwrap();
        let recurring = store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: None,
                message: "recurring fired".to_string(),
                one_shot: false,
            })
            .await
            .unwrap();

        session
            .handle_state_changed(transition("light.bedroom", Some("off"), Some("on")))
            .await;

        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        assert!(delivered[0].contains("one-shot fired"));
        assert!(delivered[0].contains("light.bedroom"));
        assert!(delivered[0].contains("\"off\""));
        assert!(delivered[0].contains("\"on\""));
        assert!(delivered[1].contains("recurring fired"));
        drop(delivered);

        let rules = store.load().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, recurring.id);
    }

    #[tokio::test]
    async fn test_friendly_name_used_in_trigger_text() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let (session, store) = session_with(&dir, sink.clone());

        store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: None,
                message: "changed".to_string(),
                one_shot: false,
            })
            .await
            .unwrap();

        let changed: StateChanged = serde_json::from_value(serde_json::json!({
            "entity_id": "light.bedroom",
            "old_state": {"state": "off", "attributes": {}},
            "new_state": {
                "state": "on",
                "attributes": {"friendly_name": "Bedroom Light"}
            }
        }))
        .unwrap();

        session.handle_state_changed(changed).await;

        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].starts_with("Bedroom Light (light.bedroom)"));
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_block_retirement() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::failing();
        let (session, store) = session_with(&dir, sink.clone());

        store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: Some("on".to_string()),
                message: "first".to_string(),
                one_shot: true,
            })
            .await
            .unwrap();
        store
            .add(RuleInput {
                entity_id: "light.bedroom".to_string(),
                from_state: None,
                to_state: None,
                message: "second".to_string(),
                one_shot: false,
            })
            .await
            .unwrap();

        session
            .handle_state_changed(transition("light.bedroom", Some("off"), Some("on")))
            .await;

        // Both deliveries were attempted despite the first failing.
        assert_eq!(sink.delivered.lock().await.len(), 2);
        // The one-shot still retired.
        assert_eq!(store.load().await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_matches_means_no_store_write() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let (session, store) = session_with(&dir, sink.clone());

        store
            .add(RuleInput {
                entity_id: "light.kitchen".to_string(),
                from_state: None,
                to_state: None,
                message: "changed".to_string(),
                one_shot: true,
            })
            .await
            .unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        session
            .handle_state_changed(transition("light.bedroom", Some("off"), Some("on")))
            .await;

        assert!(sink.delivered.lock().await.is_empty());
        let after = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_handle_reports_idle_before_run() {
        let dir = TempDir::new().unwrap();
        let (session, _) = session_with(&dir, RecordingSink::new());
        assert_eq!(session.handle().state(), SessionState::Idle);
    }
}
