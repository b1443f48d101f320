//! Agent-session delivery

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::{DeliverError, DeliverResult, DeliverySink};

/// Host-provided access to agent conversation sessions
///
/// Implemented by the plugin runtime; the bridge only resolves the
/// active session and enqueues text into it.
#[async_trait]
pub trait AgentSessions: Send + Sync {
    /// Key of the currently active session, if any
    async fn active_session(&self) -> Option<String>;

    /// Enqueue a system message into the given session
    async fn send_system_message(&self, session: &str, text: &str) -> Result<(), String>;
}

/// Delivers by injecting a system message into the active agent session
pub struct AgentSessionSink {
    sessions: Arc<dyn AgentSessions>,
}

impl AgentSessionSink {
    pub fn new(sessions: Arc<dyn AgentSessions>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliverySink for AgentSessionSink {
    async fn deliver(&self, message: &str) -> DeliverResult<()> {
        let session = self
            .sessions
            .active_session()
            .await
            .ok_or(DeliverError::NoActiveSession)?;

        self.sessions
            .send_system_message(&session, message)
            .await
            .map_err(DeliverError::Enqueue)?;

        debug!(session = %session, "Delivered trigger into agent session");
        Ok(())
    }
}
