//! Delivery sinks
//!
//! A [`DeliverySink`] turns a triggered rule message into an externally
//! visible effect. Two variants exist: spawning an external command with
//! the message as its final argument, and injecting a system message into
//! the active agent session. The session engine is written once and takes
//! whichever sink it is given.

mod command;
mod session;

use async_trait::async_trait;
use thiserror::Error;

pub use command::CommandSink;
pub use session::{AgentSessionSink, AgentSessions};

/// Delivery errors
#[derive(Debug, Error)]
pub enum DeliverError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("no active agent session to deliver to")]
    NoActiveSession,

    #[error("session enqueue failed: {0}")]
    Enqueue(String),
}

/// Result type for delivery operations
pub type DeliverResult<T> = Result<T, DeliverError>;

/// Capability that makes a triggered rule externally visible
///
/// Implementations must not retry internally; the caller logs failures
/// and moves on to the next matched rule.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, message: &str) -> DeliverResult<()>;
}
