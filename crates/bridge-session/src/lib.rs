//! Persistent event subscription against Home Assistant
//!
//! [`EventSession`] keeps a WebSocket session to the Home Assistant
//! event bus alive indefinitely: it performs the server-driven auth
//! handshake, subscribes to `state_changed` events, sends periodic
//! keepalive pings, and reconnects with exponential backoff when the
//! connection drops. Each received state transition is evaluated
//! against the rule store and matched rules are dispatched to the
//! configured delivery sink.

mod backoff;
mod session;

pub use backoff::Backoff;
pub use session::{EventSession, SessionConfig, SessionError, SessionHandle, SessionState};
