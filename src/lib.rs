//! Rust client for ChapterConnect realtime meeting sessions.
//!
//! The crate is organized by concern:
//! - `realtime`: websocket session client, envelope types, handler registry,
//!   and the meeting wrapper.
//! - `reconnect`: reconnect policy and timeout utilities.

/// Realtime session client, protocol types, and meeting helpers.
pub mod realtime;
/// Reconnect policy and timeout helpers.
pub mod reconnect;

pub use realtime::client::{
    ConnectionParams, ConnectionState, DisplayIdentity, PayloadEncoding, SessionClient,
    SessionClientError, SessionClientOptions,
};
pub use realtime::meeting::MeetingSession;
pub use realtime::proto::{Envelope, ServerEvent};
pub use realtime::registry::{HandlerRegistry, Subscription};
pub use reconnect::ReconnectPolicy;
