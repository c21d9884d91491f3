//! Realtime meeting modules.
//!
//! - `client`: websocket transport, AUTH handshake, send gate, and reconnects.
//! - `proto`: envelope format and payload shapes shared with the meeting service.
//! - `registry`: per-type and wildcard handler registration and dispatch.
//! - `meeting`: typed event stream with participant roster tracking.

/// Websocket session client.
pub mod client;
/// Meeting session wrapper that tracks the roster.
pub mod meeting;
/// Envelope and payload types.
pub mod proto;
/// Handler registry and subscriptions.
pub mod registry;
