//! Transport layer for feedrelay
//!
//! Handles WebSocket connections carrying the signaling protocol.

pub mod signaling_server;

pub use signaling_server::{close_session, dispatch, handle_signaling_connection};
