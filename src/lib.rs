//! feedrelay - live video relay gateway
//!
//! WebSocket signaling, SFU session bookkeeping and ingest pipeline
//! supervision around a media engine.

pub mod args;
pub mod config;
pub mod engine;
pub mod feed;
pub mod ingest;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use engine::{EngineError, MediaEngine};
pub use feed::{FeedError, FeedRegistry};
pub use ingest::IngestSupervisor;
pub use web::SharedState;
pub use webrtc::{ServerMessage, SignalingError};
