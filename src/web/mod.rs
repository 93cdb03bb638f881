//! HTTP surface, shared state and client fan-out
//!
//! Provides the signaling endpoint, health checks, metrics and the
//! background pumps that turn engine and ingest events into messages.

pub mod broadcast;
pub mod events;
pub mod http_server;
pub mod metrics;
pub mod shared;

pub use broadcast::{BroadcastBus, ConnectionState};
pub use events::spawn_event_pumps;
pub use http_server::{build_router, run_http_server, serve};
pub use metrics::RelayMetrics;
pub use shared::SharedState;
