//! Shared state for feedrelay
//!
//! One instance per process, handed to every signaling connection and
//! event pump.

use crate::config::Config;
use crate::engine::MediaEngine;
use crate::feed::FeedRegistry;
use crate::ingest::{IngestEvents, IngestSupervisor};
use crate::web::broadcast::{BroadcastBus, ConnectionState, Delivery};
use crate::web::metrics::RelayMetrics;
use crate::webrtc::{ServerMessage, SessionRegistry};
use log::{error, info};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state for the application
#[derive(Clone)]
pub struct SharedState {
    /// Configuration
    pub config: Arc<Config>,

    /// Media engine gateway
    pub engine: Arc<MediaEngine>,

    /// Capture/encode process pairs
    pub ingest: Arc<IngestSupervisor>,

    /// Feed records
    pub feeds: Arc<FeedRegistry>,

    /// Client sessions
    pub sessions: Arc<SessionRegistry>,

    /// Outbound fan-out to connected clients
    pub bus: Arc<BroadcastBus>,

    pub metrics: RelayMetrics,

    /// Server start time
    pub start_time: Instant,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("config", &self.config)
            .field("sessions", &self.sessions.count())
            .field("feeds", &self.feeds.running_count())
            .finish()
    }
}

impl SharedState {
    /// Build the shared state. The returned ingest events feed the pumps in
    /// `web::events`.
    pub fn new(config: Config) -> Result<(Self, IngestEvents), prometheus::Error> {
        let engine = Arc::new(MediaEngine::new(config.engine.clone()));
        let (ingest, ingest_events) = IngestSupervisor::new(config.ingest.clone());
        let feeds = Arc::new(FeedRegistry::new(
            engine.clone(),
            ingest.clone(),
            config.ingest.clone(),
        ));
        let state = Self {
            config: Arc::new(config),
            engine,
            ingest,
            feeds,
            sessions: Arc::new(SessionRegistry::new()),
            bus: Arc::new(BroadcastBus::new()),
            metrics: RelayMetrics::with_fresh_registry()?,
            start_time: Instant::now(),
        };
        Ok((state, ingest_events))
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Send a message to one session only
    pub fn send_to(&self, session_id: &str, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.bus.send_to(session_id, &text),
            Err(e) => {
                error!("Failed to encode {}: {}", message.type_name(), e);
                false
            }
        }
    }

    pub fn broadcast(&self, message: &ServerMessage) -> Delivery {
        self.fan_out(message, None)
    }

    pub fn broadcast_except(&self, session_id: &str, message: &ServerMessage) -> Delivery {
        self.fan_out(message, Some(session_id))
    }

    fn fan_out(&self, message: &ServerMessage, exclude: Option<&str>) -> Delivery {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {}: {}", message.type_name(), e);
                return Delivery::default();
            }
        };
        let delivery = match exclude {
            Some(id) => self.bus.broadcast_except(id, &text),
            None => self.bus.broadcast(&text),
        };
        self.metrics.record_dropped_broadcasts(delivery.dropped);
        delivery
    }

    pub fn refresh_gauges(&self) {
        self.metrics.active_sessions.set(self.sessions.count() as i64);
        self.metrics.running_feeds.set(self.feeds.running_count() as i64);
    }

    /// Stop every feed and close every session
    pub async fn shutdown(&self) {
        let stopped = self.feeds.stop_all().await;
        for feed in &stopped {
            self.broadcast(&ServerMessage::FeedStopped {
                feed_id: feed.feed_id.clone(),
                reason: Some("server shutting down".to_string()),
            });
        }
        let ids = self.sessions.ids();
        for id in &ids {
            self.bus.set_state(id, ConnectionState::Closing);
            self.sessions.teardown(&self.engine, id).await;
        }
        self.refresh_gauges();
        info!(
            "Shutdown released {} feeds and {} sessions",
            stopped.len(),
            ids.len()
        );
    }

    pub fn health_json(&self) -> serde_json::Value {
        let stats = self.engine.stats();
        json!({
            "status": if self.engine.is_initialized() { "healthy" } else { "starting" },
            "uptime_seconds": self.uptime().as_secs_f64(),
            "sessions": self.sessions.count(),
            "feeds": self.feeds.feed_ids(),
            "engine": {
                "transports": stats.transports,
                "producers": stats.producers,
                "consumers": stats.consumers,
            },
            "version": env!("CARGO_PKG_VERSION"),
        })
    }
}
