//! Prometheus metrics for the gateway

use prometheus::{CounterVec, Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct RelayMetrics {
    /// Open signaling sessions
    pub active_sessions: IntGauge,

    /// Feeds in RUNNING state
    pub running_feeds: IntGauge,

    /// Inbound signaling messages (labeled by type and outcome)
    pub messages_total: CounterVec,

    /// Frames dropped because the encode input was busy or closed
    pub frames_dropped_total: IntCounter,

    /// Broadcast messages dropped for slow clients
    pub broadcasts_dropped_total: IntCounter,

    /// Unexpected ingest exits (labeled by stage)
    pub ingest_crashes_total: CounterVec,

    pub registry: Arc<Registry>,
}

impl RelayMetrics {
    pub fn new(registry: Registry) -> Result<Self, prometheus::Error> {
        let active_sessions = IntGauge::new(
            "feedrelay_active_sessions",
            "Number of open signaling sessions",
        )?;

        let running_feeds = IntGauge::new("feedrelay_running_feeds", "Number of running feeds")?;

        let messages_total = CounterVec::new(
            Opts::new(
                "feedrelay_signaling_messages_total",
                "Inbound signaling messages",
            ),
            &["type", "outcome"],
        )?;

        let frames_dropped_total = IntCounter::new(
            "feedrelay_frames_dropped_total",
            "Video frames dropped before reaching the encode stage",
        )?;

        let broadcasts_dropped_total = IntCounter::new(
            "feedrelay_broadcasts_dropped_total",
            "Broadcast messages dropped for clients with a full queue",
        )?;

        let ingest_crashes_total = CounterVec::new(
            Opts::new(
                "feedrelay_ingest_crashes_total",
                "Unexpected ingest process exits",
            ),
            &["stage"],
        )?;

        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(running_feeds.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(frames_dropped_total.clone()))?;
        registry.register(Box::new(broadcasts_dropped_total.clone()))?;
        registry.register(Box::new(ingest_crashes_total.clone()))?;

        Ok(Self {
            active_sessions,
            running_feeds,
            messages_total,
            frames_dropped_total,
            broadcasts_dropped_total,
            ingest_crashes_total,
            registry: Arc::new(registry),
        })
    }

    pub fn with_fresh_registry() -> Result<Self, prometheus::Error> {
        Self::new(Registry::new())
    }

    pub fn record_message(&self, message_type: &str, ok: bool) {
        self.messages_total
            .with_label_values(&[message_type, if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn record_dropped_broadcasts(&self, count: usize) {
        if count > 0 {
            self.broadcasts_dropped_total.inc_by(count as u64);
        }
    }

    pub fn record_ingest_crash(&self, stage: &str) {
        self.ingest_crashes_total.with_label_values(&[stage]).inc();
    }

    /// Prometheus text exposition
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
