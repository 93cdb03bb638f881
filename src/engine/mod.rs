//! Media engine gateway
//!
//! Wraps a mediasoup worker and router behind one handle shared by every
//! session and feed:
//! - Init-once worker and router
//! - Transport, producer and consumer operations
//! - Capability checks before any consumer is created
//! - Close notifications on a broadcast channel
//! - Worker death as a terminal condition

pub mod router;
#[cfg(test)]
pub(crate) mod testing;
pub mod worker;

pub use mediasoup::data_structures::{DtlsParameters, DtlsState, IceCandidate, IceParameters};
pub use mediasoup::rtp_parameters::{
    MediaKind, RtpCapabilities, RtpCapabilitiesFinalized, RtpParameters,
};
pub use router::{
    ingest_parameters, ConsumeGrant, ConsumerInfo, IngestParameters, PipeTransportInfo,
    ProducerInfo, RelayRouter, RouterStats, WebRtcTransportInfo,
};
pub use worker::EngineWorker;

use crate::config::EngineConfig;
use log::{error, info};
use mediasoup::worker_manager::WorkerManager;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, OnceCell};

pub type TransportId = String;
pub type ProducerId = String;
pub type ConsumerId = String;

/// Media engine errors
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Worker/router not initialized yet
    EngineUnavailable,
    /// Worker died; nothing works any more
    EngineFatal(String),
    TransportNotFound(String),
    TransportNotConnected(String),
    ProducerNotFound(String),
    ConsumerNotFound(String),
    /// Produce on a receive transport or consume on a send transport
    WrongDirection(String),
    /// Remote capabilities cannot receive the producer
    IncompatibleCapabilities(String),
    /// Router has no codec matching the producer
    UnsupportedCodec(String),
    InvalidParameters(String),
    /// Worker rejected a request
    Request(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::EngineUnavailable => write!(f, "Media engine is not initialized"),
            EngineError::EngineFatal(msg) => write!(f, "Media engine failure: {}", msg),
            EngineError::TransportNotFound(id) => write!(f, "Transport not found: {}", id),
            EngineError::TransportNotConnected(id) => write!(f, "Transport not connected: {}", id),
            EngineError::ProducerNotFound(id) => write!(f, "Producer not found: {}", id),
            EngineError::ConsumerNotFound(id) => write!(f, "Consumer not found: {}", id),
            EngineError::WrongDirection(id) => {
                write!(f, "Transport {} does not support this direction", id)
            }
            EngineError::IncompatibleCapabilities(id) => {
                write!(f, "Cannot consume producer {} with the given capabilities", id)
            }
            EngineError::UnsupportedCodec(mime) => write!(f, "Unsupported codec: {}", mime),
            EngineError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            EngineError::Request(msg) => write!(f, "Media engine request failed: {}", msg),
        }
    }
}

impl Error for EngineError {}

/// Why a resource was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    DtlsClosed,
    TransportClosed,
    ProducerClosed,
    WorkerDied,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Requested => "requested",
            CloseReason::DtlsClosed => "dtls closed",
            CloseReason::TransportClosed => "transport closed",
            CloseReason::ProducerClosed => "producer closed",
            CloseReason::WorkerDied => "worker died",
        }
    }
}

/// Engine notifications
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TransportClosed {
        transport_id: TransportId,
        reason: CloseReason,
    },
    ProducerClosed {
        producer_id: ProducerId,
        transport_id: TransportId,
        reason: CloseReason,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        transport_id: TransportId,
        reason: CloseReason,
    },
    WorkerDied {
        reason: String,
    },
}

/// Direction of a WebRTC transport as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    /// Client sends media (producers)
    Send,
    /// Client receives media (consumers)
    Recv,
}

/// Notifications raised on mediasoup's threads, handled on the runtime
#[derive(Debug)]
pub(crate) enum EngineSignal {
    DtlsState {
        transport_id: TransportId,
        state: DtlsState,
    },
    WorkerDead {
        reason: String,
    },
}

/// Worker and router pair created by `MediaEngine::initialize`
pub struct EngineCore {
    pub worker: EngineWorker,
    pub router: RelayRouter,
}

/// State shared with the signal task
struct EngineShared {
    alive: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
    death: watch::Sender<Option<String>>,
}

impl EngineShared {
    fn mark_dead(&self, core: Option<&EngineCore>, reason: &str) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }
        error!("Media engine worker died: {}", reason);
        if let Some(core) = core {
            core.router.clear();
        }
        let _ = self.events.send(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
        self.death.send_replace(Some(reason.to_string()));
        true
    }
}

/// Process-wide gateway to the media engine
pub struct MediaEngine {
    settings: EngineConfig,
    manager: WorkerManager,
    core: OnceCell<Arc<EngineCore>>,
    shared: Arc<EngineShared>,
    signals: mpsc::UnboundedSender<EngineSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineSignal>>>,
}

impl MediaEngine {
    pub fn new(settings: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (death, _) = watch::channel(None);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            manager: WorkerManager::new(),
            core: OnceCell::new(),
            shared: Arc::new(EngineShared {
                alive: AtomicBool::new(true),
                events,
                death,
            }),
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// Create the worker and router. Concurrent and repeated calls share
    /// the first instance.
    pub async fn initialize(&self) -> Result<Arc<EngineCore>, EngineError> {
        self.ensure_alive()?;
        let core = self
            .core
            .get_or_try_init(|| async {
                let worker =
                    EngineWorker::spawn(&self.manager, &self.settings, self.signals.clone())
                        .await?;
                let router = RelayRouter::create(
                    worker.inner(),
                    &self.settings,
                    self.shared.events.clone(),
                    self.signals.clone(),
                )
                .await?;
                info!("Media engine ready (worker {}, router {})", worker.id, router.id);
                let core = Arc::new(EngineCore { worker, router });
                if let Some(signals) = self.signal_rx.lock().take() {
                    tokio::spawn(run_signals(
                        Arc::downgrade(&core),
                        self.shared.clone(),
                        signals,
                    ));
                }
                Ok::<_, EngineError>(core)
            })
            .await?;
        self.ensure_alive()?;
        Ok(core.clone())
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.shared.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::EngineFatal("worker is dead".to_string()))
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.core.initialized()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    fn router(&self) -> Result<&RelayRouter, EngineError> {
        let core = self.core.get().ok_or(EngineError::EngineUnavailable)?;
        self.ensure_alive()?;
        Ok(&core.router)
    }

    pub fn router_capabilities(&self) -> Result<RtpCapabilitiesFinalized, EngineError> {
        Ok(self.router()?.rtp_capabilities().clone())
    }

    /// Producer parameters for an ingest encoder using the given SSRC
    pub fn ingest_parameters(&self, ssrc: u32) -> Result<IngestParameters, EngineError> {
        ingest_parameters(self.router()?.rtp_capabilities(), ssrc)
    }

    pub async fn create_transport(
        &self,
        direction: TransportDirection,
        session_id: &str,
    ) -> Result<WebRtcTransportInfo, EngineError> {
        let info = self.router()?.create_webrtc_transport(direction).await?;
        info!(
            "Created {:?} transport {} for session {}",
            direction, info.id, session_id
        );
        Ok(info)
    }

    pub async fn create_pipe_transport(
        &self,
        feed_id: &str,
    ) -> Result<PipeTransportInfo, EngineError> {
        let info = self.router()?.create_pipe_transport().await?;
        info!(
            "Created pipe transport {} for feed {} at {}:{}",
            info.id, feed_id, info.ip, info.port
        );
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.router()?.connect_transport(transport_id, dtls).await
    }

    pub async fn create_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        self.router()?.produce(transport_id, kind, rtp_parameters).await
    }

    /// Pure capability predicate; false for unknown producers
    pub fn can_consume(&self, producer_id: &str, remote: &RtpCapabilities) -> bool {
        match self.router() {
            Ok(router) => router.can_consume(producer_id, remote),
            Err(_) => false,
        }
    }

    pub fn authorize_consume(
        &self,
        producer_id: &str,
        remote: &RtpCapabilities,
    ) -> Result<ConsumeGrant, EngineError> {
        self.router()?.authorize_consume(producer_id, remote)
    }

    pub async fn create_consumer(
        &self,
        transport_id: &str,
        grant: ConsumeGrant,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        self.router()?.consume(transport_id, grant, paused).await
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.router()?.resume_consumer(consumer_id).await
    }

    pub fn producer_kind(&self, producer_id: &str) -> Option<MediaKind> {
        self.router().ok()?.producer_kind(producer_id)
    }

    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.router().ok()?.consumer_paused(consumer_id)
    }

    /// True while the engine holds a live object with this id
    pub fn contains(&self, id: &str) -> bool {
        match self.router() {
            Ok(router) => router.contains(id),
            Err(_) => false,
        }
    }

    pub fn close_transport(&self, transport_id: &str) -> bool {
        match self.router() {
            Ok(router) => router.close_transport(transport_id, CloseReason::Requested),
            Err(_) => false,
        }
    }

    pub fn close_producer(&self, producer_id: &str) -> bool {
        match self.router() {
            Ok(router) => router.close_producer(producer_id),
            Err(_) => false,
        }
    }

    pub fn close_consumer(&self, consumer_id: &str) -> bool {
        match self.router() {
            Ok(router) => router.close_consumer(consumer_id),
            Err(_) => false,
        }
    }

    /// DTLS state handler; a closed state closes the transport
    pub fn on_dtls_state(&self, transport_id: &str, state: DtlsState) -> bool {
        match self.router() {
            Ok(router) => router.on_dtls_state(transport_id, state),
            Err(_) => false,
        }
    }

    /// Worker exit handler. Every later call fails with `EngineFatal`.
    pub fn on_worker_dead(&self, reason: &str) -> bool {
        self.shared.mark_dead(self.core.get().map(|c| c.as_ref()), reason)
    }

    pub fn stats(&self) -> RouterStats {
        self.router().map(|r| r.stats()).unwrap_or_default()
    }

    /// Resolves once the worker has died, with the reason
    pub async fn worker_died(&self) -> String {
        let mut rx = self.shared.death.subscribe();
        let result = match rx.wait_for(|d| d.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::from("engine dropped"),
        };
        result
    }
}

async fn run_signals(
    core: Weak<EngineCore>,
    shared: Arc<EngineShared>,
    mut signals: mpsc::UnboundedReceiver<EngineSignal>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };
        match signal {
            EngineSignal::DtlsState { transport_id, state } => {
                if shared.alive.load(Ordering::SeqCst) {
                    core.router.on_dtls_state(&transport_id, state);
                }
            }
            EngineSignal::WorkerDead { reason } => {
                shared.mark_dead(Some(&core), &reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{dtls, engine};
    use std::time::Duration;

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let engine = MediaEngine::new(EngineConfig::default());
        let a = engine.initialize().await.unwrap();
        let b = engine.initialize().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.router.id, b.router.id);
    }

    #[tokio::test]
    async fn concurrent_initialize_creates_one_worker() {
        let engine = Arc::new(MediaEngine::new(EngineConfig::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.initialize().await.unwrap().worker.id.clone() })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn operations_fail_before_initialize() {
        let engine = MediaEngine::new(EngineConfig::default());
        assert!(matches!(
            engine.create_transport(TransportDirection::Send, "s1").await,
            Err(EngineError::EngineUnavailable)
        ));
        assert!(matches!(
            engine.router_capabilities(),
            Err(EngineError::EngineUnavailable)
        ));
    }

    #[tokio::test]
    async fn router_capabilities_cover_configured_codecs() {
        let engine = engine().await;
        let caps = serde_json::to_value(engine.router_capabilities().unwrap()).unwrap();
        let mimes: Vec<&str> = caps["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["mimeType"].as_str())
            .collect();
        for mime in ["audio/opus", "video/VP8", "video/H264"] {
            assert!(mimes.contains(&mime), "missing {}", mime);
        }
    }

    #[tokio::test]
    async fn dtls_closed_signal_closes_transport() {
        let engine = engine().await;
        let mut events = engine.subscribe();
        let send = engine.create_transport(TransportDirection::Send, "s1").await.unwrap();
        engine.connect_transport(&send.id, &dtls()).await.unwrap();

        engine
            .signals
            .send(EngineSignal::DtlsState {
                transport_id: send.id.clone(),
                state: DtlsState::Closed,
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::TransportClosed { transport_id, reason } => {
                assert_eq!(transport_id, send.id);
                assert_eq!(reason, CloseReason::DtlsClosed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!engine.contains(&send.id));
    }

    #[tokio::test]
    async fn worker_death_signal_is_terminal() {
        let engine = Arc::new(engine().await);
        let mut events = engine.subscribe();
        engine.create_transport(TransportDirection::Recv, "s1").await.unwrap();

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.worker_died().await })
        };
        engine
            .signals
            .send(EngineSignal::WorkerDead {
                reason: "crashed".to_string(),
            })
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "crashed");
        assert!(matches!(events.recv().await.unwrap(), EngineEvent::WorkerDied { .. }));
        assert!(!engine.on_worker_dead("again"));
        assert_eq!(engine.stats(), RouterStats::default());
        assert!(matches!(
            engine.create_transport(TransportDirection::Recv, "s1").await,
            Err(EngineError::EngineFatal(_))
        ));
        assert!(matches!(engine.initialize().await, Err(EngineError::EngineFatal(_))));
    }
}
