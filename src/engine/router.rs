//! Router: transports, producers and consumers sharing one codec set
//!
//! Engine objects are mediasoup handles kept in id-keyed tables. Dropping
//! a handle closes the object in the worker. Closing a transport closes
//! its producers and consumers; closing a producer closes its consumers.
//! Each close is reported once on the engine event channel, consumers
//! before their producer and producers before their transport.

use super::{
    CloseReason, ConsumerId, EngineError, EngineEvent, EngineSignal, ProducerId, TransportDirection,
    TransportId,
};
use crate::config::EngineConfig;
use log::{debug, info};
use mediasoup::data_structures::{
    DtlsParameters, DtlsState, IceCandidate, IceParameters, ListenInfo, Protocol,
};
use mediasoup::prelude::*;
use mediasoup::transport::{ConsumeError, ProduceError};
use mediasoup::rtp_parameters::{
    MediaKind, RtpCapabilities, RtpCapabilitiesFinalized, RtpCodecCapability, RtpParameters,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tokio::sync::{broadcast, mpsc};

/// Parameters a remote peer needs to establish a WebRTC transport
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Local RTP ingress used by an ingest encoder
#[derive(Debug, Clone, Serialize)]
pub struct PipeTransportInfo {
    pub id: TransportId,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub producer_paused: bool,
    pub paused: bool,
}

/// Proof that a capability check passed for a producer.
///
/// Only `RelayRouter::authorize_consume` builds one, and creating a
/// consumer uses it up:
///
/// ```compile_fail
/// fn assert_clone<T: Clone>() {}
/// assert_clone::<feedrelay::engine::ConsumeGrant>();
/// ```
#[derive(Debug)]
pub struct ConsumeGrant {
    producer_id: ProducerId,
    producer: mediasoup::producer::ProducerId,
    rtp_capabilities: RtpCapabilities,
}

impl ConsumeGrant {
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }
}

/// Producer parameters for a local encoder feeding the ingest transport
#[derive(Debug, Clone)]
pub struct IngestParameters {
    pub rtp_parameters: RtpParameters,
    pub payload_type: u8,
    pub ssrc: u32,
}

#[derive(Debug, Clone)]
enum TransportKind {
    WebRtc {
        transport: WebRtcTransport,
        direction: TransportDirection,
    },
    Pipe(PlainTransport),
}

struct TransportEntry {
    kind: TransportKind,
    connected: bool,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct ProducerEntry {
    producer: Producer,
    transport_id: TransportId,
    consumers: HashSet<ConsumerId>,
}

struct ConsumerEntry {
    consumer: Consumer,
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Default)]
struct RouterTables {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

/// Handles removed from the tables, dropped once the table lock is released
#[derive(Default)]
struct Released {
    transports: Vec<TransportEntry>,
    producers: Vec<ProducerEntry>,
    consumers: Vec<ConsumerEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

pub struct RelayRouter {
    pub id: String,
    router: Router,
    settings: EngineConfig,
    tables: Mutex<RouterTables>,
    events: broadcast::Sender<EngineEvent>,
    signals: mpsc::UnboundedSender<EngineSignal>,
}

impl RelayRouter {
    pub(crate) async fn create(
        worker: &Worker,
        settings: &EngineConfig,
        events: broadcast::Sender<EngineEvent>,
        signals: mpsc::UnboundedSender<EngineSignal>,
    ) -> Result<Self, EngineError> {
        let codecs = media_codecs(settings)?;
        let router = worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(|e| EngineError::EngineFatal(format!("failed to create router: {}", e)))?;
        Ok(Self {
            id: router.id().to_string(),
            router,
            settings: settings.clone(),
            tables: Mutex::new(RouterTables::default()),
            events,
            signals,
        })
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilitiesFinalized {
        self.router.rtp_capabilities()
    }

    pub fn stats(&self) -> RouterStats {
        let tables = self.tables.lock();
        RouterStats {
            transports: tables.transports.len(),
            producers: tables.producers.len(),
            consumers: tables.consumers.len(),
        }
    }

    /// True while a transport, producer or consumer with this id is live
    pub fn contains(&self, id: &str) -> bool {
        let tables = self.tables.lock();
        tables.transports.contains_key(id)
            || tables.producers.contains_key(id)
            || tables.consumers.contains_key(id)
    }

    fn listen_info(&self, protocol: Protocol) -> Result<ListenInfo, EngineError> {
        let ip = self.settings.listen_ip.parse::<IpAddr>().map_err(|e| {
            EngineError::InvalidParameters(format!("listen ip {}: {}", self.settings.listen_ip, e))
        })?;
        Ok(ListenInfo {
            protocol,
            ip,
            announced_address: self.settings.announced_ip.clone(),
            port: None,
            port_range: Some(self.settings.rtc_min_port..=self.settings.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        })
    }

    fn webrtc_options(&self) -> Result<WebRtcTransportOptions, EngineError> {
        let mut protocols = Vec::new();
        if self.settings.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if self.settings.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        if !self.settings.prefer_udp {
            protocols.reverse();
        }
        let mut protocols = protocols.into_iter();
        let first = protocols
            .next()
            .ok_or_else(|| EngineError::InvalidParameters("no transport protocol enabled".into()))?;
        let mut listen_infos = WebRtcTransportListenInfos::new(self.listen_info(first)?);
        for protocol in protocols {
            listen_infos = listen_infos.insert(self.listen_info(protocol)?);
        }

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.initial_available_outgoing_bitrate =
            self.settings.initial_available_outgoing_bitrate;
        Ok(options)
    }

    pub async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<WebRtcTransportInfo, EngineError> {
        let transport = self
            .router
            .create_webrtc_transport(self.webrtc_options()?)
            .await
            .map_err(|e| EngineError::Request(format!("create transport: {}", e)))?;
        let id = transport.id().to_string();

        let signals = self.signals.clone();
        let watched = id.clone();
        transport
            .on_dtls_state_change(move |state| {
                let _ = signals.send(EngineSignal::DtlsState {
                    transport_id: watched.clone(),
                    state,
                });
            })
            .detach();

        let info = WebRtcTransportInfo {
            id: id.clone(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters().clone(),
        };
        self.tables.lock().transports.insert(
            id,
            TransportEntry {
                kind: TransportKind::WebRtc { transport, direction },
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        Ok(info)
    }

    /// Plain RTP ingress in comedia mode: the worker learns the encoder's
    /// address from the first packet, so no connect step is needed.
    pub async fn create_pipe_transport(&self) -> Result<PipeTransportInfo, EngineError> {
        let mut listen_info = self.listen_info(Protocol::Udp)?;
        listen_info.announced_address = None;
        let mut options = PlainTransportOptions::new(listen_info);
        options.comedia = true;
        options.rtcp_mux = true;

        let transport = self
            .router
            .create_plain_transport(options)
            .await
            .map_err(|e| EngineError::Request(format!("create pipe transport: {}", e)))?;
        let id = transport.id().to_string();
        let info = PipeTransportInfo {
            id: id.clone(),
            ip: self.settings.listen_ip.clone(),
            port: transport.tuple().local_port(),
        };
        self.tables.lock().transports.insert(
            id,
            TransportEntry {
                kind: TransportKind::Pipe(transport),
                connected: true,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls: &DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters has no fingerprints".into(),
            ));
        }
        let transport = {
            let tables = self.tables.lock();
            let entry = tables
                .transports
                .get(transport_id)
                .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
            if entry.connected {
                return Err(EngineError::InvalidParameters(format!(
                    "transport {} already connected",
                    transport_id
                )));
            }
            match &entry.kind {
                TransportKind::WebRtc { transport, .. } => transport.clone(),
                TransportKind::Pipe(_) => return Ok(()),
            }
        };

        transport
            .connect(WebRtcTransportRemoteParameters {
                dtls_parameters: dtls.clone(),
            })
            .await
            .map_err(|e| EngineError::InvalidParameters(e.to_string()))?;

        let mut tables = self.tables.lock();
        let entry = tables
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
        entry.connected = true;
        Ok(())
    }

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters("rtpParameters has no codecs".into()));
        }
        let transport = {
            let tables = self.tables.lock();
            let entry = tables
                .transports
                .get(transport_id)
                .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
            if let TransportKind::WebRtc { direction: TransportDirection::Recv, .. } = entry.kind {
                return Err(EngineError::WrongDirection(transport_id.to_string()));
            }
            if !entry.connected {
                return Err(EngineError::TransportNotConnected(transport_id.to_string()));
            }
            entry.kind.clone()
        };

        let options = ProducerOptions::new(kind, rtp_parameters);
        let produced = match &transport {
            TransportKind::WebRtc { transport, .. } => transport.produce(options).await,
            TransportKind::Pipe(transport) => transport.produce(options).await,
        };
        let producer = produced.map_err(produce_error)?;
        let id = producer.id().to_string();
        let info = ProducerInfo {
            id: id.clone(),
            kind: producer.kind(),
            rtp_parameters: producer.rtp_parameters().clone(),
        };

        let mut tables = self.tables.lock();
        let entry = match tables.transports.get_mut(transport_id) {
            Some(entry) => entry,
            None => return Err(EngineError::TransportNotFound(transport_id.to_string())),
        };
        entry.producers.insert(id.clone());
        tables.producers.insert(
            id,
            ProducerEntry {
                producer,
                transport_id: transport_id.to_string(),
                consumers: HashSet::new(),
            },
        );
        Ok(info)
    }

    pub fn producer_kind(&self, producer_id: &str) -> Option<MediaKind> {
        self.tables.lock().producers.get(producer_id).map(|p| p.producer.kind())
    }

    pub fn can_consume(&self, producer_id: &str, remote: &RtpCapabilities) -> bool {
        let producer = match self.tables.lock().producers.get(producer_id) {
            Some(entry) => entry.producer.id(),
            None => return false,
        };
        self.router.can_consume(&producer, remote)
    }

    /// Run the capability check and, when it passes, hand out a grant
    pub fn authorize_consume(
        &self,
        producer_id: &str,
        remote: &RtpCapabilities,
    ) -> Result<ConsumeGrant, EngineError> {
        let producer = match self.tables.lock().producers.get(producer_id) {
            Some(entry) => entry.producer.id(),
            None => return Err(EngineError::ProducerNotFound(producer_id.to_string())),
        };
        if !self.router.can_consume(&producer, remote) {
            return Err(EngineError::IncompatibleCapabilities(producer_id.to_string()));
        }
        Ok(ConsumeGrant {
            producer_id: producer_id.to_string(),
            producer,
            rtp_capabilities: remote.clone(),
        })
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        grant: ConsumeGrant,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        let transport = {
            let tables = self.tables.lock();
            let entry = tables
                .transports
                .get(transport_id)
                .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
            match &entry.kind {
                TransportKind::WebRtc { transport, direction: TransportDirection::Recv } => {
                    transport.clone()
                }
                _ => return Err(EngineError::WrongDirection(transport_id.to_string())),
            }
        };

        let ConsumeGrant { producer_id, producer, rtp_capabilities } = grant;
        let mut options = ConsumerOptions::new(producer, rtp_capabilities);
        options.paused = paused;
        let consumer = transport.consume(options).await.map_err(|e| match e {
            ConsumeError::ProducerNotFound(_) => EngineError::ProducerNotFound(producer_id.clone()),
            ConsumeError::BadConsumerRtpParameters(_) => {
                EngineError::IncompatibleCapabilities(producer_id.clone())
            }
            other => EngineError::Request(other.to_string()),
        })?;

        let id = consumer.id().to_string();
        let info = ConsumerInfo {
            id: id.clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            producer_paused: consumer.producer_paused(),
            paused: consumer.paused(),
        };

        let mut tables = self.tables.lock();
        if !tables.transports.contains_key(transport_id) {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }
        match tables.producers.get_mut(&producer_id) {
            Some(entry) => {
                entry.consumers.insert(id.clone());
            }
            None => return Err(EngineError::ProducerNotFound(producer_id)),
        }
        if let Some(entry) = tables.transports.get_mut(transport_id) {
            entry.consumers.insert(id.clone());
        }
        tables.consumers.insert(
            id,
            ConsumerEntry {
                consumer,
                transport_id: transport_id.to_string(),
                producer_id,
            },
        );
        Ok(info)
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let consumer = match self.tables.lock().consumers.get(consumer_id) {
            Some(entry) => entry.consumer.clone(),
            None => return Err(EngineError::ConsumerNotFound(consumer_id.to_string())),
        };
        consumer
            .resume()
            .await
            .map_err(|e| EngineError::Request(format!("resume consumer: {}", e)))
    }

    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.tables.lock().consumers.get(consumer_id).map(|c| c.consumer.paused())
    }

    /// Handle a DTLS state change. A closed state closes the transport.
    pub fn on_dtls_state(&self, transport_id: &str, state: DtlsState) -> bool {
        debug!("Transport {} dtls state {:?}", transport_id, state);
        if matches!(state, DtlsState::Closed) {
            return self.close_transport(transport_id, CloseReason::DtlsClosed);
        }
        false
    }

    /// Close a transport and everything bound to it. No-op for unknown ids.
    pub fn close_transport(&self, transport_id: &str, reason: CloseReason) -> bool {
        let mut events = Vec::new();
        let mut released = Released::default();
        {
            let mut tables = self.tables.lock();
            let entry = match tables.transports.remove(transport_id) {
                Some(entry) => entry,
                None => return false,
            };
            for consumer_id in &entry.consumers {
                remove_consumer(
                    &mut tables,
                    consumer_id,
                    CloseReason::TransportClosed,
                    &mut events,
                    &mut released,
                );
            }
            for producer_id in &entry.producers {
                remove_producer(
                    &mut tables,
                    producer_id,
                    CloseReason::TransportClosed,
                    &mut events,
                    &mut released,
                );
            }
            events.push(EngineEvent::TransportClosed {
                transport_id: transport_id.to_string(),
                reason,
            });
            released.transports.push(entry);
        }
        drop(released);
        self.emit(events);
        true
    }

    pub fn close_producer(&self, producer_id: &str) -> bool {
        let mut events = Vec::new();
        let mut released = Released::default();
        {
            let mut tables = self.tables.lock();
            if !remove_producer(
                &mut tables,
                producer_id,
                CloseReason::Requested,
                &mut events,
                &mut released,
            ) {
                return false;
            }
        }
        drop(released);
        self.emit(events);
        true
    }

    pub fn close_consumer(&self, consumer_id: &str) -> bool {
        let mut events = Vec::new();
        let mut released = Released::default();
        {
            let mut tables = self.tables.lock();
            if !remove_consumer(
                &mut tables,
                consumer_id,
                CloseReason::Requested,
                &mut events,
                &mut released,
            ) {
                return false;
            }
        }
        drop(released);
        self.emit(events);
        true
    }

    /// Drop every handle without emitting events (worker death)
    pub(crate) fn clear(&self) {
        let tables = std::mem::take(&mut *self.tables.lock());
        info!(
            "Router {} dropped {} transports, {} producers, {} consumers",
            self.id,
            tables.transports.len(),
            tables.producers.len(),
            tables.consumers.len()
        );
    }

    fn emit(&self, events: Vec<EngineEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

fn remove_consumer(
    tables: &mut RouterTables,
    consumer_id: &str,
    reason: CloseReason,
    events: &mut Vec<EngineEvent>,
    released: &mut Released,
) -> bool {
    let entry = match tables.consumers.remove(consumer_id) {
        Some(entry) => entry,
        None => return false,
    };
    if let Some(producer) = tables.producers.get_mut(&entry.producer_id) {
        producer.consumers.remove(consumer_id);
    }
    if let Some(transport) = tables.transports.get_mut(&entry.transport_id) {
        transport.consumers.remove(consumer_id);
    }
    events.push(EngineEvent::ConsumerClosed {
        consumer_id: consumer_id.to_string(),
        producer_id: entry.producer_id.clone(),
        transport_id: entry.transport_id.clone(),
        reason,
    });
    released.consumers.push(entry);
    true
}

fn remove_producer(
    tables: &mut RouterTables,
    producer_id: &str,
    reason: CloseReason,
    events: &mut Vec<EngineEvent>,
    released: &mut Released,
) -> bool {
    let entry = match tables.producers.remove(producer_id) {
        Some(entry) => entry,
        None => return false,
    };
    if let Some(transport) = tables.transports.get_mut(&entry.transport_id) {
        transport.producers.remove(producer_id);
    }
    for consumer_id in &entry.consumers {
        remove_consumer(tables, consumer_id, CloseReason::ProducerClosed, events, released);
    }
    events.push(EngineEvent::ProducerClosed {
        producer_id: producer_id.to_string(),
        transport_id: entry.transport_id.clone(),
        reason,
    });
    released.producers.push(entry);
    true
}

fn produce_error(e: ProduceError) -> EngineError {
    match e {
        ProduceError::FailedRtpParametersMapping(e) => EngineError::UnsupportedCodec(e.to_string()),
        ProduceError::IncorrectRtpParameters(e) => EngineError::InvalidParameters(e.to_string()),
        other => EngineError::Request(other.to_string()),
    }
}

/// Router codec set from the configured codecs
pub(crate) fn media_codecs(settings: &EngineConfig) -> Result<Vec<RtpCodecCapability>, EngineError> {
    settings
        .media_codecs
        .iter()
        .map(|codec| {
            serde_json::to_value(codec)
                .and_then(serde_json::from_value::<RtpCodecCapability>)
                .map_err(|e| {
                    EngineError::InvalidParameters(format!("media codec {}: {}", codec.mime_type, e))
                })
        })
        .collect()
}

fn is_media_video(codec: &Value) -> bool {
    let mime = codec["mimeType"].as_str().unwrap_or_default().to_ascii_lowercase();
    codec["kind"] == "video" && mime.starts_with("video/") && !mime.ends_with("/rtx")
}

/// Producer parameters for an encoder sending to the ingest transport.
/// Prefers the router's H264 codec, else its first video codec.
pub fn ingest_parameters(
    capabilities: &RtpCapabilitiesFinalized,
    ssrc: u32,
) -> Result<IngestParameters, EngineError> {
    let capabilities = serde_json::to_value(capabilities)
        .map_err(|e| EngineError::InvalidParameters(format!("router capabilities: {}", e)))?;
    let codecs = capabilities["codecs"].as_array().cloned().unwrap_or_default();
    let codec = codecs
        .iter()
        .filter(|c| is_media_video(c))
        .find(|c| {
            c["mimeType"]
                .as_str()
                .is_some_and(|m| m.eq_ignore_ascii_case("video/H264"))
        })
        .or_else(|| codecs.iter().find(|c| is_media_video(c)))
        .ok_or_else(|| EngineError::UnsupportedCodec("router has no video codec".into()))?;
    let payload_type = codec["preferredPayloadType"]
        .as_u64()
        .and_then(|pt| u8::try_from(pt).ok())
        .ok_or_else(|| EngineError::InvalidParameters("codec without payload type".into()))?;

    let parameters = json!({
        "codecs": [{
            "mimeType": codec["mimeType"],
            "payloadType": payload_type,
            "clockRate": codec["clockRate"],
            "parameters": codec.get("parameters").cloned().unwrap_or_else(|| json!({})),
            "rtcpFeedback": [],
        }],
        "headerExtensions": [],
        "encodings": [{ "ssrc": ssrc }],
        "rtcp": { "cname": format!("ingest-{}", ssrc), "reducedSize": true },
    });
    let rtp_parameters = serde_json::from_value(parameters)
        .map_err(|e| EngineError::InvalidParameters(format!("ingest parameters: {}", e)))?;
    Ok(IngestParameters {
        rtp_parameters,
        payload_type,
        ssrc,
    })
}
