//! Producer/consumer pairing
//!
//! Producers need a connected send transport. Consumers are only created
//! after the engine's capability check passes, and video consumers start
//! paused until the client sends `resume`.

use super::session::{feed_key, ClientSession, Role};
use super::transport::TransportState;
use super::SignalingError;
use crate::engine::{
    ConsumerId, ConsumerInfo, EngineError, MediaEngine, MediaKind, ProducerId, ProducerInfo,
    RtpCapabilities, RtpParameters, TransportId,
};
use log::info;

#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub feed_id: Option<String>,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub feed_id: Option<String>,
    pub paused: bool,
    pub closed: bool,
}

/// Video starts paused so the viewer can finish local setup first
pub fn initially_paused(kind: MediaKind) -> bool {
    matches!(kind, MediaKind::Video)
}

pub async fn produce(
    engine: &MediaEngine,
    session: &mut ClientSession,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    feed_id: Option<String>,
) -> Result<ProducerInfo, SignalingError> {
    session.ensure_open()?;
    if let Some(existing) = session.producer.as_ref().filter(|p| !p.closed) {
        return Err(SignalingError::Conflict(format!(
            "Session already has producer {}",
            existing.id
        )));
    }

    let transport = session
        .producer_transport
        .as_ref()
        .ok_or_else(|| SignalingError::NotFound("No producer transport".to_string()))?;
    match transport.state() {
        TransportState::Connected => {}
        TransportState::Closed => {
            return Err(SignalingError::TransportState(format!(
                "Transport {} is closed",
                transport.id
            )))
        }
        _ => return Err(EngineError::TransportNotConnected(transport.id.clone()).into()),
    }
    let transport_id = transport.id.clone();

    let info = engine.create_producer(&transport_id, kind, rtp_parameters).await?;
    session.set_role(Role::Producer);
    session.producer = Some(ProducerHandle {
        id: info.id.clone(),
        kind,
        transport_id,
        feed_id,
        closed: false,
    });
    info!("Session {} producing {} ({:?})", session.id, info.id, kind);
    Ok(info)
}

pub async fn consume(
    engine: &MediaEngine,
    session: &mut ClientSession,
    producer_id: &str,
    rtp_capabilities: &RtpCapabilities,
    feed_id: Option<String>,
) -> Result<ConsumerInfo, SignalingError> {
    session.ensure_open()?;
    let transport = session
        .consumer_transport_for(feed_id.as_deref())
        .ok_or_else(|| SignalingError::NotFound("No consumer transport".to_string()))?;
    if transport.is_closed() {
        return Err(SignalingError::TransportState(format!(
            "Transport {} is closed",
            transport.id
        )));
    }
    let transport_id = transport.id.clone();

    // The grant only exists when the capability check passed
    let grant = engine.authorize_consume(producer_id, rtp_capabilities)?;
    let kind = engine
        .producer_kind(producer_id)
        .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;
    let paused = initially_paused(kind);
    let info = engine.create_consumer(&transport_id, grant, paused).await?;

    let key = feed_key(feed_id.as_deref()).to_string();
    let handle = ConsumerHandle {
        id: info.id.clone(),
        producer_id: producer_id.to_string(),
        transport_id,
        kind,
        feed_id,
        paused: info.paused,
        closed: false,
    };
    if let Some(mut old) = session.consumers.insert(key, handle) {
        if !old.closed {
            old.closed = true;
            engine.close_consumer(&old.id);
        }
    }
    session.set_role(Role::Consumer);
    info!(
        "Session {} consuming {} via {} (paused: {})",
        session.id, producer_id, info.id, info.paused
    );
    Ok(info)
}

/// Unpause a consumer picked by id, else by feed id
pub async fn resume(
    engine: &MediaEngine,
    session: &mut ClientSession,
    consumer_id: Option<&str>,
    feed_id: Option<&str>,
) -> Result<ConsumerId, SignalingError> {
    session.ensure_open()?;
    let handle = match consumer_id {
        Some(id) => session.consumers.values_mut().find(|c| c.id == id),
        None => session.consumers.get_mut(feed_key(feed_id)),
    }
    .filter(|c| !c.closed)
    .ok_or_else(|| SignalingError::NotFound("No consumer to resume".to_string()))?;

    engine.resume_consumer(&handle.id).await?;
    handle.paused = false;
    Ok(handle.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{client_capabilities, dtls, engine, producer_parameters};
    use crate::engine::TransportDirection;
    use crate::webrtc::transport::{connect_transport, create_transport};

    const VP8: &str = "video/VP8";

    async fn publisher(engine: &MediaEngine, kind: MediaKind, mime: &str) -> (ClientSession, String) {
        let mut session = ClientSession::new("pub".to_string());
        create_transport(engine, &mut session, TransportDirection::Send, None)
            .await
            .unwrap();
        connect_transport(engine, &mut session, TransportDirection::Send, None, None, &dtls())
            .await
            .unwrap();
        let params = producer_parameters(engine, mime, 1);
        let info = produce(engine, &mut session, kind, params, None).await.unwrap();
        (session, info.id)
    }

    #[tokio::test]
    async fn produce_needs_connected_transport() {
        let engine = engine().await;
        let mut session = ClientSession::new("s".to_string());
        assert!(matches!(
            produce(&engine, &mut session, MediaKind::Video, producer_parameters(&engine, VP8, 1), None).await,
            Err(SignalingError::NotFound(_))
        ));
        create_transport(&engine, &mut session, TransportDirection::Send, None)
            .await
            .unwrap();
        assert!(matches!(
            produce(&engine, &mut session, MediaKind::Video, producer_parameters(&engine, VP8, 1), None).await,
            Err(SignalingError::Engine(EngineError::TransportNotConnected(_)))
        ));
    }

    #[tokio::test]
    async fn video_consumer_starts_paused_until_resume() {
        let engine = engine().await;
        let (_publisher, producer_id) = publisher(&engine, MediaKind::Video, VP8).await;

        let mut viewer = ClientSession::new("view".to_string());
        create_transport(&engine, &mut viewer, TransportDirection::Recv, None)
            .await
            .unwrap();
        let caps = client_capabilities(&engine, None);
        let info = consume(&engine, &mut viewer, &producer_id, &caps, None)
            .await
            .unwrap();
        assert!(info.paused);
        assert_eq!(engine.consumer_paused(&info.id), Some(true));

        let resumed = resume(&engine, &mut viewer, None, None).await.unwrap();
        assert_eq!(resumed, info.id);
        assert_eq!(engine.consumer_paused(&info.id), Some(false));
    }

    #[tokio::test]
    async fn audio_consumer_is_not_paused() {
        let engine = engine().await;
        let (_publisher, producer_id) = publisher(&engine, MediaKind::Audio, "audio/opus").await;

        let mut viewer = ClientSession::new("view".to_string());
        create_transport(&engine, &mut viewer, TransportDirection::Recv, None)
            .await
            .unwrap();
        let caps = client_capabilities(&engine, None);
        let info = consume(&engine, &mut viewer, &producer_id, &caps, None)
            .await
            .unwrap();
        assert!(!info.paused);
    }

    #[tokio::test]
    async fn incompatible_viewer_gets_no_consumer() {
        let engine = engine().await;
        let (_publisher, producer_id) = publisher(&engine, MediaKind::Video, "video/H264").await;

        let mut viewer = ClientSession::new("view".to_string());
        create_transport(&engine, &mut viewer, TransportDirection::Recv, None)
            .await
            .unwrap();
        let caps = client_capabilities(&engine, Some(VP8));

        assert!(!engine.can_consume(&producer_id, &caps));
        assert!(matches!(
            consume(&engine, &mut viewer, &producer_id, &caps, None).await,
            Err(SignalingError::Engine(EngineError::IncompatibleCapabilities(_)))
        ));
        assert!(viewer.consumers.is_empty());
        assert_eq!(engine.stats().consumers, 0);
    }

    #[tokio::test]
    async fn replacing_a_consumer_closes_the_old_one() {
        let engine = engine().await;
        let (_publisher, producer_id) = publisher(&engine, MediaKind::Video, VP8).await;

        let mut viewer = ClientSession::new("view".to_string());
        create_transport(&engine, &mut viewer, TransportDirection::Recv, None)
            .await
            .unwrap();
        let caps = client_capabilities(&engine, None);
        let first = consume(&engine, &mut viewer, &producer_id, &caps, None).await.unwrap();
        let second = consume(&engine, &mut viewer, &producer_id, &caps, None).await.unwrap();

        assert!(!engine.contains(&first.id));
        assert!(engine.contains(&second.id));
        assert_eq!(viewer.consumers.len(), 1);
    }

    #[tokio::test]
    async fn second_producer_in_session_is_rejected() {
        let engine = engine().await;
        let (mut session, _producer_id) = publisher(&engine, MediaKind::Video, VP8).await;
        assert!(matches!(
            produce(&engine, &mut session, MediaKind::Video, producer_parameters(&engine, VP8, 2), None).await,
            Err(SignalingError::Conflict(_))
        ));
    }
}
