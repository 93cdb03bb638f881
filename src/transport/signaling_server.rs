//! Signaling server
//!
//! One task per WebSocket connection. Messages from a connection are
//! handled strictly in arrival order; engine and ingest calls are awaited
//! without blocking other connections.

use crate::engine::{MediaKind, TransportDirection};
use crate::feed::{validate_feed_id, FeedError};
use crate::web::broadcast::ConnectionState;
use crate::web::SharedState;
use crate::webrtc::pairing;
use crate::webrtc::signaling::{ParseError, SignalingParser, Subscribed, TransportCreated};
use crate::webrtc::transport::{close_transport, connect_transport, create_transport};
use crate::webrtc::session::{Resource, ResourceOwner};
use crate::webrtc::{ClientSession, Request, ServerMessage, SessionId, SignalingError};
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Handle a signaling WebSocket connection
pub async fn handle_signaling_connection(socket: WebSocket, state: Arc<SharedState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let max_sessions = state.config.server.max_sessions;
    let Some((session_id, session)) = state.sessions.try_create(max_sessions) else {
        warn!("Rejecting connection: {} sessions open", max_sessions);
        if let Ok(text) = ServerMessage::error("Server is full").to_json() {
            let _ = ws_sender.send(Message::Text(text.into())).await;
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };
    let (tx, mut rx) = mpsc::channel::<String>(state.config.server.outbound_queue);
    state.bus.register(&session_id, tx.clone());
    state.refresh_gauges();

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                let request = match SignalingParser::parse(text_str) {
                    Ok(request) => request,
                    Err(ParseError::Malformed(reason)) => {
                        warn!("Dropping malformed message from {}: {}", session_id, reason);
                        continue;
                    }
                    Err(ParseError::Rejected(e)) => {
                        warn!("Rejected message from {}: {}", session_id, e);
                        state.metrics.record_message("invalid", false);
                        reply(&tx, &ServerMessage::from(&e)).await;
                        continue;
                    }
                };

                let kind = request.type_name();
                debug!("Session {} -> {}", session_id, kind);
                let outcome = {
                    let mut session = session.lock().await;
                    dispatch(&state, &session_id, &mut session, request).await
                };
                match outcome {
                    Ok(Some(response)) => {
                        state.metrics.record_message(kind, true);
                        reply(&tx, &response).await;
                    }
                    Ok(None) => state.metrics.record_message(kind, true),
                    Err(e) => {
                        state.metrics.record_message(kind, false);
                        if e.is_fatal() {
                            error!("{} from session {} hit a fatal engine error: {}", kind, session_id, e);
                        } else {
                            warn!("{} from session {} failed: {}", kind, session_id, e);
                        }
                        reply(&tx, &ServerMessage::from(&e)).await;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary message on signaling channel");
            }
            Ok(Message::Close(_)) => {
                info!("Signaling connection {} closed by client", session_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", session_id, e);
                break;
            }
            _ => {}
        }
    }

    state.bus.set_state(&session_id, ConnectionState::Closing);
    close_session(&state, &session_id).await;
    state.bus.set_state(&session_id, ConnectionState::Closed);
    state.bus.unregister(&session_id);
    drop(tx);
    send_task.abort();
    state.refresh_gauges();

    info!("Signaling connection handler finished (session: {})", session_id);
}

async fn reply(tx: &mpsc::Sender<String>, message: &ServerMessage) {
    match message.to_json() {
        Ok(text) => {
            let _ = tx.send(text).await;
        }
        Err(e) => error!("Failed to encode {}: {}", message.type_name(), e),
    }
}

/// Release everything the session owns. Feed bindings go away through the
/// engine's producer-closed notifications.
pub async fn close_session(state: &SharedState, session_id: &str) {
    if let Some(report) = state.sessions.teardown(&state.engine, session_id).await {
        debug!("Session {} teardown: {:?}", session_id, report);
    }
}

/// Handle one request. `Ok(None)` means there is nothing to send back.
pub async fn dispatch(
    state: &SharedState,
    session_id: &SessionId,
    session: &mut ClientSession,
    request: Request,
) -> Result<Option<ServerMessage>, SignalingError> {
    let engine = &state.engine;
    session.apply_notices();
    let response = match request {
        Request::GetRouterRtpCapabilities {} => {
            ServerMessage::RouterRtpCapabilities(engine.router_capabilities()?)
        }

        Request::CreateProducerTransport {} => {
            let info = create_transport(engine, session, TransportDirection::Send, None).await?;
            state.sessions.index(
                &info.id,
                ResourceOwner::new(session_id, Resource::Transport, None),
            );
            ServerMessage::ProducerTransportCreated(TransportCreated { info, feed_id: None })
        }

        Request::ConnectProducerTransport { dtls_parameters } => {
            let transport_id = connect_transport(
                engine,
                session,
                TransportDirection::Send,
                None,
                None,
                &dtls_parameters,
            )
            .await?;
            ServerMessage::ProducerConnected { transport_id }
        }

        Request::Produce {
            kind,
            rtp_parameters,
            feed_id,
        } => {
            if let Some(feed_id) = feed_id.as_deref() {
                state.feeds.check_publishable(feed_id)?;
            }
            let info =
                pairing::produce(engine, session, kind, rtp_parameters, feed_id.clone()).await?;
            state.sessions.index(
                &info.id,
                ResourceOwner::new(session_id, Resource::Producer, feed_id.as_deref()),
            );

            if let Some(feed) = feed_id.as_deref() {
                if let Err(e) = state
                    .feeds
                    .bind_session_producer(feed, session_id, &info.id)
                    .await
                {
                    engine.close_producer(&info.id);
                    session.on_producer_closed(&info.id);
                    return Err(e.into());
                }
                state.refresh_gauges();
            }

            state.broadcast_except(
                session_id,
                &ServerMessage::NewProducer {
                    producer_id: info.id.clone(),
                    kind: info.kind,
                    feed_id: feed_id.clone(),
                },
            );
            ServerMessage::ProducerCreated {
                id: info.id,
                kind: info.kind,
                feed_id,
            }
        }

        Request::CreateConsumerTransport { feed_id } => {
            if let Some(feed_id) = feed_id.as_deref() {
                validate_feed_id(feed_id)?;
            }
            let info =
                create_transport(engine, session, TransportDirection::Recv, feed_id.clone())
                    .await?;
            state.sessions.index(
                &info.id,
                ResourceOwner::new(session_id, Resource::Transport, feed_id.as_deref()),
            );
            ServerMessage::ConsumerTransportCreated(TransportCreated { info, feed_id })
        }

        Request::ConnectConsumerTransport {
            dtls_parameters,
            transport_id,
            feed_id,
        } => {
            let transport_id = connect_transport(
                engine,
                session,
                TransportDirection::Recv,
                transport_id.as_deref(),
                feed_id.as_deref(),
                &dtls_parameters,
            )
            .await?;
            ServerMessage::ConsumerTransportConnected { transport_id }
        }

        Request::Consume {
            rtp_capabilities,
            producer_id,
            feed_id,
        } => {
            let producer_id = match (producer_id, feed_id.as_deref()) {
                (Some(id), _) => id,
                (None, Some(feed)) => {
                    validate_feed_id(feed)?;
                    state
                        .feeds
                        .producer_for(feed)
                        .ok_or_else(|| FeedError::NotFound(feed.to_string()))?
                }
                (None, None) => {
                    return Err(SignalingError::Validation(
                        "consume requires producerId or feedId".to_string(),
                    ))
                }
            };
            let info = pairing::consume(
                engine,
                session,
                &producer_id,
                &rtp_capabilities,
                feed_id.clone(),
            )
            .await?;
            state.sessions.index(
                &info.id,
                ResourceOwner::new(
                    session_id,
                    Resource::Consumer { producer_id: info.producer_id.clone() },
                    feed_id.as_deref(),
                ),
            );
            ServerMessage::Subscribed(Subscribed {
                id: info.id,
                producer_id: info.producer_id,
                kind: info.kind,
                rtp_parameters: info.rtp_parameters,
                consumer_type: "simple",
                producer_paused: info.producer_paused,
                paused: info.paused,
                feed_id,
            })
        }

        Request::Resume {
            consumer_id,
            feed_id,
        } => {
            let consumer_id =
                pairing::resume(engine, session, consumer_id.as_deref(), feed_id.as_deref())
                    .await?;
            ServerMessage::Resumed { consumer_id }
        }

        Request::CloseTransport { transport_id } => {
            if !session.owns_transport(&transport_id) {
                return Err(SignalingError::NotFound(format!(
                    "No transport {}",
                    transport_id
                )));
            }
            state.sessions.unindex(&transport_id);
            close_transport(engine, session, &transport_id, None);
            ServerMessage::TransportClosed { transport_id }
        }

        Request::StartFeed { feed_id } => {
            let started = state.feeds.start(&feed_id).await?;
            state.refresh_gauges();
            let kind = engine
                .producer_kind(&started.producer_id)
                .unwrap_or(MediaKind::Video);
            state.broadcast_except(
                session_id,
                &ServerMessage::NewProducer {
                    producer_id: started.producer_id.clone(),
                    kind,
                    feed_id: Some(started.feed_id.clone()),
                },
            );
            ServerMessage::FeedStarted {
                feed_id: started.feed_id,
                producer_id: started.producer_id,
            }
        }

        Request::StopFeed { feed_id } => {
            let stopped = state.feeds.stop(&feed_id).await?;
            state.refresh_gauges();
            let message = ServerMessage::FeedStopped {
                feed_id: stopped.feed_id,
                reason: stopped.reason,
            };
            state.broadcast_except(session_id, &message);
            message
        }

        Request::GetFeeds {} => ServerMessage::Feeds(state.feeds.feed_ids()),

        Request::SubscribeFeed { feed_id } => {
            validate_feed_id(&feed_id)?;
            let producer_id = state
                .feeds
                .producer_for(&feed_id)
                .ok_or_else(|| FeedError::NotFound(feed_id.clone()))?;
            let kind = engine
                .producer_kind(&producer_id)
                .ok_or_else(|| FeedError::NotFound(feed_id.clone()))?;
            ServerMessage::NewProducer {
                producer_id,
                kind,
                feed_id: Some(feed_id),
            }
        }

        Request::VideoFrame { feed_id, frame } => {
            validate_feed_id(&feed_id)?;
            let encoded = frame.strip_prefix(JPEG_DATA_URL_PREFIX).unwrap_or(&frame);
            let jpeg = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| SignalingError::Validation("Invalid frame encoding".to_string()))?;

            let offer = state.feeds.route_frame(&feed_id, Bytes::from(jpeg));
            if offer.dropped() {
                state.metrics.frames_dropped_total.inc();
                debug!("Frame for feed {} not queued for encoding: {:?}", feed_id, offer);
            }
            state.broadcast_except(session_id, &ServerMessage::video_frame(&feed_id, encoded));
            return Ok(None);
        }

        Request::Ping { timestamp } => ServerMessage::Pong {
            timestamp: timestamp.unwrap_or_else(now_millis),
        },
    };
    Ok(Some(response))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::testing::{client_capabilities, dtls};

    async fn state() -> SharedState {
        let (state, _events) = SharedState::new(Config::default()).unwrap();
        state.engine.initialize().await.unwrap();
        state
    }

    async fn run(state: &SharedState, id: &SessionId, request: Request) -> Result<Option<ServerMessage>, SignalingError> {
        let session = state.sessions.get(id).unwrap();
        let mut session = session.lock().await;
        dispatch(state, id, &mut session, request).await
    }

    #[tokio::test]
    async fn capabilities_and_ping() {
        let state = state().await;
        let (id, _session) = state.sessions.create();

        let caps = match run(&state, &id, Request::GetRouterRtpCapabilities {}).await.unwrap() {
            Some(ServerMessage::RouterRtpCapabilities(c)) => serde_json::to_value(c).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let mimes: Vec<&str> = caps["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["mimeType"].as_str())
            .collect();
        assert!(mimes.contains(&"video/H264"));
        assert!(mimes.contains(&"audio/opus"));

        let pong = run(&state, &id, Request::Ping { timestamp: Some(42) }).await.unwrap();
        assert!(matches!(pong, Some(ServerMessage::Pong { timestamp: 42 })));
    }

    #[tokio::test]
    async fn stop_unknown_feed_is_not_found() {
        let state = state().await;
        let (id, _session) = state.sessions.create();
        let err = run(&state, &id, Request::StopFeed { feed_id: "feed1".into() })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No active feed for feedId: feed1");
    }

    #[tokio::test]
    async fn consume_needs_a_target() {
        let state = state().await;
        let (id, _session) = state.sessions.create();
        let caps = client_capabilities(&state.engine, None);
        let err = run(
            &state,
            &id,
            Request::Consume { rtp_capabilities: caps, producer_id: None, feed_id: None },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::Validation(_)));
    }

    #[tokio::test]
    async fn close_transport_of_other_session_is_rejected() {
        let state = state().await;
        let (a, _sa) = state.sessions.create();
        let (b, _sb) = state.sessions.create();
        let created = run(&state, &a, Request::CreateProducerTransport {}).await.unwrap();
        let transport_id = match created {
            Some(ServerMessage::ProducerTransportCreated(t)) => t.info.id,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            run(&state, &b, Request::CloseTransport { transport_id: transport_id.clone() }).await,
            Err(SignalingError::NotFound(_))
        ));
        assert!(state.sessions.owner_of(&transport_id).is_some());
        let closed = run(&state, &a, Request::CloseTransport { transport_id: transport_id.clone() })
            .await
            .unwrap();
        assert!(matches!(closed, Some(ServerMessage::TransportClosed { .. })));
        assert!(state.sessions.owner_of(&transport_id).is_none());
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let state = state().await;
        let (id, _session) = state.sessions.create();
        let transport_id = match run(&state, &id, Request::CreateProducerTransport {}).await.unwrap() {
            Some(ServerMessage::ProducerTransportCreated(t)) => t.info.id,
            other => panic!("unexpected {:?}", other),
        };
        run(&state, &id, Request::CloseTransport { transport_id }).await.unwrap();
        assert!(run(
            &state,
            &id,
            Request::ConnectProducerTransport { dtls_parameters: dtls() }
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn video_frame_is_broadcast_to_others() {
        let state = state().await;
        let (sender, _s) = state.sessions.create();
        let (viewer, _v) = state.sessions.create();
        let (tx_s, mut rx_s) = mpsc::channel(8);
        let (tx_v, mut rx_v) = mpsc::channel(8);
        state.bus.register(&sender, tx_s);
        state.bus.register(&viewer, tx_v);

        let frame = base64::engine::general_purpose::STANDARD.encode([0xffu8, 0xd8, 0xff]);
        let out = run(
            &state,
            &sender,
            Request::VideoFrame { feed_id: "cam".into(), frame: frame.clone() },
        )
        .await
        .unwrap();
        assert!(out.is_none());
        assert!(rx_s.try_recv().is_err());
        let msg: serde_json::Value = serde_json::from_str(&rx_v.try_recv().unwrap()).unwrap();
        assert_eq!(msg["type"], "videoFrame");
        assert_eq!(msg["data"]["feedId"], "cam");
        assert_eq!(
            msg["data"]["frame"],
            format!("data:image/jpeg;base64,{}", frame)
        );
        // No ingest pipeline for "cam"
        assert_eq!(state.metrics.frames_dropped_total.get(), 1);

        state.bus.set_state(&viewer, ConnectionState::Closed);
        run(&state, &sender, Request::VideoFrame { feed_id: "cam".into(), frame })
            .await
            .unwrap();
        assert!(rx_v.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_frame_encoding_is_a_validation_error() {
        let state = state().await;
        let (id, _s) = state.sessions.create();
        let err = run(
            &state,
            &id,
            Request::VideoFrame { feed_id: "cam".into(), frame: "***".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::Validation(_)));
    }
}
