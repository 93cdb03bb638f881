//! Event pumps
//!
//! Background tasks that turn engine notifications, ingest exits and
//! captured frames into session updates and client messages.
//!
//! The engine pump never waits on a session lock: closes are queued in the
//! owning session's mailbox. When the pump falls behind the broadcast
//! channel, it rebuilds what it missed from the engine's live objects.

use crate::engine::{CloseReason, EngineEvent, ProducerId};
use crate::ingest::{CapturedFrame, IngestEvents, IngestExit};
use crate::web::SharedState;
use crate::webrtc::session::{Resource, ResourceOwner, SessionNotice};
use crate::webrtc::ServerMessage;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Spawn every pump. Call before the engine is initialized so no
/// notification is missed.
pub fn spawn_event_pumps(state: Arc<SharedState>, ingest: IngestEvents) -> Vec<JoinHandle<()>> {
    let engine_events = state.engine.subscribe();
    vec![
        tokio::spawn(engine_pump(state.clone(), engine_events)),
        tokio::spawn(ingest_exit_pump(state.clone(), ingest.exits)),
        tokio::spawn(frame_pump(state, ingest.frames)),
    ]
}

pub async fn engine_pump(state: Arc<SharedState>, mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => handle_engine_event(&state, event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Engine event pump lagged, {} notifications skipped; reconciling",
                    skipped
                );
                reconcile(&state).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Engine event pump finished");
}

fn notify_producer_closed(
    state: &SharedState,
    owner: &ResourceOwner,
    consumer_id: String,
    producer_id: ProducerId,
) {
    let feed_id = owner
        .feed_id
        .clone()
        .or_else(|| state.feeds.feed_for_producer(&producer_id));
    state.send_to(
        &owner.session_id,
        &ServerMessage::ProducerClosed {
            consumer_id,
            producer_id,
            feed_id,
        },
    );
}

async fn release_feed(state: &SharedState, producer_id: &str) {
    if let Some(stopped) = state.feeds.release_producer(producer_id).await {
        state.refresh_gauges();
        state.broadcast(&ServerMessage::FeedStopped {
            feed_id: stopped.feed_id,
            reason: stopped.reason,
        });
    }
}

pub async fn handle_engine_event(state: &SharedState, event: EngineEvent) {
    match event {
        EngineEvent::ConsumerClosed {
            consumer_id,
            producer_id,
            reason,
            ..
        } => {
            let Some(owner) = state.sessions.unindex(&consumer_id) else {
                return;
            };
            state
                .sessions
                .notify(&owner.session_id, SessionNotice::ConsumerClosed(consumer_id.clone()));
            // Viewers hear about producers going away, not their own closes
            if reason == CloseReason::ProducerClosed {
                notify_producer_closed(state, &owner, consumer_id, producer_id);
            }
        }

        EngineEvent::ProducerClosed { producer_id, .. } => {
            if let Some(owner) = state.sessions.unindex(&producer_id) {
                state
                    .sessions
                    .notify(&owner.session_id, SessionNotice::ProducerClosed(producer_id.clone()));
            }
            release_feed(state, &producer_id).await;
        }

        EngineEvent::TransportClosed {
            transport_id,
            reason,
        } => {
            let Some(owner) = state.sessions.unindex(&transport_id) else {
                return;
            };
            state
                .sessions
                .notify(&owner.session_id, SessionNotice::TransportClosed(transport_id.clone()));
            if reason != CloseReason::Requested {
                info!(
                    "Transport {} of session {} closed by engine ({})",
                    transport_id,
                    owner.session_id,
                    reason.as_str()
                );
                state.send_to(&owner.session_id, &ServerMessage::TransportClosed { transport_id });
            }
        }

        EngineEvent::WorkerDied { reason } => {
            error!("Media engine worker died: {}", reason);
        }
    }
}

/// Settle indexed resources and feeds whose engine objects are gone
pub async fn reconcile(state: &SharedState) {
    let mut settled = 0;
    for (resource_id, owner) in state.sessions.owned_resources() {
        if state.engine.contains(&resource_id) {
            continue;
        }
        let Some(owner) = state.sessions.unindex(&resource_id).filter(|o| *o == owner) else {
            continue;
        };
        settled += 1;
        match &owner.resource {
            Resource::Transport => {
                state.sessions.notify(
                    &owner.session_id,
                    SessionNotice::TransportClosed(resource_id.clone()),
                );
                state.send_to(
                    &owner.session_id,
                    &ServerMessage::TransportClosed {
                        transport_id: resource_id,
                    },
                );
            }
            Resource::Producer => {
                state
                    .sessions
                    .notify(&owner.session_id, SessionNotice::ProducerClosed(resource_id));
            }
            Resource::Consumer { producer_id } => {
                state.sessions.notify(
                    &owner.session_id,
                    SessionNotice::ConsumerClosed(resource_id.clone()),
                );
                if !state.engine.contains(producer_id) {
                    notify_producer_closed(state, &owner, resource_id, producer_id.clone());
                }
            }
        }
    }

    for (feed_id, producer_id) in state.feeds.bound_producers() {
        if !state.engine.contains(&producer_id) {
            debug!("Feed {} lost producer {} while lagging", feed_id, producer_id);
            settled += 1;
            release_feed(state, &producer_id).await;
        }
    }
    info!("Reconciled {} resources after lag", settled);
}

async fn ingest_exit_pump(state: Arc<SharedState>, mut exits: mpsc::UnboundedReceiver<IngestExit>) {
    while let Some(exit) = exits.recv().await {
        handle_ingest_exit(&state, &exit).await;
    }
    debug!("Ingest exit pump finished");
}

pub async fn handle_ingest_exit(state: &SharedState, exit: &IngestExit) {
    let Some(stopped) = state.feeds.handle_ingest_exit(exit).await else {
        debug!(
            "Ignoring stale exit of {} stage for feed {} (generation {})",
            exit.stage, exit.feed_id, exit.generation
        );
        return;
    };
    state.metrics.record_ingest_crash(&exit.stage.to_string());
    state.refresh_gauges();
    state.broadcast(&ServerMessage::FeedStopped {
        feed_id: stopped.feed_id,
        reason: stopped.reason,
    });
}

async fn frame_pump(state: Arc<SharedState>, mut frames: mpsc::Receiver<CapturedFrame>) {
    while let Some(frame) = frames.recv().await {
        if frame.offer.dropped() {
            state.metrics.frames_dropped_total.inc();
        }
        state.broadcast(&ServerMessage::video_frame(&frame.feed_id, &frame.jpeg_base64));
    }
    debug!("Frame pump finished");
}
