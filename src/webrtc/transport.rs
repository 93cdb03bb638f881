//! Transport coordinator
//!
//! Each client transport moves through `Created -> Connecting -> Connected
//! -> Closed`. `Closed` is terminal: a closed transport is never reused.

use super::session::{feed_key, ClientSession, Role};
use super::SignalingError;
use crate::engine::{
    DtlsParameters, EngineError, MediaEngine, TransportDirection, TransportId, WebRtcTransportInfo,
};
use log::{debug, info};

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, remote DTLS parameters not yet received
    Created,
    /// Connect parameters forwarded to the engine
    Connecting,
    /// Engine acknowledged the connect
    Connected,
    /// Terminal
    Closed,
}

/// A transport owned by one client session
#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub feed_id: Option<String>,
    state: TransportState,
}

impl TransportHandle {
    pub fn new(id: TransportId, direction: TransportDirection, feed_id: Option<String>) -> Self {
        Self {
            id,
            direction,
            feed_id,
            state: TransportState::Created,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TransportState::Closed
    }

    /// Apply a state change. `Ok(false)` means it was already in that state.
    fn transition(&mut self, next: TransportState) -> Result<bool, SignalingError> {
        use TransportState::*;
        let allowed = match (self.state, next) {
            (Closed, Closed) => return Ok(false),
            (Closed, _) => {
                return Err(SignalingError::TransportState(format!(
                    "Transport {} is closed",
                    self.id
                )))
            }
            (_, Closed) => true,
            (Created, Connecting) | (Connecting, Connected) | (Connecting, Created) => true,
            _ => false,
        };
        if !allowed {
            return Err(SignalingError::TransportState(format!(
                "Transport {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        debug!(
            "Transport {} state change: {:?} -> {:?}",
            self.id, self.state, next
        );
        self.state = next;
        Ok(true)
    }

    pub fn begin_connect(&mut self) -> Result<(), SignalingError> {
        self.transition(TransportState::Connecting).map(|_| ())
    }

    pub fn mark_connected(&mut self) -> Result<(), SignalingError> {
        self.transition(TransportState::Connected).map(|_| ())
    }

    /// Connect failed; the client may retry with new parameters
    pub fn abort_connect(&mut self) {
        if self.state == TransportState::Connecting {
            let _ = self.transition(TransportState::Created);
        }
    }

    /// Returns true only on the first close
    pub fn mark_closed(&mut self) -> bool {
        self.transition(TransportState::Closed).unwrap_or(false)
    }
}

/// Create a transport for the session, replacing one in the same slot
pub async fn create_transport(
    engine: &MediaEngine,
    session: &mut ClientSession,
    direction: TransportDirection,
    feed_id: Option<String>,
) -> Result<WebRtcTransportInfo, SignalingError> {
    session.ensure_open()?;
    let info = engine.create_transport(direction, &session.id).await?;
    let handle = TransportHandle::new(info.id.clone(), direction, feed_id.clone());

    let replaced = match direction {
        TransportDirection::Send => {
            session.set_role(Role::Producer);
            session.producer_transport.replace(handle)
        }
        TransportDirection::Recv => {
            session.set_role(Role::Consumer);
            session
                .consumer_transports
                .insert(feed_key(feed_id.as_deref()).to_string(), handle)
        }
    };
    if let Some(old) = replaced {
        if !old.is_closed() {
            info!("Session {} replaced transport {}", session.id, old.id);
            close_transport(engine, session, &old.id, Some(old.clone()));
        }
    }
    Ok(info)
}

/// Forward remote DTLS parameters and drive the transport to `Connected`
pub async fn connect_transport(
    engine: &MediaEngine,
    session: &mut ClientSession,
    direction: TransportDirection,
    transport_id: Option<&str>,
    feed_id: Option<&str>,
    dtls: &DtlsParameters,
) -> Result<TransportId, SignalingError> {
    session.ensure_open()?;
    let handle = match direction {
        TransportDirection::Send => session.producer_transport.as_mut(),
        TransportDirection::Recv => session.consumer_transport_mut(transport_id, feed_id),
    }
    .ok_or_else(|| {
        SignalingError::NotFound(match direction {
            TransportDirection::Send => "No producer transport".to_string(),
            TransportDirection::Recv => "No consumer transport".to_string(),
        })
    })?;

    handle.begin_connect()?;
    let id = handle.id.clone();
    match engine.connect_transport(&id, dtls).await {
        Ok(()) => {
            handle.mark_connected()?;
            info!("Transport {} connected", id);
            Ok(id)
        }
        Err(EngineError::TransportNotFound(missing)) => {
            handle.mark_closed();
            Err(EngineError::TransportNotFound(missing).into())
        }
        Err(e) => {
            handle.abort_connect();
            Err(e.into())
        }
    }
}

/// Close a transport of this session and everything bound to it.
///
/// `detached` is a handle already removed from the session's slots.
/// Returns false when it was already closed.
pub fn close_transport(
    engine: &MediaEngine,
    session: &mut ClientSession,
    transport_id: &str,
    detached: Option<TransportHandle>,
) -> bool {
    let first = match detached {
        Some(mut handle) => handle.mark_closed(),
        None => match session.transport_mut(transport_id) {
            Some(handle) => handle.mark_closed(),
            None => return false,
        },
    };
    if first {
        engine.close_transport(transport_id);
        session.close_bound_to(transport_id);
        info!("Transport {} closed", transport_id);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TransportHandle {
        TransportHandle::new("t1".to_string(), TransportDirection::Send, None)
    }

    #[test]
    fn happy_path() {
        let mut t = handle();
        assert_eq!(t.state(), TransportState::Created);
        t.begin_connect().unwrap();
        assert_eq!(t.state(), TransportState::Connecting);
        t.mark_connected().unwrap();
        assert_eq!(t.state(), TransportState::Connected);
        assert!(t.mark_closed());
        assert!(t.is_closed());
    }

    #[test]
    fn closed_is_terminal() {
        let mut t = handle();
        assert!(t.mark_closed());
        assert!(!t.mark_closed());
        assert!(t.begin_connect().is_err());
        assert!(t.mark_connected().is_err());
        assert_eq!(t.state(), TransportState::Closed);
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut t = handle();
        t.begin_connect().unwrap();
        t.mark_connected().unwrap();
        assert!(t.begin_connect().is_err());
        assert_eq!(t.state(), TransportState::Connected);
    }

    #[test]
    fn aborted_connect_can_retry() {
        let mut t = handle();
        t.begin_connect().unwrap();
        t.abort_connect();
        assert_eq!(t.state(), TransportState::Created);
        t.begin_connect().unwrap();
    }

    #[test]
    fn cannot_skip_connecting() {
        let mut t = handle();
        assert!(t.mark_connected().is_err());
    }
}
