//! Client sessions
//!
//! One `ClientSession` per signaling connection. It owns the handles of
//! every transport, producer and consumer the client created, and
//! releases all of them when the connection goes away.
//!
//! Engine close notifications reach a session through its mailbox, which
//! never waits on the session lock. The session drains it before handling
//! the next request.

use super::pairing::{ConsumerHandle, ProducerHandle};
use super::transport::TransportHandle;
use super::SignalingError;
use crate::engine::{ConsumerId, MediaEngine, ProducerId, TransportId};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub type SessionId = String;

/// Slot key for consumer transports and consumers opened without a feed id
pub const DEFAULT_FEED_KEY: &str = "";

pub fn feed_key(feed_id: Option<&str>) -> &str {
    feed_id.unwrap_or(DEFAULT_FEED_KEY)
}

/// What the client does on this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

/// Engine-side close of a resource a session owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    TransportClosed(TransportId),
    ProducerClosed(ProducerId),
    ConsumerClosed(ConsumerId),
}

/// Pending notices for one session
pub type Mailbox = Arc<Mutex<Vec<SessionNotice>>>;

pub type SessionRef = Arc<tokio::sync::Mutex<ClientSession>>;

/// Kind of engine resource in the owner index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Transport,
    Producer,
    Consumer { producer_id: ProducerId },
}

/// Who owns an engine resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOwner {
    pub session_id: SessionId,
    pub resource: Resource,
    pub feed_id: Option<String>,
}

impl ResourceOwner {
    pub fn new(session_id: &str, resource: Resource, feed_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.to_string(),
            resource,
            feed_id: feed_id.map(str::to_string),
        }
    }
}

/// Counts of resources released by a teardown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

pub struct ClientSession {
    pub id: SessionId,
    pub role: Option<Role>,
    pub producer_transport: Option<TransportHandle>,
    /// Keyed by feed id, `DEFAULT_FEED_KEY` when none was given
    pub consumer_transports: HashMap<String, TransportHandle>,
    pub producer: Option<ProducerHandle>,
    /// Keyed like `consumer_transports`
    pub consumers: HashMap<String, ConsumerHandle>,
    pub created_at: Instant,
    mailbox: Mailbox,
    closed: bool,
}

impl ClientSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            role: None,
            producer_transport: None,
            consumer_transports: HashMap::new(),
            producer: None,
            consumers: HashMap::new(),
            created_at: Instant::now(),
            mailbox: Mailbox::default(),
            closed: false,
        }
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Apply pending engine notices. Returns how many were drained.
    pub fn apply_notices(&mut self) -> usize {
        let notices = std::mem::take(&mut *self.mailbox.lock());
        for notice in &notices {
            match notice {
                SessionNotice::TransportClosed(id) => {
                    self.on_transport_closed(id);
                }
                SessionNotice::ProducerClosed(id) => {
                    self.on_producer_closed(id);
                }
                SessionNotice::ConsumerClosed(id) => {
                    self.on_consumer_closed(id);
                }
            }
        }
        notices.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn ensure_open(&self) -> Result<(), SignalingError> {
        if self.closed {
            return Err(SignalingError::Conflict(format!(
                "Session {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    /// The first transport a client creates decides its role
    pub fn set_role(&mut self, role: Role) {
        if self.role.is_none() {
            debug!("Session {} role: {:?}", self.id, role);
            self.role = Some(role);
        }
    }

    pub fn consumer_transport_for(&self, feed_id: Option<&str>) -> Option<&TransportHandle> {
        self.consumer_transports
            .get(feed_key(feed_id))
            .or_else(|| self.consumer_transports.get(DEFAULT_FEED_KEY))
    }

    /// Look up a consumer transport by id, else by feed id, else the default slot
    pub fn consumer_transport_mut(
        &mut self,
        transport_id: Option<&str>,
        feed_id: Option<&str>,
    ) -> Option<&mut TransportHandle> {
        if let Some(id) = transport_id {
            return self.consumer_transports.values_mut().find(|t| t.id == id);
        }
        let key = if self.consumer_transports.contains_key(feed_key(feed_id)) {
            feed_key(feed_id)
        } else {
            DEFAULT_FEED_KEY
        };
        self.consumer_transports.get_mut(key)
    }

    pub fn transport_mut(&mut self, transport_id: &str) -> Option<&mut TransportHandle> {
        if let Some(t) = self.producer_transport.as_mut().filter(|t| t.id == transport_id) {
            return Some(t);
        }
        self.consumer_transports
            .values_mut()
            .find(|t| t.id == transport_id)
    }

    pub fn owns_transport(&self, transport_id: &str) -> bool {
        self.producer_transport
            .as_ref()
            .is_some_and(|t| t.id == transport_id)
            || self.consumer_transports.values().any(|t| t.id == transport_id)
    }

    /// Mark the producer and consumers riding on a transport as closed
    pub fn close_bound_to(&mut self, transport_id: &str) {
        if let Some(p) = self.producer.as_mut().filter(|p| p.transport_id == transport_id) {
            p.closed = true;
        }
        for c in self.consumers.values_mut() {
            if c.transport_id == transport_id {
                c.closed = true;
            }
        }
    }

    /// Engine closed a consumer. Returns the handle when it was still open.
    pub fn on_consumer_closed(&mut self, consumer_id: &str) -> Option<ConsumerHandle> {
        let handle = self
            .consumers
            .values_mut()
            .find(|c| c.id == consumer_id && !c.closed)?;
        handle.closed = true;
        Some(handle.clone())
    }

    pub fn on_producer_closed(&mut self, producer_id: &str) -> bool {
        match self.producer.as_mut() {
            Some(p) if p.id == producer_id && !p.closed => {
                p.closed = true;
                true
            }
            _ => false,
        }
    }

    pub fn on_transport_closed(&mut self, transport_id: &str) -> bool {
        let first = match self.transport_mut(transport_id) {
            Some(t) => t.mark_closed(),
            None => false,
        };
        if first {
            self.close_bound_to(transport_id);
        }
        first
    }

    /// Release consumers, then the producer, then transports.
    /// Only resources still open are counted.
    pub fn close_all(&mut self, engine: &MediaEngine) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.closed {
            return report;
        }
        self.apply_notices();
        self.closed = true;

        for c in self.consumers.values_mut().filter(|c| !c.closed) {
            c.closed = true;
            engine.close_consumer(&c.id);
            report.consumers += 1;
        }
        if let Some(p) = self.producer.as_mut().filter(|p| !p.closed) {
            p.closed = true;
            engine.close_producer(&p.id);
            report.producers += 1;
        }
        let transports = self
            .producer_transport
            .iter_mut()
            .chain(self.consumer_transports.values_mut());
        for t in transports {
            if t.mark_closed() {
                engine.close_transport(&t.id);
                report.transports += 1;
            }
        }
        report
    }
}

struct SessionEntry {
    session: SessionRef,
    mailbox: Mailbox,
}

/// All live sessions plus an index from engine resource id to owner
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    owners: Mutex<HashMap<String, ResourceOwner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> (SessionId, SessionRef) {
        let mut sessions = self.sessions.write();
        Self::insert(&mut sessions)
    }

    /// Create a session unless `max_sessions` are already open (0 = unlimited).
    /// The count check and the insert happen under one write lock.
    pub fn try_create(&self, max_sessions: usize) -> Option<(SessionId, SessionRef)> {
        let mut sessions = self.sessions.write();
        if max_sessions > 0 && sessions.len() >= max_sessions {
            return None;
        }
        Some(Self::insert(&mut sessions))
    }

    fn insert(sessions: &mut HashMap<SessionId, SessionEntry>) -> (SessionId, SessionRef) {
        let id = uuid::Uuid::new_v4().to_string();
        let session = ClientSession::new(id.clone());
        let mailbox = session.mailbox();
        let session = Arc::new(tokio::sync::Mutex::new(session));
        sessions.insert(
            id.clone(),
            SessionEntry {
                session: session.clone(),
                mailbox,
            },
        );
        info!("Session {} opened", id);
        (id, session)
    }

    pub fn get(&self, id: &str) -> Option<SessionRef> {
        self.sessions.read().get(id).map(|e| e.session.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Queue a notice for a session without touching its lock.
    /// False when the session is gone.
    pub fn notify(&self, session_id: &str, notice: SessionNotice) -> bool {
        match self.sessions.read().get(session_id) {
            Some(entry) => {
                entry.mailbox.lock().push(notice);
                true
            }
            None => false,
        }
    }

    pub fn index(&self, resource_id: &str, owner: ResourceOwner) {
        self.owners.lock().insert(resource_id.to_string(), owner);
    }

    /// Remove an index entry. Only the first caller gets the owner back.
    pub fn unindex(&self, resource_id: &str) -> Option<ResourceOwner> {
        self.owners.lock().remove(resource_id)
    }

    pub fn owner_of(&self, resource_id: &str) -> Option<ResourceOwner> {
        self.owners.lock().get(resource_id).cloned()
    }

    /// Snapshot of the owner index
    pub fn owned_resources(&self) -> Vec<(String, ResourceOwner)> {
        self.owners
            .lock()
            .iter()
            .map(|(id, owner)| (id.clone(), owner.clone()))
            .collect()
    }

    /// Remove the session and release its resources.
    /// Returns `None` if it was already torn down.
    pub async fn teardown(&self, engine: &MediaEngine, id: &str) -> Option<TeardownReport> {
        let entry = self.sessions.write().remove(id)?;
        let mut session = entry.session.lock().await;
        let report = session.close_all(engine);
        self.owners.lock().retain(|_, owner| owner.session_id != id);
        info!(
            "Session {} closed ({} transports, {} producers, {} consumers released, alive {:?})",
            id,
            report.transports,
            report.producers,
            report.consumers,
            session.created_at.elapsed()
        );
        Some(report)
    }
}
