//! Broadcast bus
//!
//! Fan-out of server messages to connected signaling clients. Sends never
//! wait: a client whose outbound queue is full misses the message.

use crate::webrtc::SessionId;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const DROP_LOG_INTERVAL: u64 = 100;

/// Connection state of a tracked client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Not open, or excluded
    pub skipped: usize,
    /// Queue full
    pub dropped: usize,
}

struct Client {
    sender: mpsc::Sender<String>,
    state: ConnectionState,
    drops: Arc<AtomicU64>,
}

#[derive(Default)]
pub struct BroadcastBus {
    clients: RwLock<HashMap<SessionId, Client>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str, sender: mpsc::Sender<String>) {
        self.clients.write().insert(
            session_id.to_string(),
            Client {
                sender,
                state: ConnectionState::Open,
                drops: Arc::new(AtomicU64::new(0)),
            },
        );
    }

    pub fn set_state(&self, session_id: &str, state: ConnectionState) {
        if let Some(client) = self.clients.write().get_mut(session_id) {
            debug!(
                "Client {} state change: {:?} -> {:?}",
                session_id, client.state, state
            );
            client.state = state;
        }
    }

    pub fn unregister(&self, session_id: &str) {
        self.clients.write().remove(session_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Send to one client. False if it is not open or its queue is full.
    pub fn send_to(&self, session_id: &str, message: &str) -> bool {
        let clients = self.clients.read();
        match clients.get(session_id) {
            Some(client) if client.state == ConnectionState::Open => {
                client.sender.try_send(message.to_string()).is_ok()
            }
            _ => false,
        }
    }

    pub fn broadcast(&self, message: &str) -> Delivery {
        self.fan_out(message, None)
    }

    pub fn broadcast_except(&self, exclude: &str, message: &str) -> Delivery {
        self.fan_out(message, Some(exclude))
    }

    fn fan_out(&self, message: &str, exclude: Option<&str>) -> Delivery {
        let mut delivery = Delivery::default();
        // Snapshot so the lock is not held while sending
        let snapshot: Vec<(SessionId, mpsc::Sender<String>, Arc<AtomicU64>)> = {
            let clients = self.clients.read();
            let mut open = Vec::with_capacity(clients.len());
            for (id, client) in clients.iter() {
                if client.state != ConnectionState::Open || exclude == Some(id.as_str()) {
                    delivery.skipped += 1;
                    continue;
                }
                open.push((id.clone(), client.sender.clone(), client.drops.clone()));
            }
            open
        };

        for (id, sender, drops) in snapshot {
            match sender.try_send(message.to_string()) {
                Ok(()) => delivery.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    let prev = drops.fetch_add(1, Ordering::Relaxed);
                    if (prev + 1) % DROP_LOG_INTERVAL == 1 {
                        warn!("Client {} is slow, dropped {} messages", id, prev + 1);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => delivery.skipped += 1,
            }
        }
        delivery
    }
}
