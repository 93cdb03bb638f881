//! Feed registry
//!
//! A feed is a named video source. It is either published by an ingest
//! pipeline started through `startFeed`, or by a client session producing
//! with a `feedId`. At most one producer is live per feed id.

pub mod registry;

pub use registry::{FeedRegistry, FeedStarted, FeedStopped};

use crate::engine::{EngineError, ProducerId, TransportId};
use crate::ingest::IngestError;
use std::error::Error;
use std::fmt;

/// Longest accepted feed id
pub const MAX_FEED_ID_LEN: usize = 64;

/// Feed lifecycle; absence of a record is the ABSENT state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Starting,
    Running,
    Stopping,
}

/// Who publishes the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Ingest {
        generation: u64,
        pipe_transport_id: TransportId,
    },
    Session {
        session_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct FeedRecord {
    pub state: FeedState,
    pub source: Option<FeedSource>,
    pub producer_id: Option<ProducerId>,
}

/// Feed errors
#[derive(Debug, Clone)]
pub enum FeedError {
    InvalidFeedId(String),
    NoSourceMapped(String),
    AlreadyRunning(String),
    NotFound(String),
    /// Another producer already publishes this feed
    Conflict(String),
    Engine(EngineError),
    Ingest(IngestError),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::InvalidFeedId(reason) => write!(f, "Invalid feedId: {}", reason),
            FeedError::NoSourceMapped(id) => write!(f, "No ingest source mapped for feedId: {}", id),
            FeedError::AlreadyRunning(_) => write!(f, "Feed already running"),
            FeedError::NotFound(id) => write!(f, "No active feed for feedId: {}", id),
            FeedError::Conflict(_) => write!(f, "Feed already published"),
            FeedError::Engine(e) => write!(f, "{}", e),
            FeedError::Ingest(e) => write!(f, "{}", e),
        }
    }
}

impl Error for FeedError {}

impl From<EngineError> for FeedError {
    fn from(e: EngineError) -> Self {
        FeedError::Engine(e)
    }
}

impl From<IngestError> for FeedError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::AlreadyRunning(id) => FeedError::AlreadyRunning(id),
            other => FeedError::Ingest(other),
        }
    }
}

/// Feed ids end up in process arguments, so keep them to a safe alphabet
pub fn validate_feed_id(feed_id: &str) -> Result<(), FeedError> {
    if feed_id.is_empty() {
        return Err(FeedError::InvalidFeedId("feedId is empty".to_string()));
    }
    if feed_id.len() > MAX_FEED_ID_LEN {
        return Err(FeedError::InvalidFeedId(format!(
            "feedId longer than {} characters",
            MAX_FEED_ID_LEN
        )));
    }
    if !feed_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(FeedError::InvalidFeedId(format!(
            "feedId '{}' contains characters outside [A-Za-z0-9_-]",
            feed_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_id_validation() {
        assert!(validate_feed_id("feed1").is_ok());
        assert!(validate_feed_id("cam_north-2").is_ok());
        assert!(validate_feed_id("").is_err());
        assert!(validate_feed_id("a b").is_err());
        assert!(validate_feed_id("../etc").is_err());
        assert!(validate_feed_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn client_facing_messages() {
        assert_eq!(
            FeedError::AlreadyRunning("feed1".into()).to_string(),
            "Feed already running"
        );
        assert_eq!(
            FeedError::NotFound("feed1".into()).to_string(),
            "No active feed for feedId: feed1"
        );
    }
}
