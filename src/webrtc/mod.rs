//! Client sessions and the signaling protocol
//!
//! This module provides the orchestration around the media engine:
//! - Transport state machine per client transport
//! - Producer/consumer pairing with capability checks
//! - Session registry with atomic teardown
//! - JSON signaling messages

pub mod pairing;
pub mod session;
pub mod signaling;
pub mod transport;

pub use session::{ClientSession, SessionId, SessionRegistry, TeardownReport};
pub use signaling::{Request, ServerMessage};
pub use transport::{TransportHandle, TransportState};

use crate::engine::EngineError;
use crate::feed::FeedError;
use crate::ingest::IngestError;
use std::error::Error;
use std::fmt;

/// Error taxonomy reported to clients and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    ResourceNotFound,
    EngineIncompatibility,
    Conflict,
    ProcessFailure,
    EngineFatal,
}

/// Signaling errors
#[derive(Debug, Clone)]
pub enum SignalingError {
    /// Unknown `type`
    InvalidMessageType(String),
    /// Missing or malformed field
    Validation(String),
    /// No such transport/consumer in this session
    NotFound(String),
    /// Request conflicts with current state
    Conflict(String),
    /// Forbidden transport state change
    TransportState(String),
    Engine(EngineError),
    Feed(FeedError),
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::InvalidMessageType(_) => write!(f, "Invalid message type"),
            SignalingError::Validation(msg) => write!(f, "{}", msg),
            SignalingError::NotFound(msg) => write!(f, "{}", msg),
            SignalingError::Conflict(msg) => write!(f, "{}", msg),
            SignalingError::TransportState(msg) => write!(f, "{}", msg),
            SignalingError::Engine(e) => write!(f, "{}", e),
            SignalingError::Feed(e) => write!(f, "{}", e),
        }
    }
}

impl Error for SignalingError {}

impl From<EngineError> for SignalingError {
    fn from(e: EngineError) -> Self {
        SignalingError::Engine(e)
    }
}

impl From<FeedError> for SignalingError {
    fn from(e: FeedError) -> Self {
        SignalingError::Feed(e)
    }
}

fn engine_category(e: &EngineError) -> ErrorCategory {
    match e {
        EngineError::EngineFatal(_) => ErrorCategory::EngineFatal,
        EngineError::TransportNotFound(_)
        | EngineError::ProducerNotFound(_)
        | EngineError::ConsumerNotFound(_) => ErrorCategory::ResourceNotFound,
        EngineError::IncompatibleCapabilities(_) | EngineError::UnsupportedCodec(_) => {
            ErrorCategory::EngineIncompatibility
        }
        EngineError::InvalidParameters(_) => ErrorCategory::Validation,
        EngineError::EngineUnavailable
        | EngineError::TransportNotConnected(_)
        | EngineError::WrongDirection(_)
        | EngineError::Request(_) => ErrorCategory::Conflict,
    }
}

impl SignalingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SignalingError::InvalidMessageType(_) | SignalingError::Validation(_) => {
                ErrorCategory::Validation
            }
            SignalingError::NotFound(_) => ErrorCategory::ResourceNotFound,
            SignalingError::Conflict(_) | SignalingError::TransportState(_) => {
                ErrorCategory::Conflict
            }
            SignalingError::Engine(e) => engine_category(e),
            SignalingError::Feed(e) => match e {
                FeedError::InvalidFeedId(_) | FeedError::NoSourceMapped(_) => {
                    ErrorCategory::Validation
                }
                FeedError::NotFound(_) => ErrorCategory::ResourceNotFound,
                FeedError::AlreadyRunning(_) | FeedError::Conflict(_) => ErrorCategory::Conflict,
                FeedError::Engine(e) => engine_category(e),
                FeedError::Ingest(IngestError::AlreadyRunning(_)) => ErrorCategory::Conflict,
                FeedError::Ingest(_) => ErrorCategory::ProcessFailure,
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::EngineFatal
    }
}
