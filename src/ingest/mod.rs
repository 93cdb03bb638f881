//! Ingest pipeline supervision
//!
//! Each running feed has two external processes: a capture stage that
//! writes JSON frame lines to stdout and an encode stage that reads JPEG
//! frames on stdin and sends RTP to the feed's pipe transport.

pub mod process;
pub mod supervisor;

pub use process::{IngestProcess, ProcessStatus, Stage};
pub use supervisor::{CapturedFrame, FrameOffer, IngestEvents, IngestExit, IngestSupervisor};

use std::error::Error;
use std::fmt;

/// Ingest errors
#[derive(Debug, Clone)]
pub enum IngestError {
    /// A pipeline for this feed is already running
    AlreadyRunning(String),
    /// A stage could not be spawned
    SpawnFailed {
        stage: Stage,
        program: String,
        reason: String,
    },
    /// A stage exited before the pipeline became ready
    ExitedEarly { feed_id: String, stage: Stage },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::AlreadyRunning(feed) => write!(f, "Ingest already running for {}", feed),
            IngestError::SpawnFailed { stage, program, reason } => {
                write!(f, "Failed to spawn {} stage '{}': {}", stage, program, reason)
            }
            IngestError::ExitedEarly { feed_id, stage } => {
                write!(f, "Ingest {} stage for {} exited during startup", stage, feed_id)
            }
        }
    }
}

impl Error for IngestError {}

/// Values substituted into the capture/encode argument templates
#[derive(Debug, Clone)]
pub struct IngestArgs {
    pub feed_id: String,
    pub source: String,
    pub rtp_ip: String,
    pub rtp_port: u16,
    pub payload_type: u8,
    pub ssrc: u32,
}

impl IngestArgs {
    fn value(&self, key: &str) -> Option<String> {
        match key {
            "feed_id" => Some(self.feed_id.clone()),
            "source" => Some(self.source.clone()),
            "rtp_ip" => Some(self.rtp_ip.clone()),
            "rtp_port" => Some(self.rtp_port.to_string()),
            "payload_type" => Some(self.payload_type.to_string()),
            "ssrc" => Some(self.ssrc.to_string()),
            _ => None,
        }
    }

    /// Substitute `{key}` placeholders in one pass. Unknown keys stay as
    /// written and substituted values are never expanded again.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let value = tail
                .find('}')
                .and_then(|close| self.value(&tail[1..close]).map(|v| (v, close)));
            match value {
                Some((value, close)) => {
                    out.push_str(&value);
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn expand_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.expand(t)).collect()
    }
}
