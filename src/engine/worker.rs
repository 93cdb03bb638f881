//! Media engine worker
//!
//! One mediasoup worker per process. Its death is terminal: the exit is
//! forwarded as an engine signal and the relay shuts down.

use super::{EngineError, EngineSignal};
use crate::config::EngineConfig;
use log::{error, info, warn};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::time::Instant;
use tokio::sync::mpsc;

pub struct EngineWorker {
    pub id: String,
    pub created_at: Instant,
    worker: Worker,
}

impl EngineWorker {
    /// Spawn the worker process and watch it for an unexpected exit
    pub(crate) async fn spawn(
        manager: &WorkerManager,
        settings: &EngineConfig,
        signals: mpsc::UnboundedSender<EngineSignal>,
    ) -> Result<Self, EngineError> {
        let mut worker_settings = WorkerSettings::default();
        worker_settings.log_level = log_level(&settings.log_level);
        worker_settings.log_tags = log_tags(&settings.log_tags);

        let worker = manager
            .create_worker(worker_settings)
            .await
            .map_err(|e| EngineError::EngineFatal(format!("failed to spawn worker: {}", e)))?;
        let id = worker.id().to_string();

        let dead_id = id.clone();
        worker
            .on_dead(move |result| {
                let reason = match result {
                    Ok(()) => "worker exited".to_string(),
                    Err(e) => format!("worker exited: {:?}", e),
                };
                error!("Media worker {} died: {}", dead_id, reason);
                let _ = signals.send(EngineSignal::WorkerDead { reason });
            })
            .detach();

        info!(
            "Media worker {} started (ports {}-{}, log level {}, tags [{}])",
            id,
            settings.rtc_min_port,
            settings.rtc_max_port,
            settings.log_level,
            settings.log_tags.join(",")
        );

        Ok(Self {
            id,
            created_at: Instant::now(),
            worker,
        })
    }

    pub(crate) fn inner(&self) -> &Worker {
        &self.worker
    }
}

fn log_level(level: &str) -> WorkerLogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" => WorkerLogLevel::Debug,
        "warn" => WorkerLogLevel::Warn,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        other => {
            warn!("Unknown worker log level '{}', using warn", other);
            WorkerLogLevel::Warn
        }
    }
}

fn log_tags(tags: &[String]) -> Vec<WorkerLogTag> {
    tags.iter()
        .filter_map(|tag| match tag.to_ascii_lowercase().as_str() {
            "info" => Some(WorkerLogTag::Info),
            "ice" => Some(WorkerLogTag::Ice),
            "dtls" => Some(WorkerLogTag::Dtls),
            "rtp" => Some(WorkerLogTag::Rtp),
            "srtp" => Some(WorkerLogTag::Srtp),
            "rtcp" => Some(WorkerLogTag::Rtcp),
            "rtx" => Some(WorkerLogTag::Rtx),
            "bwe" => Some(WorkerLogTag::Bwe),
            "score" => Some(WorkerLogTag::Score),
            "simulcast" => Some(WorkerLogTag::Simulcast),
            "svc" => Some(WorkerLogTag::Svc),
            "sctp" => Some(WorkerLogTag::Sctp),
            "message" => Some(WorkerLogTag::Message),
            other => {
                warn!("Ignoring unknown worker log tag '{}'", other);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_log_settings() {
        assert!(matches!(log_level("ERROR"), WorkerLogLevel::Error));
        assert!(matches!(log_level("chatty"), WorkerLogLevel::Warn));
        let tags = log_tags(&["ice".to_string(), "bogus".to_string(), "DTLS".to_string()]);
        assert_eq!(tags.len(), 2);
        assert!(matches!(tags[0], WorkerLogTag::Ice));
        assert!(matches!(tags[1], WorkerLogTag::Dtls));
    }
}
