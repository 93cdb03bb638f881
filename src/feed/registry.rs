//! Feed registry with per-feed serialization
//!
//! Start, stop, crash handling and producer release for one feed id all
//! run under that feed id's async lock. A stop that arrives while a start
//! is in flight waits for the start to settle, and the reverse.

use super::{validate_feed_id, FeedError, FeedRecord, FeedSource, FeedState};
use crate::config::IngestConfig;
use crate::engine::{MediaEngine, MediaKind, ProducerId};
use crate::ingest::{FrameOffer, IngestArgs, IngestError, IngestExit, IngestSupervisor, Stage};
use bytes::Bytes;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStarted {
    pub feed_id: String,
    pub producer_id: ProducerId,
}

/// A feed that left the registry, and why when it was not requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStopped {
    pub feed_id: String,
    pub reason: Option<String>,
}

struct IngestRun {
    generation: u64,
    pipe_transport_id: String,
    producer_id: ProducerId,
}

pub struct FeedRegistry {
    engine: Arc<MediaEngine>,
    ingest: Arc<IngestSupervisor>,
    config: IngestConfig,
    records: Mutex<HashMap<String, FeedRecord>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FeedRegistry {
    pub fn new(engine: Arc<MediaEngine>, ingest: Arc<IngestSupervisor>, config: IngestConfig) -> Self {
        Self {
            engine,
            ingest,
            config,
            records: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, feed_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the key lock once nobody holds or waits on it
    fn release_key(&self, feed_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the map, one here
        if Arc::strong_count(&lock) <= 2 && !self.records.lock().contains_key(feed_id) {
            locks.remove(feed_id);
        }
    }

    fn source_for(&self, feed_id: &str) -> Result<String, FeedError> {
        if self.config.sources.is_empty() {
            return Ok(feed_id.to_string());
        }
        self.config
            .sources
            .get(feed_id)
            .cloned()
            .ok_or_else(|| FeedError::NoSourceMapped(feed_id.to_string()))
    }

    /// ABSENT -> STARTING -> RUNNING, or back to ABSENT on any failure
    pub async fn start(&self, feed_id: &str) -> Result<FeedStarted, FeedError> {
        validate_feed_id(feed_id)?;
        let source = self.source_for(feed_id)?;

        let lock = self.key_lock(feed_id);
        let guard = lock.lock().await;

        let result = self.start_locked(feed_id, &source).await;

        drop(guard);
        self.release_key(feed_id, lock);
        result
    }

    async fn start_locked(&self, feed_id: &str, source: &str) -> Result<FeedStarted, FeedError> {
        {
            let mut records = self.records.lock();
            if records.contains_key(feed_id) {
                return Err(FeedError::AlreadyRunning(feed_id.to_string()));
            }
            records.insert(
                feed_id.to_string(),
                FeedRecord {
                    state: FeedState::Starting,
                    source: None,
                    producer_id: None,
                },
            );
        }
        info!("Feed {} starting", feed_id);

        match self.launch_ingest(feed_id, source).await {
            Ok(run) => {
                let mut records = self.records.lock();
                if let Some(record) = records.get_mut(feed_id) {
                    record.state = FeedState::Running;
                    record.producer_id = Some(run.producer_id.clone());
                    record.source = Some(FeedSource::Ingest {
                        generation: run.generation,
                        pipe_transport_id: run.pipe_transport_id,
                    });
                }
                info!("Feed {} running with producer {}", feed_id, run.producer_id);
                Ok(FeedStarted {
                    feed_id: feed_id.to_string(),
                    producer_id: run.producer_id,
                })
            }
            Err(e) => {
                self.records.lock().remove(feed_id);
                warn!("Feed {} failed to start: {}", feed_id, e);
                Err(e)
            }
        }
    }

    /// Pipe transport, then processes, then grace period, then producer.
    /// Every failure undoes the steps before it.
    async fn launch_ingest(&self, feed_id: &str, source: &str) -> Result<IngestRun, FeedError> {
        let ssrc = (Uuid::new_v4().as_u128() & 0xffff_ffff) as u32;
        let ingest = self.engine.ingest_parameters(ssrc)?;

        let pipe = self.engine.create_pipe_transport(feed_id).await?;
        let args = IngestArgs {
            feed_id: feed_id.to_string(),
            source: source.to_string(),
            rtp_ip: pipe.ip.clone(),
            rtp_port: pipe.port,
            payload_type: ingest.payload_type,
            ssrc,
        };

        let generation = match self.ingest.start(&args) {
            Ok(generation) => generation,
            Err(e) => {
                self.engine.close_transport(&pipe.id);
                return Err(e.into());
            }
        };

        tokio::time::sleep(self.ingest.ready_grace()).await;

        if !self.ingest.is_running(feed_id, Some(generation)) {
            let stage = self.ingest.dead_stage(feed_id).unwrap_or(Stage::Capture);
            self.ingest.stop(feed_id).await;
            self.engine.close_transport(&pipe.id);
            return Err(IngestError::ExitedEarly {
                feed_id: feed_id.to_string(),
                stage,
            }
            .into());
        }

        match self
            .engine
            .create_producer(&pipe.id, MediaKind::Video, ingest.rtp_parameters)
            .await
        {
            Ok(producer) => Ok(IngestRun {
                generation,
                pipe_transport_id: pipe.id,
                producer_id: producer.id,
            }),
            Err(e) => {
                self.ingest.stop(feed_id).await;
                self.engine.close_transport(&pipe.id);
                Err(e.into())
            }
        }
    }

    /// RUNNING -> STOPPING -> ABSENT
    pub async fn stop(&self, feed_id: &str) -> Result<FeedStopped, FeedError> {
        validate_feed_id(feed_id)?;
        let lock = self.key_lock(feed_id);
        let guard = lock.lock().await;

        let result = match self.begin_stop(feed_id, |_| true) {
            Some(record) => {
                self.teardown(feed_id, &record).await;
                self.records.lock().remove(feed_id);
                info!("Feed {} stopped", feed_id);
                Ok(FeedStopped {
                    feed_id: feed_id.to_string(),
                    reason: None,
                })
            }
            None => Err(FeedError::NotFound(feed_id.to_string())),
        };

        drop(guard);
        self.release_key(feed_id, lock);
        result
    }

    /// Move a matching record to STOPPING and return a copy of it
    fn begin_stop<F>(&self, feed_id: &str, matches: F) -> Option<FeedRecord>
    where
        F: FnOnce(&FeedRecord) -> bool,
    {
        let mut records = self.records.lock();
        let record = records.get_mut(feed_id)?;
        if !matches(record) {
            return None;
        }
        record.state = FeedState::Stopping;
        Some(record.clone())
    }

    async fn teardown(&self, feed_id: &str, record: &FeedRecord) {
        if let Some(producer_id) = &record.producer_id {
            self.engine.close_producer(producer_id);
        }
        if let Some(FeedSource::Ingest { pipe_transport_id, .. }) = &record.source {
            self.engine.close_transport(pipe_transport_id);
            self.ingest.stop(feed_id).await;
        }
    }

    /// Crash path: tear down the feed if the exit belongs to its current run
    pub async fn handle_ingest_exit(&self, exit: &IngestExit) -> Option<FeedStopped> {
        let lock = self.key_lock(&exit.feed_id);
        let guard = lock.lock().await;

        let stopped = match self.begin_stop(&exit.feed_id, |r| {
            matches!(r.source, Some(FeedSource::Ingest { generation, .. }) if generation == exit.generation)
        }) {
            Some(record) => {
                self.teardown(&exit.feed_id, &record).await;
                self.records.lock().remove(&exit.feed_id);
                let reason = format!("{} stage {}", exit.stage, exit.status.describe());
                warn!("Feed {} torn down: {}", exit.feed_id, reason);
                Some(FeedStopped {
                    feed_id: exit.feed_id.clone(),
                    reason: Some(reason),
                })
            }
            None => {
                // Stale generation or already stopped; make sure nothing lingers
                if !self.records.lock().contains_key(&exit.feed_id)
                    && self.ingest.is_running(&exit.feed_id, Some(exit.generation))
                {
                    self.ingest.stop(&exit.feed_id).await;
                }
                None
            }
        };

        drop(guard);
        self.release_key(&exit.feed_id, lock);
        stopped
    }

    /// Fails if the feed already has a record
    pub fn check_publishable(&self, feed_id: &str) -> Result<(), FeedError> {
        validate_feed_id(feed_id)?;
        if self.records.lock().contains_key(feed_id) {
            return Err(FeedError::Conflict(feed_id.to_string()));
        }
        Ok(())
    }

    /// Bind a session's producer to a feed id
    pub async fn bind_session_producer(
        &self,
        feed_id: &str,
        session_id: &str,
        producer_id: &str,
    ) -> Result<(), FeedError> {
        validate_feed_id(feed_id)?;
        let lock = self.key_lock(feed_id);
        let guard = lock.lock().await;

        let result = {
            let mut records = self.records.lock();
            match records.get(feed_id) {
                Some(existing) if existing.producer_id.as_deref() == Some(producer_id) => Ok(()),
                Some(_) => Err(FeedError::Conflict(feed_id.to_string())),
                None => {
                    records.insert(
                        feed_id.to_string(),
                        FeedRecord {
                            state: FeedState::Running,
                            source: Some(FeedSource::Session {
                                session_id: session_id.to_string(),
                            }),
                            producer_id: Some(producer_id.to_string()),
                        },
                    );
                    info!(
                        "Feed {} published by session {} (producer {})",
                        feed_id, session_id, producer_id
                    );
                    Ok(())
                }
            }
        };

        drop(guard);
        self.release_key(feed_id, lock);
        result
    }

    /// A producer closed: drop the feed it published, if any
    pub async fn release_producer(&self, producer_id: &str) -> Option<FeedStopped> {
        let feed_id = self.feed_for_producer(producer_id)?;
        let lock = self.key_lock(&feed_id);
        let guard = lock.lock().await;

        let stopped = match self.begin_stop(&feed_id, |r| {
            r.producer_id.as_deref() == Some(producer_id)
        }) {
            Some(record) => {
                self.teardown(&feed_id, &record).await;
                self.records.lock().remove(&feed_id);
                info!("Feed {} released after producer {} closed", feed_id, producer_id);
                Some(FeedStopped {
                    feed_id: feed_id.clone(),
                    reason: Some("producer closed".to_string()),
                })
            }
            None => None,
        };

        drop(guard);
        self.release_key(&feed_id, lock);
        stopped
    }

    /// Live producer of a running feed
    pub fn producer_for(&self, feed_id: &str) -> Option<ProducerId> {
        let records = self.records.lock();
        let record = records.get(feed_id)?;
        if record.state != FeedState::Running {
            return None;
        }
        record.producer_id.clone()
    }

    pub fn feed_for_producer(&self, producer_id: &str) -> Option<String> {
        self.records
            .lock()
            .iter()
            .find(|(_, r)| r.producer_id.as_deref() == Some(producer_id))
            .map(|(id, _)| id.clone())
    }

    /// Feeds with a bound producer, as (feed id, producer id)
    pub fn bound_producers(&self) -> Vec<(String, ProducerId)> {
        self.records
            .lock()
            .iter()
            .filter_map(|(id, r)| r.producer_id.clone().map(|p| (id.clone(), p)))
            .collect()
    }

    pub fn state(&self, feed_id: &str) -> Option<FeedState> {
        self.records.lock().get(feed_id).map(|r| r.state)
    }

    pub fn source(&self, feed_id: &str) -> Option<FeedSource> {
        self.records.lock().get(feed_id).and_then(|r| r.source.clone())
    }

    /// Running feed ids, sorted
    pub fn feed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .iter()
            .filter(|(_, r)| r.state == FeedState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn running_count(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.state == FeedState::Running)
            .count()
    }

    /// Hand a client-pushed frame to the feed's encoder
    pub fn route_frame(&self, feed_id: &str, frame: Bytes) -> FrameOffer {
        self.ingest.submit_frame(feed_id, frame)
    }

    /// Stop every feed (shutdown)
    pub async fn stop_all(&self) -> Vec<FeedStopped> {
        let ids: Vec<String> = self.records.lock().keys().cloned().collect();
        let mut stopped = Vec::new();
        for id in ids {
            match self.stop(&id).await {
                Ok(s) => stopped.push(s),
                Err(FeedError::NotFound(_)) => {}
                Err(e) => warn!("Failed to stop feed {}: {}", id, e),
            }
        }
        stopped
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{Config, EngineConfig};
    use crate::ingest::IngestEvents;
    use std::time::Duration;

    async fn registry(capture: &str) -> (Arc<FeedRegistry>, Arc<MediaEngine>, IngestEvents) {
        let mut config = Config::default().ingest;
        config.capture_program = "sh".to_string();
        config.capture_args = vec!["-c".to_string(), capture.to_string()];
        config.encode_program = "sh".to_string();
        config.encode_args = vec!["-c".to_string(), "cat > /dev/null".to_string()];
        config.ready_grace_ms = 150;
        config.stop_timeout_ms = 1000;

        let engine = Arc::new(MediaEngine::new(EngineConfig::default()));
        engine.initialize().await.unwrap();
        let (ingest, events) = IngestSupervisor::new(config.clone());
        (
            Arc::new(FeedRegistry::new(engine.clone(), ingest, config)),
            engine,
            events,
        )
    }

    #[tokio::test]
    async fn start_twice_spawns_once() {
        let (feeds, engine, _events) = registry("sleep 30").await;
        let started = feeds.start("feed1").await.unwrap();
        assert_eq!(feeds.state("feed1"), Some(FeedState::Running));
        assert_eq!(feeds.producer_for("feed1"), Some(started.producer_id.clone()));
        assert!(matches!(
            feeds.start("feed1").await,
            Err(FeedError::AlreadyRunning(_))
        ));
        assert_eq!(feeds.ingest.spawn_count(), 1);
        assert_eq!(engine.stats().producers, 1);

        feeds.stop("feed1").await.unwrap();
        assert_eq!(engine.stats().producers, 0);
        assert_eq!(engine.stats().transports, 0);
        assert!(feeds.feed_ids().is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_feed_is_not_found() {
        let (feeds, _engine, _events) = registry("sleep 30").await;
        let err = feeds.stop("feed1").await.unwrap_err();
        assert_eq!(err.to_string(), "No active feed for feedId: feed1");
    }

    #[tokio::test]
    async fn concurrent_starts_are_serialized() {
        let (feeds, _engine, _events) = registry("sleep 30").await;
        let a = {
            let feeds = feeds.clone();
            tokio::spawn(async move { feeds.start("feed1").await })
        };
        let b = {
            let feeds = feeds.clone();
            tokio::spawn(async move { feeds.start("feed1").await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(feeds.ingest.spawn_count(), 1);
        feeds.stop_all().await;
    }

    #[tokio::test]
    async fn stop_waits_for_inflight_start() {
        let (feeds, _engine, _events) = registry("sleep 30").await;
        let start = {
            let feeds = feeds.clone();
            tokio::spawn(async move { feeds.start("feed1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feeds.state("feed1"), Some(FeedState::Starting));

        feeds.stop("feed1").await.unwrap();
        assert!(start.await.unwrap().is_ok());
        assert_eq!(feeds.state("feed1"), None);
        assert!(!feeds.ingest.is_running("feed1", None));
    }

    #[tokio::test]
    async fn early_exit_fails_start_and_cleans_up() {
        let (feeds, engine, _events) = registry("exit 1").await;
        assert!(matches!(
            feeds.start("feed1").await,
            Err(FeedError::Ingest(IngestError::ExitedEarly { .. }))
        ));
        assert_eq!(feeds.state("feed1"), None);
        assert_eq!(engine.stats().transports, 0);
    }

    #[tokio::test]
    async fn crash_racing_stop_while_starting_settles_once() {
        let (feeds, engine, mut events) = registry("sleep 0.05; exit 3").await;
        let start = {
            let feeds = feeds.clone();
            tokio::spawn(async move { feeds.start("feed1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feeds.state("feed1"), Some(FeedState::Starting));

        let exit = tokio::time::timeout(Duration::from_secs(5), events.exits.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feeds.state("feed1"), Some(FeedState::Starting));

        let stop = {
            let feeds = feeds.clone();
            tokio::spawn(async move { feeds.stop("feed1").await })
        };
        let crash = {
            let feeds = feeds.clone();
            tokio::spawn(async move { feeds.handle_ingest_exit(&exit).await })
        };

        assert!(matches!(
            start.await.unwrap(),
            Err(FeedError::Ingest(IngestError::ExitedEarly { .. }))
        ));
        assert!(matches!(stop.await.unwrap(), Err(FeedError::NotFound(_))));
        assert!(crash.await.unwrap().is_none());
        assert_eq!(feeds.state("feed1"), None);
        assert_eq!(engine.stats(), Default::default());
        assert_eq!(feeds.ingest.spawn_count(), 1);
        assert!(!feeds.ingest.is_running("feed1", None));
    }

    #[tokio::test]
    async fn crash_tears_down_running_feed() {
        let (feeds, engine, mut events) = registry("sleep 0.3; exit 2").await;
        feeds.start("feed1").await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), events.exits.recv())
            .await
            .unwrap()
            .unwrap();
        let stopped = feeds.handle_ingest_exit(&exit).await.unwrap();
        assert_eq!(stopped.feed_id, "feed1");
        assert!(stopped.reason.unwrap().contains("capture"));
        assert_eq!(feeds.state("feed1"), None);
        assert_eq!(engine.stats().producers, 0);

        // Replaying the same exit is a no-op
        assert!(feeds.handle_ingest_exit(&exit).await.is_none());
    }

    #[tokio::test]
    async fn unmapped_source_is_rejected() {
        let (feeds, _engine, _events) = registry("sleep 30").await;
        let mut config = feeds.config.clone();
        config.sources.insert("feed1".to_string(), "rtsp://cam".to_string());
        let feeds = FeedRegistry::new(feeds.engine.clone(), feeds.ingest.clone(), config);
        let err = feeds.start("feed2").await.unwrap_err();
        assert_eq!(err.to_string(), "No ingest source mapped for feedId: feed2");
    }

    #[tokio::test]
    async fn session_binding_conflicts_and_releases() {
        let (feeds, _engine, _events) = registry("sleep 30").await;
        feeds.bind_session_producer("cam", "s1", "p1").await.unwrap();
        assert!(feeds.bind_session_producer("cam", "s1", "p1").await.is_ok());
        assert_eq!(feeds.bound_producers(), vec![("cam".to_string(), "p1".to_string())]);
        assert!(matches!(
            feeds.bind_session_producer("cam", "s2", "p2").await,
            Err(FeedError::Conflict(_))
        ));
        assert!(matches!(feeds.start("cam").await, Err(FeedError::AlreadyRunning(_))));
        assert!(feeds.check_publishable("cam").is_err());

        let stopped = feeds.release_producer("p1").await.unwrap();
        assert_eq!(stopped.reason.as_deref(), Some("producer closed"));
        assert!(feeds.release_producer("p1").await.is_none());
        assert!(feeds.check_publishable("cam").is_ok());
        assert!(feeds.bound_producers().is_empty());
    }
}
