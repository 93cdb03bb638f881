//! Ingest supervisor: one capture + encode pipeline per feed

use super::process::{ChildIo, IngestProcess, ProcessStatus, Stage, StdioPlan};
use super::{IngestArgs, IngestError};
use crate::config::IngestConfig;
use base64::Engine;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Notify};

/// Capacity of the captured-frame channel towards the broadcast bus
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// An unexpected exit of one pipeline stage
#[derive(Debug, Clone)]
pub struct IngestExit {
    pub feed_id: String,
    pub generation: u64,
    pub stage: Stage,
    pub status: ProcessStatus,
}

/// A frame read from a capture stage
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub feed_id: String,
    /// Base64 JPEG as written by the capture stage
    pub jpeg_base64: String,
    pub offer: FrameOffer,
}

/// Result of handing a frame to an encode stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOffer {
    /// Stored for the encoder
    Queued,
    /// Stored, replacing a frame the encoder had not picked up yet
    Replaced,
    /// No open encoder input; frame dropped
    NotWritable,
}

impl FrameOffer {
    pub fn dropped(&self) -> bool {
        !matches!(self, FrameOffer::Queued)
    }
}

/// Single-slot, most-recent-wins handoff to the encoder's stdin
struct LatestFrame {
    slot: Mutex<Option<Bytes>>,
    notify: Notify,
    open: AtomicBool,
}

impl LatestFrame {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            open: AtomicBool::new(true),
        }
    }

    fn offer(&self, frame: Bytes) -> FrameOffer {
        if !self.open.load(Ordering::Acquire) {
            return FrameOffer::NotWritable;
        }
        let previous = self.slot.lock().replace(frame);
        self.notify.notify_one();
        if previous.is_some() {
            FrameOffer::Replaced
        } else {
            FrameOffer::Queued
        }
    }

    fn take(&self) -> Option<Bytes> {
        self.slot.lock().take()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.slot.lock().take();
        self.notify.notify_one();
    }
}

struct IngestPipeline {
    generation: u64,
    capture: IngestProcess,
    encode: IngestProcess,
    stopping: Arc<AtomicBool>,
    frames: Arc<LatestFrame>,
}

impl IngestPipeline {
    fn is_running(&self) -> bool {
        self.capture.is_running() && self.encode.is_running()
    }
}

/// Receivers for supervisor notifications
pub struct IngestEvents {
    pub exits: mpsc::UnboundedReceiver<IngestExit>,
    pub frames: mpsc::Receiver<CapturedFrame>,
}

#[derive(Debug, Deserialize)]
struct CaptureLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<CaptureFrameData>,
}

#[derive(Debug, Deserialize)]
struct CaptureFrameData {
    #[serde(rename = "feedId", default)]
    feed_id: Option<String>,
    frame: String,
}

pub struct IngestSupervisor {
    config: IngestConfig,
    pipelines: Mutex<HashMap<String, IngestPipeline>>,
    next_generation: AtomicU64,
    spawned: AtomicUsize,
    exits: mpsc::UnboundedSender<IngestExit>,
    frames: mpsc::Sender<CapturedFrame>,
}

impl IngestSupervisor {
    pub fn new(config: IngestConfig) -> (Arc<Self>, IngestEvents) {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let supervisor = Arc::new(Self {
            config,
            pipelines: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            spawned: AtomicUsize::new(0),
            exits: exits_tx,
            frames: frames_tx,
        });
        (
            supervisor,
            IngestEvents {
                exits: exits_rx,
                frames: frames_rx,
            },
        )
    }

    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.config.ready_grace_ms)
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.config.stop_timeout_ms)
    }

    /// Spawn the encode and capture stages for a feed.
    ///
    /// Returns the pipeline generation; exits carry it so that a stale exit
    /// from an earlier run is never mistaken for a crash of this one.
    pub fn start(&self, args: &IngestArgs) -> Result<u64, IngestError> {
        let feed_id = args.feed_id.clone();
        if self.pipelines.lock().contains_key(&feed_id) {
            return Err(IngestError::AlreadyRunning(feed_id));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let stopping = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(LatestFrame::new());
        let working_dir = self.config.working_dir.as_deref();

        let (encode, encode_io) = IngestProcess::spawn(
            Stage::Encode,
            &feed_id,
            &self.config.encode_program,
            &args.expand_all(&self.config.encode_args),
            working_dir,
            StdioPlan { stdin: true, stdout: false },
            self.stop_timeout(),
            self.exit_callback(&feed_id, generation, stopping.clone(), frames.clone()),
        )?;

        let capture = IngestProcess::spawn(
            Stage::Capture,
            &feed_id,
            &self.config.capture_program,
            &args.expand_all(&self.config.capture_args),
            working_dir,
            StdioPlan { stdin: false, stdout: true },
            self.stop_timeout(),
            self.exit_callback(&feed_id, generation, stopping.clone(), frames.clone()),
        );
        let (capture, capture_io) = match capture {
            Ok(spawned) => spawned,
            Err(e) => {
                stopping.store(true, Ordering::SeqCst);
                encode.terminate();
                return Err(e);
            }
        };

        self.attach_io(&feed_id, encode_io, capture_io, frames.clone());

        let pipeline = IngestPipeline {
            generation,
            capture,
            encode,
            stopping,
            frames,
        };

        let mut pipelines = self.pipelines.lock();
        if pipelines.contains_key(&feed_id) {
            pipeline.stopping.store(true, Ordering::SeqCst);
            pipeline.capture.terminate();
            pipeline.encode.terminate();
            return Err(IngestError::AlreadyRunning(feed_id));
        }
        pipelines.insert(feed_id.clone(), pipeline);
        drop(pipelines);

        self.spawned.fetch_add(1, Ordering::SeqCst);
        info!("Ingest pipeline for {} started (generation {})", feed_id, generation);
        Ok(generation)
    }

    fn exit_callback(
        &self,
        feed_id: &str,
        generation: u64,
        stopping: Arc<AtomicBool>,
        frames: Arc<LatestFrame>,
    ) -> Box<dyn FnOnce(Stage, ProcessStatus) + Send + 'static> {
        let feed_id = feed_id.to_string();
        let exits = self.exits.clone();
        Box::new(move |stage, status| {
            if stage == Stage::Encode {
                frames.close();
            }
            if stopping.load(Ordering::SeqCst) {
                return;
            }
            warn!(
                "Ingest {} stage for {} {} unexpectedly",
                stage,
                feed_id,
                status.describe()
            );
            let _ = exits.send(IngestExit {
                feed_id,
                generation,
                stage,
                status,
            });
        })
    }

    fn attach_io(
        &self,
        feed_id: &str,
        encode_io: ChildIo,
        capture_io: ChildIo,
        frames: Arc<LatestFrame>,
    ) {
        match encode_io.stdin {
            Some(stdin) => {
                tokio::spawn(pump_frames(stdin, frames.clone(), feed_id.to_string()));
            }
            None => frames.close(),
        }
        if let Some(stdout) = capture_io.stdout {
            tokio::spawn(read_capture(
                stdout,
                feed_id.to_string(),
                frames,
                self.frames.clone(),
            ));
        }
    }

    /// Terminate both stages. Returns false if nothing was running.
    ///
    /// Already-exited processes are ignored; this never fails.
    pub async fn stop(&self, feed_id: &str) -> bool {
        let pipeline = match self.pipelines.lock().remove(feed_id) {
            Some(pipeline) => pipeline,
            None => return false,
        };
        pipeline.stopping.store(true, Ordering::SeqCst);
        pipeline.frames.close();
        pipeline.capture.terminate();
        pipeline.encode.terminate();

        let wait = async {
            pipeline.capture.wait().await;
            pipeline.encode.wait().await;
        };
        if tokio::time::timeout(self.stop_timeout() * 2, wait).await.is_err() {
            warn!("Ingest pipeline for {} did not stop in time", feed_id);
        }
        info!("Ingest pipeline for {} stopped", feed_id);
        true
    }

    /// Both stages alive, and of the given generation when one is supplied
    pub fn is_running(&self, feed_id: &str, generation: Option<u64>) -> bool {
        match self.pipelines.lock().get(feed_id) {
            Some(p) => generation.map_or(true, |g| g == p.generation) && p.is_running(),
            None => false,
        }
    }

    /// The first stage found dead, if any
    pub fn dead_stage(&self, feed_id: &str) -> Option<Stage> {
        let pipelines = self.pipelines.lock();
        let p = pipelines.get(feed_id)?;
        if !p.capture.is_running() {
            Some(Stage::Capture)
        } else if !p.encode.is_running() {
            Some(Stage::Encode)
        } else {
            None
        }
    }

    /// Offer a decoded JPEG frame to the feed's encoder
    pub fn submit_frame(&self, feed_id: &str, frame: Bytes) -> FrameOffer {
        let frames = match self.pipelines.lock().get(feed_id) {
            Some(p) => p.frames.clone(),
            None => return FrameOffer::NotWritable,
        };
        let offer = frames.offer(frame);
        if offer == FrameOffer::NotWritable {
            debug!("Encoder input for {} not writable, frame dropped", feed_id);
        }
        offer
    }

    pub fn running_feeds(&self) -> Vec<String> {
        self.pipelines.lock().keys().cloned().collect()
    }

    /// Number of pipelines spawned since startup
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

/// Write the most recent frame to the encoder until its input closes
async fn pump_frames(mut stdin: ChildStdin, frames: Arc<LatestFrame>, feed_id: String) {
    loop {
        frames.notify.notified().await;
        if !frames.is_open() {
            break;
        }
        let frame = match frames.take() {
            Some(frame) => frame,
            None => continue,
        };
        if let Err(e) = stdin.write_all(&frame).await {
            warn!("Encoder input for {} closed: {}", feed_id, e);
            break;
        }
    }
    frames.close();
}

/// Parse capture output lines into frames
async fn read_capture(
    stdout: ChildStdout,
    feed_id: String,
    frames: Arc<LatestFrame>,
    out: mpsc::Sender<CapturedFrame>,
) {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: CaptureLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("[{} capture] invalid output line: {}", feed_id, e);
                continue;
            }
        };
        let data = match (parsed.kind.as_str(), parsed.data) {
            ("videoFrame", Some(data)) => data,
            (kind, _) => {
                debug!("[{} capture] ignoring message type {}", feed_id, kind);
                continue;
            }
        };
        if let Some(other) = data.feed_id.as_deref() {
            if other != feed_id {
                debug!("[{} capture] frame labelled {}", feed_id, other);
            }
        }
        let jpeg = match engine.decode(data.frame.as_bytes()) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("[{} capture] frame is not valid base64: {}", feed_id, e);
                continue;
            }
        };
        let offer = frames.offer(Bytes::from(jpeg));
        if offer == FrameOffer::NotWritable {
            debug!("Encoder input for {} not writable, frame dropped", feed_id);
        }
        // The bus side is best-effort as well
        let _ = out.try_send(CapturedFrame {
            feed_id: feed_id.clone(),
            jpeg_base64: data.frame,
            offer,
        });
    }
    debug!("[{} capture] output closed", feed_id);
}
