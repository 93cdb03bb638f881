//! Configuration management for feedrelay

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signaling server configuration
    pub server: ServerConfig,

    /// Media engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Ingest pipeline configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Port for signaling, health and metrics
    pub port: u16,

    /// WebSocket signaling path
    #[serde(default = "default_signaling_path")]
    pub signaling_path: String,

    /// Per-connection outbound queue capacity
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Maximum concurrent signaling connections (0 = unlimited)
    #[serde(default)]
    pub max_sessions: usize,
}

/// Media engine worker/router/transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lowest port the worker binds for transports
    #[serde(default = "default_rtc_min_port")]
    pub rtc_min_port: u16,

    /// Highest port the worker binds for transports
    #[serde(default = "default_rtc_max_port")]
    pub rtc_max_port: u16,

    /// Worker log level
    #[serde(default = "default_engine_log_level")]
    pub log_level: String,

    /// Worker log tags
    #[serde(default)]
    pub log_tags: Vec<String>,

    /// Listen address for WebRTC and pipe transports
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    /// Address announced in ICE candidates (e.g. the public IP)
    #[serde(default)]
    pub announced_ip: Option<String>,

    #[serde(default = "default_true")]
    pub enable_udp: bool,

    #[serde(default = "default_true")]
    pub enable_tcp: bool,

    #[serde(default = "default_true")]
    pub prefer_udp: bool,

    /// Initial available outgoing bitrate in bps
    #[serde(default = "default_outgoing_bitrate")]
    pub initial_available_outgoing_bitrate: u32,

    /// Router media codecs
    #[serde(default = "default_media_codecs")]
    pub media_codecs: Vec<MediaCodec>,

    /// Engine notification channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Codec kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Audio,
    Video,
}

/// RTCP feedback entry of a router codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameter: String,
}

impl CodecFeedback {
    pub fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// Router media codec. Serializes to the engine's codec capability shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: CodecKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<CodecFeedback>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: default_rtc_min_port(),
            rtc_max_port: default_rtc_max_port(),
            log_level: default_engine_log_level(),
            log_tags: vec![
                "info".to_string(),
                "ice".to_string(),
                "dtls".to_string(),
                "rtp".to_string(),
                "srtp".to_string(),
                "rtcp".to_string(),
            ],
            listen_ip: default_listen_ip(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: default_outgoing_bitrate(),
            media_codecs: default_media_codecs(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// External capture + encode processes.
///
/// Argument templates may contain `{feed_id}`, `{source}`, `{rtp_ip}`,
/// `{rtp_port}`, `{payload_type}` and `{ssrc}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Capture program (reads the camera, writes JSON frames to stdout)
    #[serde(default = "default_capture_program")]
    pub capture_program: String,

    #[serde(default = "default_capture_args")]
    pub capture_args: Vec<String>,

    /// Encode program (reads JPEG frames on stdin, sends RTP)
    #[serde(default = "default_encode_program")]
    pub encode_program: String,

    #[serde(default = "default_encode_args")]
    pub encode_args: Vec<String>,

    /// Working directory for both processes
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Grace period after spawn before the pipeline is assumed ready
    #[serde(default = "default_ready_grace_ms")]
    pub ready_grace_ms: u64,

    /// How long to wait for a terminated process to exit
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Feed id -> source URL. When non-empty only listed feeds may start.
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            capture_program: default_capture_program(),
            capture_args: default_capture_args(),
            encode_program: default_encode_program(),
            encode_args: default_encode_args(),
            working_dir: None,
            ready_grace_ms: default_ready_grace_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                signaling_path: default_signaling_path(),
                outbound_queue: default_outbound_queue(),
                max_sessions: 0,
            },
            engine: EngineConfig::default(),
            ingest: IngestConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.server.signaling_path.starts_with('/') {
            return Err("Signaling path must start with '/'".into());
        }

        if self.server.outbound_queue == 0 {
            return Err("Outbound queue capacity must be non-zero".into());
        }

        if self.engine.rtc_min_port == 0 || self.engine.rtc_min_port > self.engine.rtc_max_port {
            return Err("Engine rtc port range is empty or inverted".into());
        }

        if self.engine.listen_ip.parse::<std::net::IpAddr>().is_err() {
            return Err("Engine listen_ip must be an IP address".into());
        }

        if self.engine.event_capacity == 0 {
            return Err("Engine event_capacity must be non-zero".into());
        }

        if !self.engine.enable_udp && !self.engine.enable_tcp {
            return Err("Engine must enable UDP, TCP or both".into());
        }

        if self.engine.media_codecs.is_empty() {
            return Err("At least one router media codec is required".into());
        }

        for codec in &self.engine.media_codecs {
            let prefix = match codec.kind {
                CodecKind::Audio => "audio/",
                CodecKind::Video => "video/",
            };
            if !codec.mime_type.to_ascii_lowercase().starts_with(prefix) {
                return Err(format!(
                    "Media codec {} does not match its kind",
                    codec.mime_type
                )
                .into());
            }
            if codec.clock_rate == 0 {
                return Err(format!("Media codec {} has zero clock rate", codec.mime_type).into());
            }
            if codec.kind == CodecKind::Audio && codec.channels.unwrap_or(1) == 0 {
                return Err(format!("Media codec {} has zero channels", codec.mime_type).into());
            }
        }

        if self.ingest.capture_program.trim().is_empty() {
            return Err("Ingest capture_program must not be empty".into());
        }

        if self.ingest.encode_program.trim().is_empty() {
            return Err("Ingest encode_program must not be empty".into());
        }

        if self.ingest.ready_grace_ms == 0 {
            return Err("Ingest ready_grace_ms must be non-zero".into());
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_signaling_path() -> String {
    "/ws".to_string()
}

fn default_outbound_queue() -> usize {
    64
}

fn default_rtc_min_port() -> u16 { 40000 }
fn default_rtc_max_port() -> u16 { 49999 }
fn default_outgoing_bitrate() -> u32 { 1_000_000 }
fn default_ready_grace_ms() -> u64 { 1000 }
fn default_stop_timeout_ms() -> u64 { 2000 }
fn default_event_capacity() -> usize { 1024 }

fn default_engine_log_level() -> String {
    "warn".to_string()
}

fn default_listen_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_capture_program() -> String {
    "python".to_string()
}

fn default_capture_args() -> Vec<String> {
    vec!["feed.py".to_string(), "{feed_id}".to_string(), "{source}".to_string()]
}

fn default_encode_program() -> String {
    "ffmpeg".to_string()
}

fn default_encode_args() -> Vec<String> {
    [
        "-f", "image2pipe",
        "-vcodec", "mjpeg",
        "-i", "-",
        "-c:v", "libx264",
        "-profile:v", "baseline",
        "-pix_fmt", "yuv420p",
        "-preset", "veryfast",
        "-tune", "zerolatency",
        "-payload_type", "{payload_type}",
        "-ssrc", "{ssrc}",
        "-f", "rtp",
        "rtp://{rtp_ip}:{rtp_port}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Opus, VP8 and constrained-baseline H264
pub fn default_media_codecs() -> Vec<MediaCodec> {
    let video_feedback = vec![
        CodecFeedback::new("nack", ""),
        CodecFeedback::new("nack", "pli"),
        CodecFeedback::new("ccm", "fir"),
        CodecFeedback::new("goog-remb", ""),
    ];

    vec![
        MediaCodec {
            kind: CodecKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        },
        MediaCodec {
            kind: CodecKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        MediaCodec {
            kind: CodecKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: params(json!({
                "packetization-mode": 1,
                "profile-level-id": "42001f",
                "level-asymmetry-allowed": 1
            })),
            rtcp_feedback: video_feedback,
        },
    ]
}
