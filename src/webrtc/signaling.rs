//! Signaling protocol
//!
//! Every message is a JSON envelope `{type, data}`. Request fields are read
//! from `data`; older clients put them at the top level of the envelope,
//! which is accepted too (`data` wins on conflicts).

use super::SignalingError;
use crate::engine::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpCapabilitiesFinalized, RtpParameters,
    WebRtcTransportInfo,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Client requests
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    GetRouterRtpCapabilities {},
    CreateProducerTransport {},
    ConnectProducerTransport {
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        feed_id: Option<String>,
    },
    CreateConsumerTransport {
        #[serde(default)]
        feed_id: Option<String>,
    },
    ConnectConsumerTransport {
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        transport_id: Option<String>,
        #[serde(default)]
        feed_id: Option<String>,
    },
    Consume {
        rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        producer_id: Option<String>,
        #[serde(default)]
        feed_id: Option<String>,
    },
    Resume {
        #[serde(default)]
        consumer_id: Option<String>,
        #[serde(default)]
        feed_id: Option<String>,
    },
    CloseTransport {
        transport_id: String,
    },
    StartFeed {
        feed_id: String,
    },
    StopFeed {
        feed_id: String,
    },
    GetFeeds {},
    SubscribeFeed {
        feed_id: String,
    },
    VideoFrame {
        feed_id: String,
        frame: String,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

impl Request {
    /// Every accepted `type` value
    pub const TYPES: &'static [&'static str] = &[
        "getRouterRtpCapabilities",
        "createProducerTransport",
        "connectProducerTransport",
        "produce",
        "createConsumerTransport",
        "connectConsumerTransport",
        "consume",
        "resume",
        "closeTransport",
        "startFeed",
        "stopFeed",
        "getFeeds",
        "subscribeFeed",
        "videoFrame",
        "ping",
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::GetRouterRtpCapabilities {} => "getRouterRtpCapabilities",
            Request::CreateProducerTransport {} => "createProducerTransport",
            Request::ConnectProducerTransport { .. } => "connectProducerTransport",
            Request::Produce { .. } => "produce",
            Request::CreateConsumerTransport { .. } => "createConsumerTransport",
            Request::ConnectConsumerTransport { .. } => "connectConsumerTransport",
            Request::Consume { .. } => "consume",
            Request::Resume { .. } => "resume",
            Request::CloseTransport { .. } => "closeTransport",
            Request::StartFeed { .. } => "startFeed",
            Request::StopFeed { .. } => "stopFeed",
            Request::GetFeeds {} => "getFeeds",
            Request::SubscribeFeed { .. } => "subscribeFeed",
            Request::VideoFrame { .. } => "videoFrame",
            Request::Ping { .. } => "ping",
        }
    }
}

/// Why an inbound text frame produced no request
#[derive(Debug, Clone)]
pub enum ParseError {
    /// Not a JSON envelope; dropped without a reply
    Malformed(String),
    /// Valid envelope, rejected; the error goes back to the sender
    Rejected(SignalingError),
}

/// Parser for WebSocket text frames
pub struct SignalingParser;

impl SignalingParser {
    pub fn parse(text: &str) -> Result<Request, ParseError> {
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        let mut envelope = match value {
            Value::Object(map) => map,
            _ => return Err(ParseError::Malformed("envelope is not an object".to_string())),
        };
        let kind = match envelope.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ParseError::Malformed("envelope has no type".to_string())),
        };

        if !Request::TYPES.contains(&kind.as_str()) {
            return Err(ParseError::Rejected(SignalingError::InvalidMessageType(kind)));
        }

        let data = merge_fields(envelope);
        serde_json::from_value(json!({ "type": kind, "data": data })).map_err(|e| {
            ParseError::Rejected(SignalingError::Validation(format!(
                "Invalid {} request: {}",
                kind, e
            )))
        })
    }
}

/// Top-level fields overlaid by the `data` object
fn merge_fields(mut envelope: Map<String, Value>) -> Map<String, Value> {
    let data = envelope.remove("data");
    let mut merged = envelope;
    if let Some(Value::Object(data)) = data {
        merged.extend(data);
    }
    merged
}

/// Transport parameters plus the feed the transport is for
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    #[serde(flatten)]
    pub info: WebRtcTransportInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribed {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: &'static str,
    pub producer_paused: bool,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
}

/// Server messages
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    RouterRtpCapabilities(RtpCapabilitiesFinalized),
    ProducerTransportCreated(TransportCreated),
    ProducerConnected {
        transport_id: String,
    },
    ProducerCreated {
        id: String,
        kind: MediaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        feed_id: Option<String>,
    },
    ConsumerTransportCreated(TransportCreated),
    ConsumerTransportConnected {
        transport_id: String,
    },
    Subscribed(Subscribed),
    Resumed {
        consumer_id: String,
    },
    TransportClosed {
        transport_id: String,
    },
    FeedStarted {
        feed_id: String,
        producer_id: String,
    },
    FeedStopped {
        feed_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Feeds(Vec<String>),
    NewProducer {
        producer_id: String,
        kind: MediaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        feed_id: Option<String>,
    },
    ProducerClosed {
        consumer_id: String,
        producer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        feed_id: Option<String>,
    },
    VideoFrame {
        feed_id: String,
        frame: String,
    },
    Pong {
        timestamp: u64,
    },
    #[serde(skip_serializing)]
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Frame update as a data URL ready for an `<img>` element
    pub fn video_frame(feed_id: &str, jpeg_base64: &str) -> Self {
        ServerMessage::VideoFrame {
            feed_id: feed_id.to_string(),
            frame: format!("data:image/jpeg;base64,{}", jpeg_base64),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::RouterRtpCapabilities(_) => "routerRtpCapabilities",
            ServerMessage::ProducerTransportCreated(_) => "producerTransportCreated",
            ServerMessage::ProducerConnected { .. } => "producerConnected",
            ServerMessage::ProducerCreated { .. } => "producerCreated",
            ServerMessage::ConsumerTransportCreated(_) => "consumerTransportCreated",
            ServerMessage::ConsumerTransportConnected { .. } => "consumerTransportConnected",
            ServerMessage::Subscribed(_) => "subscribed",
            ServerMessage::Resumed { .. } => "resumed",
            ServerMessage::TransportClosed { .. } => "transportClosed",
            ServerMessage::FeedStarted { .. } => "feedStarted",
            ServerMessage::FeedStopped { .. } => "feedStopped",
            ServerMessage::Feeds(_) => "feeds",
            ServerMessage::NewProducer { .. } => "newProducer",
            ServerMessage::ProducerClosed { .. } => "producerClosed",
            ServerMessage::VideoFrame { .. } => "videoFrame",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize to JSON. Errors carry the message both at the top level
    /// and under `data`.
    pub fn to_json(&self) -> Result<String, SignalingError> {
        let result = match self {
            ServerMessage::Error { message } => serde_json::to_string(&json!({
                "type": "error",
                "message": message,
                "data": { "message": message },
            })),
            other => serde_json::to_string(other),
        };
        result.map_err(|e| SignalingError::Validation(format!("Failed to serialize message: {}", e)))
    }
}

impl From<&SignalingError> for ServerMessage {
    fn from(e: &SignalingError) -> Self {
        ServerMessage::error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::ErrorCategory;

    #[test]
    fn parses_bare_envelope() {
        let req = SignalingParser::parse(r#"{"type":"getRouterRtpCapabilities"}"#).unwrap();
        assert!(matches!(req, Request::GetRouterRtpCapabilities {}));
    }

    #[test]
    fn parses_fields_from_data() {
        let req =
            SignalingParser::parse(r#"{"type":"startFeed","data":{"feedId":"feed1"}}"#).unwrap();
        match req {
            Request::StartFeed { feed_id } => assert_eq!(feed_id, "feed1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn top_level_fields_are_accepted_and_data_wins() {
        let req = SignalingParser::parse(r#"{"type":"stopFeed","feedId":"legacy"}"#).unwrap();
        assert!(matches!(req, Request::StopFeed { ref feed_id } if feed_id == "legacy"));

        let req = SignalingParser::parse(
            r#"{"type":"stopFeed","feedId":"legacy","data":{"feedId":"current"}}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::StopFeed { ref feed_id } if feed_id == "current"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            SignalingParser::parse("not json"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            SignalingParser::parse("[1,2]"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            SignalingParser::parse(r#"{"data":{}}"#),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        match SignalingParser::parse(r#"{"type":"teleport","data":{}}"#) {
            Err(ParseError::Rejected(e)) => {
                assert_eq!(e.to_string(), "Invalid message type");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_field_is_validation_error() {
        match SignalingParser::parse(r#"{"type":"startFeed","data":{}}"#) {
            Err(ParseError::Rejected(e)) => assert_eq!(e.category(), ErrorCategory::Validation),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_consume_capabilities() {
        let text = r#"{"type":"consume","data":{"feedId":"cam","rtpCapabilities":{"codecs":[
            {"kind":"video","mimeType":"video/VP8","clockRate":90000,"preferredPayloadType":96,
             "parameters":{},"rtcpFeedback":[]}
        ],"headerExtensions":[]}}}"#;
        match SignalingParser::parse(text).unwrap() {
            Request::Consume { rtp_capabilities, producer_id, feed_id } => {
                assert_eq!(rtp_capabilities.codecs.len(), 1);
                assert!(producer_id.is_none());
                assert_eq!(feed_id.as_deref(), Some("cam"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_carries_both_shapes() {
        let json = ServerMessage::error("Feed already running").to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "Feed already running");
        assert_eq!(value["data"]["message"], "Feed already running");
    }

    #[test]
    fn responses_are_adjacently_tagged() {
        let json = ServerMessage::FeedStarted {
            feed_id: "feed1".into(),
            producer_id: "p1".into(),
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "feedStarted");
        assert_eq!(value["data"]["feedId"], "feed1");
        assert_eq!(value["data"]["producerId"], "p1");

        let json = ServerMessage::Feeds(vec!["a".into(), "b".into()]).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["data"], json!(["a", "b"]));

        let json = ServerMessage::FeedStopped { feed_id: "f".into(), reason: None }
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert!(value["data"].get("reason").is_none());
    }

    #[test]
    fn video_frame_is_data_url() {
        match ServerMessage::video_frame("cam", "aGk=") {
            ServerMessage::VideoFrame { frame, .. } => {
                assert_eq!(frame, "data:image/jpeg;base64,aGk=")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn type_names_cover_all_requests() {
        for kind in Request::TYPES {
            assert!(!kind.is_empty());
        }
        let req = SignalingParser::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(req.type_name(), "ping");
    }
}
