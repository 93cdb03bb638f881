//! Engine fixtures for unit tests

use super::{DtlsParameters, MediaEngine, RtpCapabilities, RtpParameters};
use crate::config::EngineConfig;
use serde_json::{json, Value};

pub async fn engine() -> MediaEngine {
    engine_with(EngineConfig::default()).await
}

pub async fn engine_with(settings: EngineConfig) -> MediaEngine {
    let engine = MediaEngine::new(settings);
    engine.initialize().await.unwrap();
    engine
}

/// Client DTLS parameters with a well-formed sha-256 fingerprint
pub fn dtls() -> DtlsParameters {
    serde_json::from_value(dtls_json()).unwrap()
}

pub fn dtls_json() -> Value {
    let fingerprint: Vec<String> = (0..32).map(|i| format!("{:02X}", i)).collect();
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint.join(":") }],
    })
}

fn router_codec(engine: &MediaEngine, mime: &str) -> Value {
    let caps = serde_json::to_value(engine.router_capabilities().unwrap()).unwrap();
    caps["codecs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["mimeType"].as_str() == Some(mime))
        .cloned()
        .unwrap()
}

/// Single-encoding producer parameters for one of the router's codecs
pub fn producer_parameters(engine: &MediaEngine, mime: &str, ssrc: u32) -> RtpParameters {
    let codec = router_codec(engine, mime);
    let mut entry = json!({
        "mimeType": mime,
        "payloadType": codec["preferredPayloadType"],
        "clockRate": codec["clockRate"],
        "parameters": codec.get("parameters").cloned().unwrap_or_else(|| json!({})),
        "rtcpFeedback": [],
    });
    if let Some(channels) = codec.get("channels") {
        entry["channels"] = channels.clone();
    }
    serde_json::from_value(json!({
        "codecs": [entry],
        "headerExtensions": [],
        "encodings": [{ "ssrc": ssrc }],
        "rtcp": { "cname": format!("test-{}", ssrc), "reducedSize": true },
    }))
    .unwrap()
}

/// Client capabilities mirroring the router's, optionally limited to one mime type
pub fn client_capabilities(engine: &MediaEngine, only: Option<&str>) -> RtpCapabilities {
    let caps = serde_json::to_value(engine.router_capabilities().unwrap()).unwrap();
    let codecs: Vec<Value> = caps["codecs"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| match only {
            Some(mime) => c["mimeType"].as_str() == Some(mime),
            None => true,
        })
        .cloned()
        .collect();
    serde_json::from_value(json!({ "codecs": codecs, "headerExtensions": [] })).unwrap()
}
