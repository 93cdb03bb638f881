//! End-to-end signaling over a real WebSocket

use feedrelay::config::Config;
use feedrelay::web::{serve, spawn_event_pumps, SharedState};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (Arc<SharedState>, String) {
    start_server_with(Config::default()).await
}

async fn start_server_with(mut config: Config) -> (Arc<SharedState>, String) {
    config.ingest.capture_program = "sh".to_string();
    config.ingest.capture_args = vec!["-c".to_string(), "sleep 30".to_string()];
    config.ingest.encode_program = "sh".to_string();
    config.ingest.encode_args = vec!["-c".to_string(), "cat > /dev/null".to_string()];
    config.ingest.ready_grace_ms = 150;
    config.ingest.stop_timeout_ms = 1000;

    let (state, ingest_events) = SharedState::new(config).unwrap();
    let state = Arc::new(state);
    spawn_event_pumps(state.clone(), ingest_events);
    state.engine.initialize().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state).await;
    });
    (state, format!("ws://{}/ws", addr))
}

async fn connect(url: &str) -> Client {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, message: Value) {
    ws.send(Message::Text(message.to_string())).await.unwrap();
}

/// Next text message as JSON
async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Skip messages until one of the given type arrives
async fn expect_type(ws: &mut Client, kind: &str) -> Value {
    loop {
        let msg = next_json(ws).await;
        if msg["type"] == kind {
            return msg;
        }
    }
}

fn dtls() -> Value {
    let fingerprint: Vec<String> = (0..32).map(|i| format!("{:02X}", i)).collect();
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint.join(":") }]
    })
}

#[tokio::test]
async fn router_capabilities() {
    let (_state, url) = start_server().await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({ "type": "getRouterRtpCapabilities" })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "routerRtpCapabilities");
    let codecs = msg["data"]["codecs"].as_array().unwrap();
    for mime in ["audio/opus", "video/VP8", "video/H264"] {
        assert!(codecs.iter().any(|c| c["mimeType"] == mime), "missing {}", mime);
    }
}

#[tokio::test]
async fn connections_over_the_limit_are_refused() {
    let mut config = Config::default();
    config.server.max_sessions = 1;
    let (state, url) = start_server_with(config).await;

    let mut first = connect(&url).await;
    send(&mut first, json!({ "type": "ping", "data": { "timestamp": 1 } })).await;
    expect_type(&mut first, "pong").await;

    let mut second = connect(&url).await;
    let msg = next_json(&mut second).await;
    assert_eq!(msg["type"], "error");
    assert_eq!(msg["message"], "Server is full");
    assert_eq!(state.sessions.count(), 1);
}

#[tokio::test]
async fn unknown_type_and_malformed_input() {
    let (_state, url) = start_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    send(&mut ws, json!({ "type": "bogus" })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "error");
    assert_eq!(msg["message"], "Invalid message type");
    assert_eq!(msg["data"]["message"], "Invalid message type");

    send(&mut ws, json!({ "type": "ping", "data": { "timestamp": 7 } })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "pong");
    assert_eq!(msg["data"]["timestamp"], 7);
}

#[cfg(unix)]
#[tokio::test]
async fn duplicate_start_feed_is_rejected() {
    let (state, url) = start_server().await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({ "type": "startFeed", "data": { "feedId": "feed1" } })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "feedStarted");
    assert_eq!(msg["data"]["feedId"], "feed1");

    send(&mut ws, json!({ "type": "startFeed", "data": { "feedId": "feed1" } })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "error");
    assert_eq!(msg["message"], "Feed already running");
    assert_eq!(state.ingest.spawn_count(), 1);

    send(&mut ws, json!({ "type": "getFeeds" })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["data"], json!(["feed1"]));

    send(&mut ws, json!({ "type": "stopFeed", "data": { "feedId": "feed1" } })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "feedStopped");
    assert!(state.feeds.feed_ids().is_empty());
}

#[tokio::test]
async fn stop_feed_without_record() {
    let (_state, url) = start_server().await;
    let mut ws = connect(&url).await;

    send(&mut ws, json!({ "type": "stopFeed", "data": { "feedId": "feed1" } })).await;
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["type"], "error");
    assert_eq!(msg["message"], "No active feed for feedId: feed1");
}

#[tokio::test]
async fn publisher_disconnect_closes_viewer_consumers() {
    let (state, url) = start_server().await;
    let mut publisher = connect(&url).await;
    let mut viewer = connect(&url).await;

    // Round trip so the viewer is registered before anything is announced
    send(&mut viewer, json!({ "type": "ping", "data": { "timestamp": 1 } })).await;
    expect_type(&mut viewer, "pong").await;

    send(&mut publisher, json!({ "type": "getRouterRtpCapabilities" })).await;
    let caps = next_json(&mut publisher).await["data"].clone();
    let vp8 = caps["codecs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["mimeType"] == "video/VP8")
        .unwrap()
        .clone();

    send(&mut publisher, json!({ "type": "createProducerTransport" })).await;
    let created = expect_type(&mut publisher, "producerTransportCreated").await;
    assert!(created["data"]["id"].is_string());
    assert!(created["data"]["iceCandidates"].is_array());

    send(
        &mut publisher,
        json!({ "type": "connectProducerTransport", "data": { "dtlsParameters": dtls() } }),
    )
    .await;
    expect_type(&mut publisher, "producerConnected").await;

    send(
        &mut publisher,
        json!({
            "type": "produce",
            "data": {
                "kind": "video",
                "feedId": "lobby",
                "rtpParameters": {
                    "codecs": [{
                        "mimeType": "video/VP8",
                        "payloadType": vp8["preferredPayloadType"],
                        "clockRate": 90000,
                        "parameters": {},
                        "rtcpFeedback": []
                    }],
                    "headerExtensions": [],
                    "encodings": [{ "ssrc": 1111 }],
                    "rtcp": { "cname": "publisher", "reducedSize": true }
                }
            }
        }),
    )
    .await;
    let produced = expect_type(&mut publisher, "producerCreated").await;
    let producer_id = produced["data"]["id"].as_str().unwrap().to_string();

    let announced = expect_type(&mut viewer, "newProducer").await;
    assert_eq!(announced["data"]["producerId"], producer_id.as_str());
    assert_eq!(announced["data"]["feedId"], "lobby");

    send(
        &mut viewer,
        json!({ "type": "createConsumerTransport", "data": { "feedId": "lobby" } }),
    )
    .await;
    expect_type(&mut viewer, "consumerTransportCreated").await;
    send(
        &mut viewer,
        json!({
            "type": "connectConsumerTransport",
            "data": { "feedId": "lobby", "dtlsParameters": dtls() }
        }),
    )
    .await;
    expect_type(&mut viewer, "consumerTransportConnected").await;

    send(
        &mut viewer,
        json!({ "type": "consume", "data": { "feedId": "lobby", "rtpCapabilities": caps } }),
    )
    .await;
    let subscribed = expect_type(&mut viewer, "subscribed").await;
    assert_eq!(subscribed["data"]["producerId"], producer_id.as_str());
    assert_eq!(subscribed["data"]["paused"], true);
    assert_eq!(subscribed["data"]["type"], "simple");
    let consumer_id = subscribed["data"]["id"].as_str().unwrap().to_string();

    send(&mut viewer, json!({ "type": "resume", "data": { "feedId": "lobby" } })).await;
    let resumed = expect_type(&mut viewer, "resumed").await;
    assert_eq!(resumed["data"]["consumerId"], consumer_id.as_str());
    assert_eq!(state.engine.consumer_paused(&consumer_id), Some(false));

    publisher.close(None).await.unwrap();

    let closed = expect_type(&mut viewer, "producerClosed").await;
    assert_eq!(closed["data"]["consumerId"], consumer_id.as_str());
    assert_eq!(closed["data"]["producerId"], producer_id.as_str());
    let stopped = expect_type(&mut viewer, "feedStopped").await;
    assert_eq!(stopped["data"]["feedId"], "lobby");

    assert_eq!(state.engine.stats().consumers, 0);
    assert_eq!(state.engine.stats().producers, 0);
    assert!(state.feeds.feed_ids().is_empty());
}
