//! End-to-end signaling over a real WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use weir_server::bridge::{MockConnector, MockPipeline};
use weir_server::config::Config;
use weir_server::signal::AppState;

const ANSWER_TEMPLATE: &str = "v=0\r\n\
    c=IN IP4 192.0.2.7\r\n\
    t=0 0\r\n\
    m=video 50000 RTP/AVPF 103\r\n\
    a=rtcp:50001\r\n\
    a=rtpmap:103 VP8/90000\r\n\
    a=ssrc:445566 cname:pipeline\r\n";

async fn serve() -> String {
    let mock = Arc::new(MockPipeline::new(ANSWER_TEMPLATE));
    let state = AppState::new(Arc::new(Config::default()), Arc::new(MockConnector(mock)));
    let app = weir_server::app(state, std::path::Path::new("public"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Next text frame as JSON, or `None` once the socket is closed.
async fn next_json(ws: &mut Ws) -> Option<serde_json::Value> {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame")?
        {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Send a correlated request and wait for its reply. Notifications that
/// arrive in between are collected, not lost; pushed frames from separate
/// forwarder tasks may interleave with replies in any order.
async fn request(
    ws: &mut Ws,
    request: serde_json::Value,
) -> (serde_json::Value, Vec<serde_json::Value>) {
    let id = request.get("id").and_then(|i| i.as_u64()).unwrap();
    ws.send(Message::Text(request.to_string())).await.unwrap();
    let mut notifications = Vec::new();
    loop {
        let frame = next_json(ws).await.expect("socket closed before reply");
        if frame.get("id").and_then(|i| i.as_u64()) == Some(id) {
            return (frame, notifications);
        }
        notifications.push(frame);
    }
}

/// Keep reading until a notification of `kind` shows up, starting from
/// frames already collected.
async fn wait_for_notification(
    ws: &mut Ws,
    mut seen: Vec<serde_json::Value>,
    kind: &str,
) -> serde_json::Value {
    loop {
        if let Some(pos) = seen.iter().position(|f| f["type"] == kind) {
            return seen.swap_remove(pos);
        }
        seen.push(next_json(ws).await.expect("socket closed while waiting"));
    }
}

#[tokio::test]
async fn session_negotiation_round_trip() {
    let url = serve().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let (reply, _) = request(&mut ws, serde_json::json!({ "id": 1, "type": "start-session" })).await;
    assert_eq!(reply["type"], "response");
    let codecs = reply["data"]["codecs"].as_array().unwrap();
    assert!(codecs.iter().any(|c| c["mimeType"] == "audio/opus"));
    assert!(codecs.iter().any(|c| c["mimeType"] == "video/VP8"));

    let (reply, _) = request(
        &mut ws,
        serde_json::json!({ "id": 2, "type": "start-client-transport" }),
    )
    .await;
    assert_eq!(reply["type"], "response");
    assert!(reply["data"]["iceParameters"]["usernameFragment"].is_string());
    assert!(reply["data"]["dtlsParameters"]["fingerprints"].is_array());

    // Producing before the transport is connected is an ordering error.
    let producer_request = serde_json::json!({
        "id": 3,
        "type": "start-producer",
        "kind": "video",
        "rtp_parameters": {
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 120,
                "clockRate": 90000
            }],
            "encodings": [{ "ssrc": 777 }],
            "rtcp": { "cname": "browser" }
        }
    });
    let (reply, _) = request(&mut ws, producer_request.clone()).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["error"].as_str().unwrap().contains("ordering"));

    ws.send(Message::Text(
        serde_json::json!({
            "type": "connect-client-transport",
            "dtls_parameters": {
                "role": "client",
                "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }]
            }
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let mut producer_request = producer_request;
    producer_request["id"] = serde_json::json!(4);
    let (reply, seen) = request(&mut ws, producer_request).await;
    assert_eq!(reply["type"], "response");
    assert!(reply["data"]["id"].is_string());

    let notification = wait_for_notification(&mut ws, seen, "producer-ready").await;
    assert_eq!(notification["kind"], "video");
}

#[tokio::test]
async fn second_client_is_rejected_without_disturbing_the_first() {
    let url = serve().await;
    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (reply, _) =
        request(&mut first, serde_json::json!({ "id": 1, "type": "start-session" })).await;
    assert_eq!(reply["type"], "response");

    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let frame = next_json(&mut second).await.expect("expected a rejection frame");
    assert_eq!(frame["type"], "error");
    assert!(frame["message"]
        .as_str()
        .unwrap()
        .contains("another client is already connected"));
    // The server closes the second socket after the rejection.
    assert!(next_json(&mut second).await.is_none());

    // The first session is untouched: a duplicate start-session is an
    // ordering error, proving the router created earlier still exists.
    let (reply, _) =
        request(&mut first, serde_json::json!({ "id": 2, "type": "start-session" })).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["error"].as_str().unwrap().contains("already started"));
}

#[tokio::test]
async fn disconnect_releases_the_slot() {
    let url = serve().await;
    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (reply, _) =
        request(&mut first, serde_json::json!({ "id": 1, "type": "start-session" })).await;
    assert_eq!(reply["type"], "response");
    first.close(None).await.unwrap();

    // Reconnecting may race the server-side teardown briefly.
    for attempt in 0.. {
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(Message::Text(
            serde_json::json!({ "id": 1, "type": "start-session" }).to_string(),
        ))
        .await
        .unwrap();
        let mut rejected = false;
        while let Some(frame) = next_json(&mut ws).await {
            if frame.get("id").and_then(|i| i.as_u64()) == Some(1) {
                assert_eq!(frame["type"], "response");
                return;
            }
            if frame["type"] == "error" && frame.get("message").is_some() {
                rejected = true;
                break;
            }
        }
        assert!(rejected, "socket closed without a reply");
        assert!(attempt < 50, "session slot never released");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
