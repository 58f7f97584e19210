//! WebSocket signaling.
//!
//! One client at a time drives the session over a single socket. Two
//! message shapes travel on it: correlated requests (`{id, type, ...}` in,
//! `{id, type, data|error}` out) and one-way notifications in both
//! directions. Everything stateful is delegated to [`Session`]; this
//! module only parses, dispatches and replies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::bridge::PipelineConnector;
use crate::config::Config;
use crate::recorder::RecorderKind;
use crate::session::Session;
use weir_common::{LogSink, Result};
use weir_core::media::MediaKind;
use weir_core::rtp::{RtpCapabilities, RtpParameters};
use weir_core::transport::DtlsParameters;

/// Requests carry an `id` and expect a correlated reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    StartSession {
        #[serde(default)]
        video_codec: Option<String>,
    },
    StartClientTransport,
    StartProducer {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    StartBridge {
        #[serde(default)]
        enable_srtp: bool,
    },
    StartPeerTransport,
    StartPeerConsumer {
        rtp_capabilities: RtpCapabilities,
    },
}

/// Fire-and-forget messages from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientNotification {
    ConnectClientTransport { dtls_parameters: DtlsParameters },
    ConnectPeerTransport { dtls_parameters: DtlsParameters },
    StartRecording { recorder: RecorderKind },
    StopRecording,
    Debug,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerNotification {
    ProducerReady { kind: MediaKind },
    Log { line: String },
    Error { message: String },
}

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Mutex<Session>>,
    pub log: LogSink,
    client_connected: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Arc<Config>, connector: Arc<dyn PipelineConnector>) -> Self {
        let log = LogSink::new();
        Self {
            session: Arc::new(Mutex::new(Session::new(config, log.clone(), connector))),
            log,
            client_connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Single-client contract: a second connection is told why and closed,
    // without touching the first session.
    if state.client_connected.swap(true, Ordering::SeqCst) {
        warn!("rejecting second signaling connection");
        let rejection = ServerNotification::Error {
            message: "another client is already connected".into(),
        };
        if let Ok(json) = serde_json::to_string(&rejection) {
            let _ = socket.send(Message::Text(json)).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!("signaling client connected");

    let (mut sink, mut source) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Mirror of the session log to the client.
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
    state.log.attach(log_tx);
    let log_outbox = outbox.clone();
    let log_forwarder = tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            if send_notification(&log_outbox, &ServerNotification::Log { line }).is_err() {
                break;
            }
        }
    });

    // Session-originated notifications (producer-ready and friends).
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerNotification>();
    state.session.lock().await.attach_events(event_tx);
    let event_outbox = outbox.clone();
    let event_forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if send_notification(&event_outbox, &event).is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = source.next().await {
        match msg {
            Message::Text(text) => handle_frame(&state, &outbox, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!("signaling client disconnected, releasing session");
    state.log.detach();
    state.session.lock().await.teardown().await;
    state.client_connected.store(false, Ordering::SeqCst);
    writer.abort();
    log_forwarder.abort();
    event_forwarder.abort();
}

fn send_notification(
    outbox: &mpsc::UnboundedSender<Message>,
    notification: &ServerNotification,
) -> std::result::Result<(), ()> {
    let json = serde_json::to_string(notification).map_err(|_| ())?;
    outbox.send(Message::Text(json)).map_err(|_| ())
}

async fn handle_frame(state: &AppState, outbox: &mpsc::UnboundedSender<Message>, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            let _ = send_notification(
                outbox,
                &ServerNotification::Error {
                    message: format!("unparseable message: {e}"),
                },
            );
            return;
        }
    };

    match value.get("id").and_then(|id| id.as_u64()) {
        Some(id) => {
            let reply = match serde_json::from_value::<ClientRequest>(value) {
                Ok(request) => match dispatch_request(state, request).await {
                    Ok(data) => serde_json::json!({ "id": id, "type": "response", "data": data }),
                    Err(e) => {
                        fail_fast_if_fatal(state, &e);
                        serde_json::json!({ "id": id, "type": "error", "error": e.to_string() })
                    }
                },
                Err(e) => {
                    serde_json::json!({ "id": id, "type": "error", "error": format!("bad request: {e}") })
                }
            };
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = outbox.send(Message::Text(json));
            }
        }
        None => {
            let outcome = match serde_json::from_value::<ClientNotification>(value) {
                Ok(notification) => dispatch_notification(state, notification).await,
                Err(e) => {
                    let _ = send_notification(
                        outbox,
                        &ServerNotification::Error {
                            message: format!("bad notification: {e}"),
                        },
                    );
                    return;
                }
            };
            if let Err(e) = outcome {
                fail_fast_if_fatal(state, &e);
                state.log.error(format!("{e}"));
                let _ = send_notification(
                    outbox,
                    &ServerNotification::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
    }
}

/// An engine failure means media sockets cannot be created on this host;
/// nothing the session can do will recover, so stop the process loudly.
fn fail_fast_if_fatal(state: &AppState, error: &weir_common::Error) {
    if error.is_fatal() {
        state.log.error(format!("fatal engine error: {error}"));
        std::process::exit(1);
    }
}

async fn dispatch_request(state: &AppState, request: ClientRequest) -> Result<serde_json::Value> {
    let mut session = state.session.lock().await;
    match request {
        ClientRequest::StartSession { video_codec } => {
            session.start_session(video_codec.as_deref())
        }
        ClientRequest::StartClientTransport => session.start_client_transport().await,
        ClientRequest::StartProducer {
            kind,
            rtp_parameters,
        } => session.start_producer(kind, rtp_parameters),
        ClientRequest::StartBridge { enable_srtp } => session.start_bridge(enable_srtp).await,
        ClientRequest::StartPeerTransport => session.start_peer_transport().await,
        ClientRequest::StartPeerConsumer { rtp_capabilities } => {
            session.start_peer_consumer(&rtp_capabilities)
        }
    }
}

async fn dispatch_notification(state: &AppState, notification: ClientNotification) -> Result<()> {
    let mut session = state.session.lock().await;
    match notification {
        ClientNotification::ConnectClientTransport { dtls_parameters } => {
            session.connect_client_transport(dtls_parameters)
        }
        ClientNotification::ConnectPeerTransport { dtls_parameters } => {
            session.connect_peer_transport(dtls_parameters)
        }
        ClientNotification::StartRecording { recorder } => {
            if let Some((epoch, exit_rx)) = session.start_recording(recorder).await? {
                let watcher_state = state.clone();
                tokio::spawn(async move {
                    if let Ok(outcome) = exit_rx.await {
                        watcher_state
                            .session
                            .lock()
                            .await
                            .on_recorder_exit(epoch, outcome);
                    }
                });
            }
            Ok(())
        }
        ClientNotification::StopRecording => session.stop_recording(),
        ClientNotification::Debug => {
            session.debug_dump();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_from_kebab_case_frames() {
        let frame = r#"{"id":1,"type":"start-session","video_codec":"H264"}"#;
        let request: ClientRequest = serde_json::from_str(frame).unwrap();
        assert!(matches!(
            request,
            ClientRequest::StartSession {
                video_codec: Some(codec)
            } if codec == "H264"
        ));

        let frame = r#"{"id":2,"type":"start-client-transport"}"#;
        assert!(matches!(
            serde_json::from_str::<ClientRequest>(frame).unwrap(),
            ClientRequest::StartClientTransport
        ));

        let frame = r#"{"id":3,"type":"start-bridge"}"#;
        assert!(matches!(
            serde_json::from_str::<ClientRequest>(frame).unwrap(),
            ClientRequest::StartBridge { enable_srtp: false }
        ));
    }

    #[test]
    fn notifications_parse_and_serialize() {
        let frame = r#"{"type":"start-recording","recorder":"ffmpeg"}"#;
        assert!(matches!(
            serde_json::from_str::<ClientNotification>(frame).unwrap(),
            ClientNotification::StartRecording {
                recorder: RecorderKind::Ffmpeg
            }
        ));

        let frame = r#"{"type":"stop-recording"}"#;
        assert!(matches!(
            serde_json::from_str::<ClientNotification>(frame).unwrap(),
            ClientNotification::StopRecording
        ));

        let json = serde_json::to_string(&ServerNotification::ProducerReady {
            kind: MediaKind::Video,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"producer-ready","kind":"video"}"#);

        let json = serde_json::to_string(&ServerNotification::Log {
            line: "hello".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"log","line":"hello"}"#);
    }
}
