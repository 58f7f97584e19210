//! Peer pipeline engine client.
//!
//! The filter pipeline runs in a separate engine that speaks a JSON-RPC
//! style protocol over WebSocket (Kurento media server wire format). The
//! session only needs a handful of verbs, expressed as the
//! [`PipelinePeer`] trait so tests can swap in [`MockPipeline`] instead
//! of a live engine.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use weir_common::{Error, Result};

/// Every RPC to the peer engine is bounded; a stuck engine fails the
/// bridge leg, not the whole server.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait PipelinePeer: Send + Sync {
    async fn create_pipeline(&self) -> Result<String>;
    /// Create an RTP endpoint in `pipeline`. When `crypto_key_base64` is
    /// set the endpoint speaks SRTP with that SDES key.
    async fn create_rtp_endpoint(
        &self,
        pipeline: &str,
        crypto_key_base64: Option<&str>,
    ) -> Result<String>;
    /// Feed our offer to an endpoint, get the engine's answer back.
    async fn process_offer(&self, endpoint: &str, offer: &str) -> Result<String>;
    async fn create_filter(&self, pipeline: &str, command: &str) -> Result<String>;
    async fn connect_elements(&self, source: &str, sink: &str) -> Result<()>;
    async fn set_max_video_send_bandwidth(&self, endpoint: &str, kbps: u32) -> Result<()>;
    async fn release(&self, object: &str) -> Result<()>;
}

#[async_trait]
pub trait PipelineConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PipelinePeer>>;
}

// ---------------------------------------------------------------------------
// Live client
// ---------------------------------------------------------------------------

pub struct KurentoConnector {
    url: String,
}

impl KurentoConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PipelineConnector for KurentoConnector {
    async fn connect(&self) -> Result<Arc<dyn PipelinePeer>> {
        Ok(Arc::new(KurentoClient::connect(&self.url).await?))
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;

/// JSON-RPC 2.0 client over one WebSocket connection.
pub struct KurentoClient {
    outbox: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl KurentoClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = tokio::time::timeout(RPC_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| Error::timeout(format!("connecting to pipeline engine at {url}")))?
            .map_err(|e| Error::engine(format!("pipeline engine connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("pipeline engine sent unparseable frame: {e}");
                        continue;
                    }
                };
                let Some(id) = value.get("id").and_then(|id| id.as_u64()) else {
                    // Unsolicited event (onEvent etc.); nothing subscribes.
                    debug!("ignoring pipeline engine notification");
                    continue;
                };
                let Some(waiter) = reader_pending.lock().await.remove(&id) else {
                    continue;
                };
                let outcome = if let Some(error) = value.get("error") {
                    Err(Error::engine(format!("pipeline RPC failed: {error}")))
                } else {
                    Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null))
                };
                let _ = waiter.send(outcome);
            }
            // Connection gone: fail everything still waiting.
            let mut pending = reader_pending.lock().await;
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err(Error::engine("pipeline engine connection closed")));
            }
        });

        Ok(Self {
            outbox,
            pending,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
            reader,
            writer,
        })
    }

    async fn call(&self, method: &str, mut params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(session_id) = self.session_id.lock().await.clone() {
            params["sessionId"] = serde_json::Value::String(session_id);
        }
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        let frame = serde_json::to_string(&request).map_err(Error::serialization)?;
        self.outbox
            .send(Message::Text(frame))
            .map_err(|_| Error::engine("pipeline engine connection closed"))?;

        let result = match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::engine("pipeline engine connection closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::timeout(format!("pipeline RPC {method}")))
            }
        }?;

        if let Some(session_id) = result.get("sessionId").and_then(|s| s.as_str()) {
            *self.session_id.lock().await = Some(session_id.to_string());
        }
        Ok(result)
    }

    async fn create(&self, kind: &str, constructor_params: serde_json::Value) -> Result<String> {
        let result = self
            .call(
                "create",
                serde_json::json!({ "type": kind, "constructorParams": constructor_params }),
            )
            .await?;
        result
            .get("value")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::protocol(format!("create {kind} returned no object id")))
    }

    async fn invoke(
        &self,
        object: &str,
        operation: &str,
        operation_params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.call(
            "invoke",
            serde_json::json!({
                "object": object,
                "operation": operation,
                "operationParams": operation_params,
            }),
        )
        .await
    }
}

impl Drop for KurentoClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl PipelinePeer for KurentoClient {
    async fn create_pipeline(&self) -> Result<String> {
        self.create("MediaPipeline", serde_json::json!({})).await
    }

    async fn create_rtp_endpoint(
        &self,
        pipeline: &str,
        crypto_key_base64: Option<&str>,
    ) -> Result<String> {
        let mut params = serde_json::json!({ "mediaPipeline": pipeline });
        if let Some(key) = crypto_key_base64 {
            params["crypto"] = serde_json::json!({
                "crypto": "AES_CM_128_HMAC_SHA1_80",
                "keyBase64": key,
            });
        }
        self.create("RtpEndpoint", params).await
    }

    async fn process_offer(&self, endpoint: &str, offer: &str) -> Result<String> {
        let result = self
            .invoke(endpoint, "processOffer", serde_json::json!({ "offer": offer }))
            .await?;
        result
            .get("value")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("processOffer returned no answer"))
    }

    async fn create_filter(&self, pipeline: &str, command: &str) -> Result<String> {
        self.create(
            "GStreamerFilter",
            serde_json::json!({ "mediaPipeline": pipeline, "command": command }),
        )
        .await
    }

    async fn connect_elements(&self, source: &str, sink: &str) -> Result<()> {
        self.invoke(source, "connect", serde_json::json!({ "sink": sink }))
            .await?;
        Ok(())
    }

    async fn set_max_video_send_bandwidth(&self, endpoint: &str, kbps: u32) -> Result<()> {
        self.invoke(
            endpoint,
            "setMaxVideoSendBandwidth",
            serde_json::json!({ "maxVideoSendBandwidth": kbps }),
        )
        .await?;
        Ok(())
    }

    async fn release(&self, object: &str) -> Result<()> {
        self.call("release", serde_json::json!({ "object": object }))
            .await?;
        Ok(())
    }
}

/// If the peer engine answered with one of this host's own interface
/// addresses, talk to it over loopback instead. Engines colocated with
/// the server often announce an external interface that is unreachable
/// from inside the host's network namespace.
pub fn effective_peer_ip(answered: IpAddr) -> IpAddr {
    if answered.is_loopback() || answered.is_unspecified() {
        return IpAddr::V4(Ipv4Addr::LOCALHOST);
    }
    // Binding to the address succeeds only when a local interface owns it.
    match std::net::UdpSocket::bind((answered, 0)) {
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(_) => answered,
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// In-memory pipeline engine. Hands out deterministic object ids, records
/// every call, and answers offers with a canned template.
pub struct MockPipeline {
    pub calls: std::sync::Mutex<Vec<String>>,
    answer_template: String,
}

impl MockPipeline {
    pub fn new(answer_template: impl Into<String>) -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            answer_template: answer_template.into(),
        }
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl PipelinePeer for MockPipeline {
    async fn create_pipeline(&self) -> Result<String> {
        self.record("create_pipeline".into());
        Ok("pipeline-1".into())
    }

    async fn create_rtp_endpoint(
        &self,
        pipeline: &str,
        crypto_key_base64: Option<&str>,
    ) -> Result<String> {
        let n = self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.starts_with("create_rtp_endpoint"))
            .count();
        self.record(format!(
            "create_rtp_endpoint {pipeline} srtp={}",
            crypto_key_base64.is_some()
        ));
        Ok(format!("endpoint-{}", n + 1))
    }

    async fn process_offer(&self, endpoint: &str, _offer: &str) -> Result<String> {
        self.record(format!("process_offer {endpoint}"));
        Ok(self.answer_template.clone())
    }

    async fn create_filter(&self, pipeline: &str, command: &str) -> Result<String> {
        self.record(format!("create_filter {pipeline} {command}"));
        Ok("filter-1".into())
    }

    async fn connect_elements(&self, source: &str, sink: &str) -> Result<()> {
        self.record(format!("connect {source} -> {sink}"));
        Ok(())
    }

    async fn set_max_video_send_bandwidth(&self, endpoint: &str, kbps: u32) -> Result<()> {
        self.record(format!("max_bandwidth {endpoint} {kbps}"));
        Ok(())
    }

    async fn release(&self, object: &str) -> Result<()> {
        self.record(format!("release {object}"));
        Ok(())
    }
}

pub struct MockConnector(pub Arc<MockPipeline>);

#[async_trait]
impl PipelineConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn PipelinePeer>> {
        Ok(Arc::clone(&self.0) as Arc<dyn PipelinePeer>)
    }
}
