//! Transport lifecycle state machines.
//!
//! Two kinds of bidirectional media conduits, both bound to one engine
//! session:
//!
//! - [`WebRtcTransport`]: client-facing, interactively negotiated. The
//!   server hands out ICE/DTLS parameters, the client answers with its own
//!   DTLS parameters, and `connect` moves the transport to `Connected`.
//! - [`PlainTransport`]: engine-facing, address/port based. Connected
//!   either explicitly (the remote tuple is known from a prior
//!   offer/answer) or by comedia discovery, where the remote tuple is
//!   learned from the first inbound datagram.
//!
//! State transitions are `Created → Connecting → Connected → Closed`;
//! out-of-order calls are rejected with typed ordering errors instead of
//! trusting caller discipline.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::media::{Consumer, Producer};
use weir_common::{Error, Result};

/// SRTP suite spoken on encrypted plain transports. Fixed: the bridge key
/// exchange is a shared secret, not a per-session negotiation.
pub const SRTP_CRYPTO_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";

/// Lifecycle state shared by both transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// Local/remote network tuple of one socket of a transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTuple {
    pub local_ip: IpAddr,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub protocol: &'static str,
}

impl TransportTuple {
    fn new(local: SocketAddr, remote: Option<SocketAddr>) -> Self {
        Self {
            local_ip: local.ip(),
            local_port: local.port(),
            remote_ip: remote.map(|a| a.ip()),
            remote_port: remote.map(|a| a.port()),
            protocol: "udp",
        }
    }
}

/// Point-in-time snapshot of a transport, for the debug stats dump.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub id: Uuid,
    pub kind: &'static str,
    pub state: TransportState,
    pub tuple: TransportTuple,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtcp_tuple: Option<TransportTuple>,
    pub producers: usize,
    pub consumers: usize,
}

/// Common surface the router needs to bind producers and consumers to a
/// transport of either kind.
pub trait MediaTransport {
    fn id(&self) -> Uuid;
    fn state(&self) -> TransportState;
    /// Whether a producer may be created now. Interactive transports must
    /// be connected first; plain transports may produce while still
    /// awaiting their first inbound packet.
    fn can_produce(&self) -> bool;
    /// Consumers may be created on any non-closed transport (an
    /// interactive transport is consumed from before the client finishes
    /// its DTLS handshake).
    fn can_consume(&self) -> bool {
        self.state() != TransportState::Closed
    }
    fn producers(&self) -> &[Producer];
    fn producers_mut(&mut self) -> &mut Vec<Producer>;
    fn consumers(&self) -> &[Consumer];
    fn consumers_mut(&mut self) -> &mut Vec<Consumer>;
    fn stats(&self) -> TransportStats;
}

// ---------------------------------------------------------------------------
// WebRTC transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: &'static str,
    #[serde(rename = "type")]
    pub candidate_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// What the client needs to initialize its side of the transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportDescriptor {
    pub id: Uuid,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Copy)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
}

/// Client-facing interactive transport.
pub struct WebRtcTransport {
    id: Uuid,
    state: TransportState,
    // Anchors the candidate port for the transport's lifetime.
    _socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    remote_dtls: Option<DtlsParameters>,
    max_incoming_bitrate: Option<u32>,
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
}

impl WebRtcTransport {
    /// Create the transport and allocate its candidate port. A bind
    /// failure means the engine host is unusable and is reported as an
    /// engine (fatal) error.
    pub async fn bind(opts: WebRtcTransportOptions) -> Result<Self> {
        let socket = UdpSocket::bind((opts.listen_ip, 0))
            .await
            .map_err(|e| Error::engine(format!("webrtc transport bind failed: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::engine(format!("webrtc transport local_addr: {e}")))?;

        let ice_parameters = IceParameters {
            username_fragment: random_token(16),
            password: random_token(32),
            ice_lite: true,
        };
        let ice_candidates = vec![IceCandidate {
            foundation: "udpcandidate".into(),
            priority: 1_076_302_079,
            ip: local_addr.ip(),
            port: local_addr.port(),
            protocol: "udp",
            candidate_type: "host",
        }];
        let dtls_parameters = DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: random_fingerprint(),
            }],
        };

        Ok(Self {
            id: Uuid::new_v4(),
            state: TransportState::Created,
            _socket: Arc::new(socket),
            local_addr,
            ice_parameters,
            ice_candidates,
            dtls_parameters,
            remote_dtls: None,
            max_incoming_bitrate: None,
            producers: Vec::new(),
            consumers: Vec::new(),
        })
    }

    pub fn descriptor(&self) -> WebRtcTransportDescriptor {
        WebRtcTransportDescriptor {
            id: self.id,
            ice_parameters: self.ice_parameters.clone(),
            ice_candidates: self.ice_candidates.clone(),
            dtls_parameters: self.dtls_parameters.clone(),
        }
    }

    /// Accept the client's DTLS parameters. A repeated connect with the
    /// same parameters is a no-op; with different parameters it is an
    /// ordering violation.
    pub fn connect(&mut self, remote_dtls: DtlsParameters) -> Result<()> {
        match self.state {
            TransportState::Closed => Err(Error::ordering("connect on closed transport")),
            TransportState::Connected => {
                if self.remote_dtls.as_ref() == Some(&remote_dtls) {
                    debug!(id = %self.id, "duplicate webrtc connect ignored");
                    Ok(())
                } else {
                    Err(Error::ordering(
                        "transport already connected with different DTLS parameters",
                    ))
                }
            }
            TransportState::Created | TransportState::Connecting => {
                self.remote_dtls = Some(remote_dtls);
                self.state = TransportState::Connected;
                Ok(())
            }
        }
    }

    pub fn set_max_incoming_bitrate(&mut self, bitrate: u32) {
        self.max_incoming_bitrate = Some(bitrate);
    }

    pub fn close(&mut self) {
        self.state = TransportState::Closed;
        self.producers.clear();
        self.consumers.clear();
    }
}

impl MediaTransport for WebRtcTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn can_produce(&self) -> bool {
        self.state == TransportState::Connected
    }

    fn producers(&self) -> &[Producer] {
        &self.producers
    }

    fn producers_mut(&mut self) -> &mut Vec<Producer> {
        &mut self.producers
    }

    fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    fn consumers_mut(&mut self) -> &mut Vec<Consumer> {
        &mut self.consumers
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            id: self.id,
            kind: "webrtc",
            state: self.state,
            tuple: TransportTuple::new(self.local_addr, None),
            rtcp_tuple: None,
            producers: self.producers.len(),
            consumers: self.consumers.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plain transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrtpParameters {
    pub crypto_suite: String,
    pub key_base64: String,
}

impl SrtpParameters {
    /// Fresh keying material for the fixed crypto suite (16-byte key +
    /// 14-byte salt, as the suite requires).
    pub fn generate() -> Self {
        let material: [u8; 30] = rand::random();
        Self {
            crypto_suite: SRTP_CRYPTO_SUITE.to_string(),
            key_base64: base64::engine::general_purpose::STANDARD.encode(material),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlainTransportOptions {
    pub listen_ip: IpAddr,
    /// Multiplex RTP and RTCP on one port. Off for peers (ffmpeg,
    /// gstreamer, RTP endpoints) that don't support `a=rtcp-mux`.
    pub rtcp_mux: bool,
    /// Learn the remote tuple from the first inbound packet instead of an
    /// explicit connect.
    pub comedia: bool,
    pub enable_srtp: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PlainConnectOptions {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub rtcp_port: Option<u16>,
    pub srtp_parameters: Option<SrtpParameters>,
}

/// Engine-facing address-based transport over real UDP sockets.
pub struct PlainTransport {
    id: Uuid,
    state: TransportState,
    comedia: bool,
    rtcp_mux: bool,
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Option<Arc<UdpSocket>>,
    local_rtp: SocketAddr,
    local_rtcp: Option<SocketAddr>,
    remote_rtp: Option<SocketAddr>,
    remote_rtcp: Option<SocketAddr>,
    srtp_parameters: Option<SrtpParameters>,
    remote_srtp: Option<SrtpParameters>,
    discovery_rx: Option<watch::Receiver<Option<SocketAddr>>>,
    discovery_task: Option<JoinHandle<()>>,
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
}

impl PlainTransport {
    pub async fn bind(opts: PlainTransportOptions) -> Result<Self> {
        let rtp_socket = UdpSocket::bind((opts.listen_ip, 0))
            .await
            .map_err(|e| Error::engine(format!("plain transport RTP bind failed: {e}")))?;
        let local_rtp = rtp_socket
            .local_addr()
            .map_err(|e| Error::engine(format!("plain transport local_addr: {e}")))?;
        let rtp_socket = Arc::new(rtp_socket);

        let (rtcp_socket, local_rtcp) = if opts.rtcp_mux {
            (None, None)
        } else {
            let socket = UdpSocket::bind((opts.listen_ip, 0))
                .await
                .map_err(|e| Error::engine(format!("plain transport RTCP bind failed: {e}")))?;
            let addr = socket
                .local_addr()
                .map_err(|e| Error::engine(format!("plain transport local_addr: {e}")))?;
            (Some(Arc::new(socket)), Some(addr))
        };

        let srtp_parameters = opts.enable_srtp.then(SrtpParameters::generate);

        let (state, discovery_rx, discovery_task) = if opts.comedia {
            let (tx, rx) = watch::channel(None);
            let socket = Arc::clone(&rtp_socket);
            let id_for_task = local_rtp;
            let task = tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                match socket.recv_from(&mut buf).await {
                    Ok((_, remote)) => {
                        // Lock outbound traffic to the discovered peer.
                        if let Err(e) = socket.connect(remote).await {
                            debug!("comedia socket connect failed: {e}");
                        }
                        debug!(local = %id_for_task, %remote, "comedia remote tuple discovered");
                        let _ = tx.send(Some(remote));
                    }
                    Err(e) => debug!("comedia discovery recv failed: {e}"),
                }
            });
            (TransportState::Connecting, Some(rx), Some(task))
        } else {
            (TransportState::Created, None, None)
        };

        Ok(Self {
            id: Uuid::new_v4(),
            state,
            comedia: opts.comedia,
            rtcp_mux: opts.rtcp_mux,
            rtp_socket,
            rtcp_socket,
            local_rtp,
            local_rtcp,
            remote_rtp: None,
            remote_rtcp: None,
            srtp_parameters,
            remote_srtp: None,
            discovery_rx,
            discovery_task,
            producers: Vec::new(),
            consumers: Vec::new(),
        })
    }

    pub fn comedia(&self) -> bool {
        self.comedia
    }

    pub fn rtcp_mux(&self) -> bool {
        self.rtcp_mux
    }

    pub fn tuple(&self) -> TransportTuple {
        TransportTuple::new(self.local_rtp, self.remote_rtp)
    }

    pub fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.local_rtcp
            .map(|local| TransportTuple::new(local, self.remote_rtcp))
    }

    /// Local keying material the remote side needs to decrypt our stream.
    pub fn srtp_parameters(&self) -> Option<&SrtpParameters> {
        self.srtp_parameters.as_ref()
    }

    /// Connect the transport.
    ///
    /// With an address this is the explicit mode. Without one it is only
    /// valid on a comedia transport, where it merely records the remote's
    /// SRTP parameters while discovery completes the tuple.
    pub async fn connect(&mut self, opts: PlainConnectOptions) -> Result<()> {
        match self.state {
            TransportState::Closed => return Err(Error::ordering("connect on closed transport")),
            TransportState::Connected => {
                return Err(Error::ordering("plain transport already connected"))
            }
            TransportState::Created | TransportState::Connecting => {}
        }

        if let Some(srtp) = opts.srtp_parameters.clone() {
            self.remote_srtp = Some(srtp);
        }

        match (opts.ip, opts.port) {
            (Some(ip), Some(port)) => {
                if self.comedia {
                    return Err(Error::ordering(
                        "comedia transport learns its remote from the first packet",
                    ));
                }
                let remote = SocketAddr::new(ip, port);
                self.rtp_socket
                    .connect(remote)
                    .await
                    .map_err(|e| Error::engine(format!("plain transport connect: {e}")))?;
                self.remote_rtp = Some(remote);

                if let Some(rtcp_socket) = &self.rtcp_socket {
                    let rtcp_remote =
                        SocketAddr::new(ip, opts.rtcp_port.unwrap_or(port.saturating_add(1)));
                    rtcp_socket
                        .connect(rtcp_remote)
                        .await
                        .map_err(|e| Error::engine(format!("plain transport RTCP connect: {e}")))?;
                    self.remote_rtcp = Some(rtcp_remote);
                }

                self.state = TransportState::Connected;
                Ok(())
            }
            (None, None) if self.comedia => Ok(()),
            _ => Err(Error::ordering(
                "explicit connect requires both ip and port",
            )),
        }
    }

    /// If comedia discovery has already fired, apply it.
    pub fn poll_discovery(&mut self) -> Option<SocketAddr> {
        let remote = self.discovery_rx.as_ref().and_then(|rx| *rx.borrow());
        if let Some(remote) = remote {
            if self.state == TransportState::Connecting {
                self.remote_rtp = Some(remote);
                self.state = TransportState::Connected;
            }
        }
        self.remote_rtp
    }

    /// Wait until the remote tuple has been learned from the first
    /// inbound packet, bounded by `timeout`.
    pub async fn wait_for_discovery(&mut self, timeout: Duration) -> Result<SocketAddr> {
        if let Some(remote) = self.poll_discovery() {
            return Ok(remote);
        }
        let Some(rx) = self.discovery_rx.as_mut() else {
            return Err(Error::ordering(
                "wait_for_discovery on a non-comedia transport",
            ));
        };
        let wait = async {
            loop {
                if let Some(remote) = *rx.borrow_and_update() {
                    return Ok::<SocketAddr, Error>(remote);
                }
                rx.changed()
                    .await
                    .map_err(|_| Error::internal("discovery task dropped"))?;
            }
        };
        let remote = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout("comedia discovery"))??;
        self.remote_rtp = Some(remote);
        self.state = TransportState::Connected;
        Ok(remote)
    }

    pub fn close(&mut self) {
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
        self.state = TransportState::Closed;
        self.producers.clear();
        self.consumers.clear();
    }
}

impl Drop for PlainTransport {
    fn drop(&mut self) {
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
    }
}

impl MediaTransport for PlainTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn can_produce(&self) -> bool {
        // A plain transport may produce before its remote is known; the
        // stream simply starts once the first packet arrives.
        self.state != TransportState::Closed
    }

    fn producers(&self) -> &[Producer] {
        &self.producers
    }

    fn producers_mut(&mut self) -> &mut Vec<Producer> {
        &mut self.producers
    }

    fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    fn consumers_mut(&mut self) -> &mut Vec<Consumer> {
        &mut self.consumers
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            id: self.id,
            kind: "plain",
            state: self.state,
            tuple: self.tuple(),
            rtcp_tuple: self.rtcp_tuple(),
            producers: self.producers.len(),
            consumers: self.consumers.len(),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn webrtc_opts() -> WebRtcTransportOptions {
        WebRtcTransportOptions { listen_ip: LOOPBACK }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AA:BB".into(),
            }],
        }
    }

    #[tokio::test]
    async fn webrtc_connect_lifecycle() {
        let mut transport = WebRtcTransport::bind(webrtc_opts()).await.unwrap();
        assert_eq!(transport.state(), TransportState::Created);
        assert!(!transport.can_produce());

        transport.connect(client_dtls()).unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert!(transport.can_produce());

        // Same parameters: idempotent no-op.
        transport.connect(client_dtls()).unwrap();

        // Different parameters: ordering violation.
        let other = DtlsParameters {
            role: DtlsRole::Server,
            fingerprints: vec![],
        };
        let err = transport.connect(other).unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));

        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
        let err = transport.connect(client_dtls()).unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));
    }

    #[tokio::test]
    async fn webrtc_descriptor_carries_ice_and_dtls() {
        let transport = WebRtcTransport::bind(webrtc_opts()).await.unwrap();
        let desc = transport.descriptor();
        assert_eq!(desc.id, transport.id());
        assert!(!desc.ice_parameters.username_fragment.is_empty());
        assert_eq!(desc.ice_candidates.len(), 1);
        assert_eq!(desc.ice_candidates[0].ip, LOOPBACK);
        assert_ne!(desc.ice_candidates[0].port, 0);
        assert_eq!(desc.dtls_parameters.fingerprints[0].algorithm, "sha-256");
    }

    #[tokio::test]
    async fn plain_explicit_connect() {
        let peer = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut transport = PlainTransport::bind(PlainTransportOptions {
            listen_ip: LOOPBACK,
            rtcp_mux: false,
            comedia: false,
            enable_srtp: false,
        })
        .await
        .unwrap();
        assert_eq!(transport.state(), TransportState::Created);
        assert!(transport.rtcp_tuple().is_some());

        transport
            .connect(PlainConnectOptions {
                ip: Some(peer_addr.ip()),
                port: Some(peer_addr.port()),
                rtcp_port: Some(peer_addr.port() + 1),
                srtp_parameters: None,
            })
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert_eq!(transport.tuple().remote_port, Some(peer_addr.port()));

        // Double connect is rejected.
        let err = transport
            .connect(PlainConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));
    }

    #[tokio::test]
    async fn plain_connect_without_address_is_rejected_unless_comedia() {
        let mut transport = PlainTransport::bind(PlainTransportOptions {
            listen_ip: LOOPBACK,
            rtcp_mux: true,
            comedia: false,
            enable_srtp: false,
        })
        .await
        .unwrap();
        let err = transport
            .connect(PlainConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));
    }

    #[tokio::test]
    async fn comedia_discovers_remote_from_first_packet() {
        let mut transport = PlainTransport::bind(PlainTransportOptions {
            listen_ip: LOOPBACK,
            rtcp_mux: true,
            comedia: true,
            enable_srtp: false,
        })
        .await
        .unwrap();
        assert_eq!(transport.state(), TransportState::Connecting);
        assert!(transport.can_produce());

        // SRTP-only connect is allowed while discovery is pending.
        transport
            .connect(PlainConnectOptions {
                srtp_parameters: Some(SrtpParameters::generate()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Connecting);

        // Explicit address on a comedia transport is an ordering error.
        let err = transport
            .connect(PlainConnectOptions {
                ip: Some(LOOPBACK),
                port: Some(9),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));

        let sender = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
        let target = SocketAddr::new(transport.tuple().local_ip, transport.tuple().local_port);
        sender.send_to(b"rtp", target).await.unwrap();

        let remote = transport
            .wait_for_discovery(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(remote, sender.local_addr().unwrap());
        assert_eq!(transport.state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn comedia_discovery_times_out() {
        let mut transport = PlainTransport::bind(PlainTransportOptions {
            listen_ip: LOOPBACK,
            rtcp_mux: true,
            comedia: true,
            enable_srtp: false,
        })
        .await
        .unwrap();
        let err = transport
            .wait_for_discovery(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // Still connecting; close mid-connect must not leak the task.
        assert_eq!(transport.state(), TransportState::Connecting);
        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn srtp_keying_material_is_generated_when_enabled() {
        let transport = PlainTransport::bind(PlainTransportOptions {
            listen_ip: LOOPBACK,
            rtcp_mux: false,
            comedia: false,
            enable_srtp: true,
        })
        .await
        .unwrap();
        let srtp = transport.srtp_parameters().unwrap();
        assert_eq!(srtp.crypto_suite, SRTP_CRYPTO_SUITE);
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&srtp.key_base64)
            .unwrap();
        assert_eq!(raw.len(), 30);
    }
}
