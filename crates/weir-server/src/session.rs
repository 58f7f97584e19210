//! The session: everything the server holds for its one connected client.
//!
//! A session owns the router, the client-facing WebRTC transports, the
//! plain transport legs toward the filter pipeline and the recorder, and
//! the recorder process handle. All signaling operations land here; the
//! signaling layer stays a thin dispatch shell.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::bridge::{effective_peer_ip, PipelineConnector, PipelinePeer};
use crate::config::Config;
use crate::recorder::{self, RecorderExit, RecorderKind};
use crate::signal::ServerNotification;
use weir_common::{Error, LogSink, Result};
use weir_core::media::MediaKind;
use weir_core::router::Router;
use weir_core::rtp::{
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncoding,
    RtpParameters,
};
use weir_core::sdp::{self, Direction, MediaSection};
use weir_core::transport::{
    DtlsParameters, PlainConnectOptions, PlainTransportOptions, SrtpParameters,
    WebRtcTransportOptions,
};

/// Cap asked of the pipeline's sending endpoint, in kbps.
const PEER_MAX_VIDEO_BANDWIDTH_KBPS: u32 = 2000;
/// The filter the pipeline applies between the two bridge legs.
const FILTER_COMMAND: &str = "videobalance saturation=0.0";
/// How long a recorder gets to announce readiness.
const RECORDER_READY_TIMEOUT: Duration = Duration::from_secs(15);
/// Grace period between recorder readiness and unpausing the consumers,
/// so the first keyframe is not lost while the recorder finishes setup.
const RECORDER_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerDescriptor {
    id: Uuid,
    producer_id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct BridgeState {
    peer: Arc<dyn PipelinePeer>,
    pipeline: String,
    send_transport: Uuid,
    recv_transport: Uuid,
    /// Consumer of the client's video producer, feeding the send leg.
    consumer: Uuid,
    /// Producer carrying the filtered stream back from the recv leg.
    producer: Uuid,
}

struct RecordingState {
    handle: recorder::RecorderHandle,
    audio_transport: Option<Uuid>,
    video_transport: Option<Uuid>,
    epoch: u64,
}

pub struct Session {
    config: Arc<Config>,
    log: LogSink,
    connector: Arc<dyn PipelineConnector>,
    events: Option<mpsc::UnboundedSender<ServerNotification>>,
    router: Option<Router>,
    selected_codecs: Vec<RtpCodecCapability>,
    client_transport: Option<Uuid>,
    peer_transport: Option<Uuid>,
    audio_producer: Option<Uuid>,
    video_producer: Option<Uuid>,
    bridge: Option<BridgeState>,
    recording: Option<RecordingState>,
    recorder_epoch: u64,
}

impl Session {
    pub fn new(config: Arc<Config>, log: LogSink, connector: Arc<dyn PipelineConnector>) -> Self {
        Self {
            config,
            log,
            connector,
            events: None,
            router: None,
            selected_codecs: Vec::new(),
            client_transport: None,
            peer_transport: None,
            audio_producer: None,
            video_producer: None,
            bridge: None,
            recording: None,
            recorder_epoch: 0,
        }
    }

    pub fn attach_events(&mut self, tx: mpsc::UnboundedSender<ServerNotification>) {
        self.events = Some(tx);
    }

    fn notify(&self, notification: ServerNotification) {
        if let Some(tx) = &self.events {
            let _ = tx.send(notification);
        }
    }

    fn router_mut(&mut self) -> Result<&mut Router> {
        self.router
            .as_mut()
            .ok_or_else(|| Error::ordering("start-session must run first"))
    }

    // -- capability negotiation -------------------------------------------

    pub fn start_session(&mut self, video_codec: Option<&str>) -> Result<serde_json::Value> {
        if self.router.is_some() {
            return Err(Error::ordering("session already started"));
        }
        let codecs = self.config.select_codecs(video_codec)?;
        let router = Router::new(&codecs)?;
        self.log.info(format!(
            "session started with audio/opus + video/{}",
            codecs
                .iter()
                .find(|c| c.kind == MediaKind::Video)
                .map(|c| c.encoding_name())
                .unwrap_or("?")
        ));
        let capabilities = serde_json::to_value(router.capabilities())
            .map_err(Error::serialization)?;
        self.selected_codecs = codecs;
        self.router = Some(router);
        Ok(capabilities)
    }

    // -- client transport --------------------------------------------------

    pub async fn start_client_transport(&mut self) -> Result<serde_json::Value> {
        if self.client_transport.is_some() {
            return Err(Error::ordering("client transport already exists"));
        }
        let opts = self.webrtc_opts();
        let router = self.router_mut()?;
        let id = router.create_webrtc_transport(opts).await?;
        let descriptor = router.webrtc(id)?.descriptor();
        self.client_transport = Some(id);
        serde_json::to_value(descriptor).map_err(Error::serialization)
    }

    pub fn connect_client_transport(&mut self, dtls: DtlsParameters) -> Result<()> {
        let id = self
            .client_transport
            .ok_or_else(|| Error::ordering("no client transport to connect"))?;
        self.router_mut()?.webrtc_mut(id)?.connect(dtls)?;
        self.log.info("client transport connected");
        Ok(())
    }

    pub fn start_producer(
        &mut self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<serde_json::Value> {
        let transport = self
            .client_transport
            .ok_or_else(|| Error::ordering("start-client-transport must run first"))?;
        let slot = match kind {
            MediaKind::Audio => &self.audio_producer,
            MediaKind::Video => &self.video_producer,
        };
        if slot.is_some() {
            return Err(Error::ordering(format!("{kind} producer already exists")));
        }
        let id = self.router_mut()?.produce(transport, kind, rtp_parameters)?;
        match kind {
            MediaKind::Audio => self.audio_producer = Some(id),
            MediaKind::Video => self.video_producer = Some(id),
        }
        self.log.info(format!("{kind} producer ready"));
        self.notify(ServerNotification::ProducerReady { kind });
        Ok(serde_json::json!({ "id": id }))
    }

    // -- bridge to the filter pipeline ------------------------------------

    pub async fn start_bridge(&mut self, enable_srtp: bool) -> Result<serde_json::Value> {
        if self.bridge.is_some() {
            return Err(Error::ordering("bridge already established"));
        }
        let video_producer = self
            .video_producer
            .ok_or_else(|| Error::ordering("a video producer is required before start-bridge"))?;

        let peer = self.connector.connect().await?;
        let mut pipeline: Option<String> = None;
        let mut transports: Vec<Uuid> = Vec::new();

        match self
            .establish_bridge(&peer, enable_srtp, video_producer, &mut pipeline, &mut transports)
            .await
        {
            Ok(state) => {
                let pipeline_id = state.pipeline.clone();
                self.log.info("bridge established, filter active");
                self.bridge = Some(state);
                Ok(serde_json::json!({ "pipeline": pipeline_id }))
            }
            Err(e) => {
                if let Ok(router) = self.router_mut() {
                    for id in transports {
                        router.close_transport(id);
                    }
                }
                if let Some(pipeline) = pipeline {
                    let _ = peer.release(&pipeline).await;
                }
                self.log.error(format!("bridge failed: {e}"));
                Err(e)
            }
        }
    }

    async fn establish_bridge(
        &mut self,
        peer: &Arc<dyn PipelinePeer>,
        enable_srtp: bool,
        video_producer: Uuid,
        pipeline_out: &mut Option<String>,
        transports_out: &mut Vec<Uuid>,
    ) -> Result<BridgeState> {
        // One shared key for every leg of the bridge; the pipeline engine
        // applies it in both directions.
        let srtp = enable_srtp.then(SrtpParameters::generate);
        let media_ip = self.config.media_ip;

        let pipeline = peer.create_pipeline().await?;
        *pipeline_out = Some(pipeline.clone());

        let plain_opts = PlainTransportOptions {
            listen_ip: media_ip,
            rtcp_mux: false,
            comedia: false,
            enable_srtp: false,
        };
        let abs_send_time_id;
        let capabilities;
        {
            let router = self.router_mut()?;
            capabilities = router.capabilities().clone();
            abs_send_time_id = capabilities.header_extension_id(MediaKind::Video, "abs-send-time");
        }

        // Send leg: our video, encoded as the pipeline will receive it.
        let send_transport = self.router_mut()?.create_plain_transport(plain_opts).await?;
        transports_out.push(send_transport);
        let consumer =
            self.router_mut()?
                .consume(send_transport, video_producer, &capabilities, false)?;
        let send_offer = {
            let router = self.router_mut()?;
            let transport = router.plain(send_transport)?;
            let codec = consumer
                .rtp_parameters
                .media_codec()
                .ok_or_else(|| Error::negotiation("consumer has no media codec"))?;
            sdp::build_offer(
                media_ip,
                &MediaSection {
                    kind: MediaKind::Video,
                    port: transport.tuple().local_port,
                    rtcp_port: transport.rtcp_tuple().map(|t| t.local_port),
                    payload_type: codec.payload_type,
                    encoding_name: codec.encoding_name().to_string(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    rtcp_feedback: codec.rtcp_feedback.clone(),
                    direction: Some(Direction::SendOnly),
                    abs_send_time_id,
                    srtp: srtp.clone(),
                    ssrc_cname: consumer
                        .rtp_parameters
                        .ssrc()
                        .map(|ssrc| (ssrc, consumer.rtp_parameters.rtcp.cname.clone().unwrap_or_default())),
                },
            )
        };

        let send_endpoint = peer
            .create_rtp_endpoint(&pipeline, srtp.as_ref().map(|s| s.key_base64.as_str()))
            .await?;
        let send_answer = peer.process_offer(&send_endpoint, &send_offer).await?;
        let answer = sdp::parse_answer(&send_answer)?;
        let peer_ip = effective_peer_ip(answer.connection_ip);
        self.router_mut()?
            .plain_mut(send_transport)?
            .connect(PlainConnectOptions {
                ip: Some(peer_ip),
                port: Some(answer.port),
                rtcp_port: Some(answer.rtcp_port),
                srtp_parameters: srtp.clone(),
            })
            .await?;

        // Receive leg: the filtered stream comes back by comedia; we only
        // advertise where to send it.
        let recv_transport = self
            .router_mut()?
            .create_plain_transport(PlainTransportOptions {
                comedia: true,
                ..plain_opts
            })
            .await?;
        transports_out.push(recv_transport);
        let video_caps = self
            .selected_codecs
            .iter()
            .find(|c| c.kind == MediaKind::Video)
            .cloned()
            .ok_or_else(|| Error::internal("session has no video codec"))?;
        let recv_offer = {
            let router = self.router_mut()?;
            let transport = router.plain(recv_transport)?;
            let codec = capabilities
                .find_codec(&video_caps.mime_type)
                .ok_or_else(|| Error::internal("selected codec missing from capabilities"))?;
            sdp::build_offer(
                media_ip,
                &MediaSection {
                    kind: MediaKind::Video,
                    port: transport.tuple().local_port,
                    rtcp_port: transport.rtcp_tuple().map(|t| t.local_port),
                    payload_type: codec.preferred_payload_type.unwrap_or(96),
                    encoding_name: codec.encoding_name().to_string(),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    rtcp_feedback: codec.rtcp_feedback.clone(),
                    direction: Some(Direction::RecvOnly),
                    abs_send_time_id,
                    srtp: srtp.clone(),
                    ssrc_cname: None,
                },
            )
        };

        let recv_endpoint = peer
            .create_rtp_endpoint(&pipeline, srtp.as_ref().map(|s| s.key_base64.as_str()))
            .await?;
        let recv_answer = peer.process_offer(&recv_endpoint, &recv_offer).await?;
        let recv_params = bridged_producer_parameters(&recv_answer, &capabilities)?;
        self.router_mut()?
            .plain_mut(recv_transport)?
            .connect(PlainConnectOptions {
                srtp_parameters: srtp,
                ..Default::default()
            })
            .await?;
        // No producer-ready here: that notification marks client producers
        // only, and the start-bridge reply already acknowledges this leg.
        let producer = self
            .router_mut()?
            .produce(recv_transport, MediaKind::Video, recv_params)?;

        let filter = peer.create_filter(&pipeline, FILTER_COMMAND).await?;
        peer.connect_elements(&send_endpoint, &filter).await?;
        peer.connect_elements(&filter, &recv_endpoint).await?;
        peer.set_max_video_send_bandwidth(&recv_endpoint, PEER_MAX_VIDEO_BANDWIDTH_KBPS)
            .await?;

        Ok(BridgeState {
            peer: Arc::clone(peer),
            pipeline,
            send_transport,
            recv_transport,
            consumer: consumer.id,
            producer,
        })
    }

    // -- the client-facing leg of the bridged stream -----------------------

    pub async fn start_peer_transport(&mut self) -> Result<serde_json::Value> {
        if self.peer_transport.is_some() {
            return Err(Error::ordering("peer transport already exists"));
        }
        let opts = self.webrtc_opts();
        let router = self.router_mut()?;
        let id = router.create_webrtc_transport(opts).await?;
        let descriptor = router.webrtc(id)?.descriptor();
        self.peer_transport = Some(id);
        serde_json::to_value(descriptor).map_err(Error::serialization)
    }

    pub fn connect_peer_transport(&mut self, dtls: DtlsParameters) -> Result<()> {
        let id = self
            .peer_transport
            .ok_or_else(|| Error::ordering("no peer transport to connect"))?;
        self.router_mut()?.webrtc_mut(id)?.connect(dtls)?;
        self.log.info("peer transport connected");
        Ok(())
    }

    pub fn start_peer_consumer(
        &mut self,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<serde_json::Value> {
        let transport = self
            .peer_transport
            .ok_or_else(|| Error::ordering("start-peer-transport must run first"))?;
        let producer = self
            .bridge
            .as_ref()
            .map(|b| b.producer)
            .ok_or_else(|| Error::ordering("no bridged producer; start-bridge must run first"))?;
        let consumer = self
            .router_mut()?
            .consume(transport, producer, rtp_capabilities, false)?;
        serde_json::to_value(ConsumerDescriptor {
            id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
        })
        .map_err(Error::serialization)
    }

    // -- recording ---------------------------------------------------------

    /// Start a recorder. On success returns the exit-supervision channel,
    /// which the signaling layer watches (`None` for the unsupervised
    /// external recorder).
    pub async fn start_recording(
        &mut self,
        kind: RecorderKind,
    ) -> Result<Option<(u64, oneshot::Receiver<RecorderExit>)>> {
        if self.recording.is_some() {
            return Err(Error::ordering("a recording is already in progress"));
        }
        let audio_producer = self.audio_producer;
        let video_producer = self.video_producer;
        if audio_producer.is_none() && video_producer.is_none() {
            return Err(Error::ordering("nothing to record: no producers exist"));
        }

        let ports = self.config.recorder_ports;
        let media_ip = self.config.media_ip;
        let capabilities = self.router_mut()?.capabilities().clone();

        let mut transports = Vec::new();
        let mut recording = RecordingState {
            handle: {
                let audio_codec = audio_producer.and_then(|_| {
                    self.selected_codecs
                        .iter()
                        .find(|c| c.kind == MediaKind::Audio)
                        .cloned()
                });
                let video_codec = video_producer.and_then(|_| {
                    self.selected_codecs
                        .iter()
                        .find(|c| c.kind == MediaKind::Video)
                        .cloned()
                });
                recorder::spawn(
                    kind,
                    &self.config,
                    &self.log,
                    audio_codec.as_ref(),
                    video_codec.as_ref(),
                )
                .await?
            },
            audio_transport: None,
            video_transport: None,
            epoch: self.recorder_epoch + 1,
        };

        // Feed legs: one plain transport per recorded kind, explicitly
        // connected to the recorder's fixed ports, consumers paused until
        // the recorder is ready.
        let legs = [
            (audio_producer, ports.audio_port, ports.audio_rtcp_port),
            (video_producer, ports.video_port, ports.video_rtcp_port),
        ];
        let result: Result<()> = async {
            for (producer, port, rtcp_port) in legs {
                let Some(producer) = producer else { continue };
                let router = self.router_mut()?;
                let transport = router
                    .create_plain_transport(PlainTransportOptions {
                        listen_ip: media_ip,
                        rtcp_mux: false,
                        comedia: false,
                        enable_srtp: false,
                    })
                    .await?;
                transports.push(transport);
                router
                    .plain_mut(transport)?
                    .connect(PlainConnectOptions {
                        ip: Some(media_ip),
                        port: Some(port),
                        rtcp_port: Some(rtcp_port),
                        srtp_parameters: None,
                    })
                    .await?;
                let consumer = router.consume(transport, producer, &capabilities, true)?;
                match consumer.kind {
                    MediaKind::Audio => recording.audio_transport = Some(transport),
                    MediaKind::Video => recording.video_transport = Some(transport),
                }
            }

            recording.handle.wait_ready(RECORDER_READY_TIMEOUT).await?;
            tokio::time::sleep(RECORDER_SETTLE_DELAY).await;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = recording.handle.request_stop();
            if let Ok(router) = self.router_mut() {
                for transport in transports {
                    router.close_transport(transport);
                }
            }
            self.log.error(format!("recording failed to start: {e}"));
            return Err(e);
        }

        for transport in &transports {
            self.router_mut()?.set_consumers_paused(*transport, false)?;
        }
        self.log.info(format!("{kind} recording started"));

        self.recorder_epoch = recording.epoch;
        let epoch = recording.epoch;
        let exit_rx = recording.handle.take_exit();
        self.recording = Some(recording);
        Ok(exit_rx.map(|rx| (epoch, rx)))
    }

    /// The supervised recorder process ended; classify and clean up. A
    /// stale epoch means a newer recording replaced this one already.
    pub fn on_recorder_exit(&mut self, epoch: u64, outcome: RecorderExit) {
        let Some(recording) = self.recording.as_ref() else {
            return;
        };
        if recording.epoch != epoch {
            return;
        }
        match outcome {
            RecorderExit::Stopped => self.log.info("recording stopped"),
            RecorderExit::Corrupt(reason) => self
                .log
                .warn(format!("{reason}; the recording output may be corrupt")),
        }
        self.cleanup_recording();
    }

    /// Stop the active recording. With a live supervised process this just
    /// sends SIGINT and lets the exit handler clean up; otherwise the
    /// cleanup runs directly. Without a recording it is a no-op.
    pub fn stop_recording(&mut self) -> Result<()> {
        let Some(recording) = self.recording.as_ref() else {
            self.log.info("no recording in progress");
            return Ok(());
        };
        if recording.handle.is_supervised() {
            self.log.info("stopping recorder");
            recording.handle.request_stop()
        } else {
            self.log.info("recording stopped");
            self.cleanup_recording();
            Ok(())
        }
    }

    fn cleanup_recording(&mut self) {
        if let Some(recording) = self.recording.take() {
            if let Some(router) = self.router.as_mut() {
                if let Some(t) = recording.audio_transport {
                    router.close_transport(t);
                }
                if let Some(t) = recording.video_transport {
                    router.close_transport(t);
                }
            }
        }
    }

    // -- diagnostics and teardown -----------------------------------------

    pub fn debug_dump(&self) {
        let Some(router) = self.router.as_ref() else {
            self.log.info("no session state yet");
            return;
        };
        self.log.info(format!("router {}", router.id()));
        for stats in router.stats() {
            match serde_json::to_string(&stats) {
                Ok(json) => self.log.info(json),
                Err(e) => self.log.error(format!("stats serialization failed: {e}")),
            }
        }
        if let Some(bridge) = &self.bridge {
            self.log.info(format!(
                "bridge pipeline={} consumer={} producer={}",
                bridge.pipeline, bridge.consumer, bridge.producer
            ));
        }
        if let Some(recording) = &self.recording {
            self.log
                .info(format!("recording active ({})", recording.handle.kind()));
        }
    }

    /// Release everything. Safe to call repeatedly; runs on signaling
    /// disconnect.
    pub async fn teardown(&mut self) {
        if let Some(recording) = self.recording.as_ref() {
            let _ = recording.handle.request_stop();
        }
        self.cleanup_recording();

        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.peer.release(&bridge.pipeline).await {
                self.log.warn(format!("pipeline release failed: {e}"));
            }
            if let Some(router) = self.router.as_mut() {
                router.close_transport(bridge.send_transport);
                router.close_transport(bridge.recv_transport);
            }
        }

        if let Some(mut router) = self.router.take() {
            router.close();
        }
        self.selected_codecs.clear();
        self.client_transport = None;
        self.peer_transport = None;
        self.audio_producer = None;
        self.video_producer = None;
        self.events = None;
        self.recorder_epoch += 1;
        self.log.info("session released");
    }

    fn webrtc_opts(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.config.media_ip,
        }
    }
}

/// Turn a bridge-leg answer into producer parameters: the peer's answered
/// payload types, our capability metadata, the peer's SSRC/CNAME when
/// present.
fn bridged_producer_parameters(
    answer_sdp: &str,
    capabilities: &RtpCapabilities,
) -> Result<RtpParameters> {
    let answer = sdp::parse_answer(answer_sdp)?;
    let mut codecs = Vec::new();
    for answered in &answer.codecs {
        let Some(known) = capabilities.codecs.iter().find(|c| {
            !c.is_rtx()
                && c.encoding_name().eq_ignore_ascii_case(&answered.encoding_name)
                && c.clock_rate == answered.clock_rate
        }) else {
            continue;
        };
        codecs.push(RtpCodecParameters {
            mime_type: known.mime_type.clone(),
            payload_type: answered.payload_type,
            clock_rate: answered.clock_rate,
            channels: answered.channels,
            parameters: known.parameters.clone(),
            rtcp_feedback: known.rtcp_feedback.clone(),
        });
    }
    if codecs.is_empty() {
        return Err(Error::negotiation(
            "peer answer shares no codec with the session capabilities",
        ));
    }
    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions: Vec::new(),
        encodings: vec![RtpEncoding {
            ssrc: answer.ssrc,
            max_bitrate: None,
        }],
        rtcp: RtcpParameters {
            cname: answer.cname,
            reduced_size: true,
        },
    })
}
