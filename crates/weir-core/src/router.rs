//! The router: one engine session's capability descriptor plus the
//! registry of its transports, producers and consumers.
//!
//! The router is where the ordering rules live. Transports exist only
//! inside a router, producers only on a transport that may produce, and
//! consumers only against a producer that already exists. Violations come
//! back as [`Error::Ordering`] so the signaling layer can report them to
//! the client instead of tearing the process down.

use std::collections::HashMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::media::{Consumer, MediaKind, Producer};
use crate::rtp::{
    derive_consumer_parameters, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpHeaderExtension, RtpParameters,
};
use crate::transport::{
    MediaTransport, PlainTransport, PlainTransportOptions, TransportStats, WebRtcTransport,
    WebRtcTransportOptions,
};
use weir_common::{Error, Result};

/// Payload types 96..=127 are the dynamic range; allocation starts here
/// and skips values the codec catalog already claims.
const DYNAMIC_PT_START: u8 = 96;
const DYNAMIC_PT_END: u8 = 127;

enum Transport {
    WebRtc(WebRtcTransport),
    Plain(PlainTransport),
}

impl Transport {
    fn as_media(&self) -> &dyn MediaTransport {
        match self {
            Transport::WebRtc(t) => t,
            Transport::Plain(t) => t,
        }
    }

    fn as_media_mut(&mut self) -> &mut dyn MediaTransport {
        match self {
            Transport::WebRtc(t) => t,
            Transport::Plain(t) => t,
        }
    }
}

pub struct Router {
    id: Uuid,
    capabilities: RtpCapabilities,
    transports: HashMap<Uuid, Transport>,
}

impl Router {
    /// Build a router from the configured codec catalog. Payload types are
    /// fixed here for the session's lifetime: catalog preferences are
    /// honored, missing ones are assigned from the dynamic range, and each
    /// video codec gets a companion RTX entry.
    pub fn new(media_codecs: &[RtpCodecCapability]) -> Result<Self> {
        let capabilities = compute_capabilities(media_codecs)?;
        let id = Uuid::new_v4();
        info!(router = %id, codecs = capabilities.codecs.len(), "router created");
        Ok(Self {
            id,
            capabilities,
            transports: HashMap::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The immutable capability descriptor clients and bridges negotiate
    /// against.
    pub fn capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    pub async fn create_webrtc_transport(&mut self, opts: WebRtcTransportOptions) -> Result<Uuid> {
        let transport = WebRtcTransport::bind(opts).await?;
        let id = transport.id();
        debug!(router = %self.id, transport = %id, "webrtc transport created");
        self.transports.insert(id, Transport::WebRtc(transport));
        Ok(id)
    }

    pub async fn create_plain_transport(&mut self, opts: PlainTransportOptions) -> Result<Uuid> {
        let transport = PlainTransport::bind(opts).await?;
        let id = transport.id();
        debug!(router = %self.id, transport = %id, comedia = opts.comedia, "plain transport created");
        self.transports.insert(id, Transport::Plain(transport));
        Ok(id)
    }

    pub fn webrtc(&self, id: Uuid) -> Result<&WebRtcTransport> {
        match self.transports.get(&id) {
            Some(Transport::WebRtc(t)) => Ok(t),
            Some(Transport::Plain(_)) => Err(Error::protocol("transport is not a webrtc transport")),
            None => Err(Error::not_found(format!("transport {id}"))),
        }
    }

    pub fn webrtc_mut(&mut self, id: Uuid) -> Result<&mut WebRtcTransport> {
        match self.transports.get_mut(&id) {
            Some(Transport::WebRtc(t)) => Ok(t),
            Some(Transport::Plain(_)) => Err(Error::protocol("transport is not a webrtc transport")),
            None => Err(Error::not_found(format!("transport {id}"))),
        }
    }

    pub fn plain(&self, id: Uuid) -> Result<&PlainTransport> {
        match self.transports.get(&id) {
            Some(Transport::Plain(t)) => Ok(t),
            Some(Transport::WebRtc(_)) => Err(Error::protocol("transport is not a plain transport")),
            None => Err(Error::not_found(format!("transport {id}"))),
        }
    }

    pub fn plain_mut(&mut self, id: Uuid) -> Result<&mut PlainTransport> {
        match self.transports.get_mut(&id) {
            Some(Transport::Plain(t)) => Ok(t),
            Some(Transport::WebRtc(_)) => Err(Error::protocol("transport is not a plain transport")),
            None => Err(Error::not_found(format!("transport {id}"))),
        }
    }

    /// Register a producer on a transport. The transport must be able to
    /// produce now (connected, or a plain transport awaiting its first
    /// packet); anything else is an ordering violation.
    pub fn produce(
        &mut self,
        transport_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Uuid> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| Error::not_found(format!("transport {transport_id}")))?
            .as_media_mut();
        if !transport.can_produce() {
            return Err(Error::ordering(
                "produce requires a connected transport",
            ));
        }
        if rtp_parameters.media_codec().is_none() {
            return Err(Error::negotiation("producer parameters carry no media codec"));
        }
        let producer = Producer::new(kind, rtp_parameters);
        let id = producer.id;
        info!(router = %self.id, transport = %transport_id, producer = %id, %kind, "producer created");
        transport.producers_mut().push(producer);
        Ok(id)
    }

    /// Create a consumer on `transport_id` fed by `producer_id`, with
    /// parameters derived against the receiver's capabilities. A missing
    /// producer is an ordering violation: consume ran before produce.
    pub fn consume(
        &mut self,
        transport_id: Uuid,
        producer_id: Uuid,
        receiver_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Consumer> {
        let producer = self
            .find_producer(producer_id)
            .ok_or_else(|| Error::ordering(format!("producer {producer_id} does not exist yet")))?;
        let kind = producer.kind;
        let rtp_parameters =
            derive_consumer_parameters(&producer.rtp_parameters, receiver_capabilities)?;

        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| Error::not_found(format!("transport {transport_id}")))?
            .as_media_mut();
        if !transport.can_consume() {
            return Err(Error::ordering("consume on closed transport"));
        }
        let consumer = Consumer::new(producer_id, kind, rtp_parameters, paused);
        info!(
            router = %self.id,
            transport = %transport_id,
            consumer = %consumer.id,
            producer = %producer_id,
            %kind,
            paused,
            "consumer created"
        );
        transport.consumers_mut().push(consumer.clone());
        Ok(consumer)
    }

    pub fn find_producer(&self, producer_id: Uuid) -> Option<&Producer> {
        self.transports
            .values()
            .flat_map(|t| t.as_media().producers().iter())
            .find(|p| p.id == producer_id)
    }

    /// Flip the paused flag on every consumer bound to `transport_id`.
    pub fn set_consumers_paused(&mut self, transport_id: Uuid, paused: bool) -> Result<()> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| Error::not_found(format!("transport {transport_id}")))?
            .as_media_mut();
        for consumer in transport.consumers_mut() {
            if paused {
                consumer.pause();
            } else {
                consumer.resume();
            }
        }
        Ok(())
    }

    /// Close one transport, dropping its producers and consumers.
    pub fn close_transport(&mut self, id: Uuid) {
        if let Some(mut transport) = self.transports.remove(&id) {
            match &mut transport {
                Transport::WebRtc(t) => t.close(),
                Transport::Plain(t) => t.close(),
            }
            debug!(router = %self.id, transport = %id, "transport closed");
        }
    }

    /// Close everything. Used for session teardown; idempotent.
    pub fn close(&mut self) {
        let ids: Vec<Uuid> = self.transports.keys().copied().collect();
        for id in ids {
            self.close_transport(id);
        }
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn stats(&self) -> Vec<TransportStats> {
        let mut stats: Vec<TransportStats> =
            self.transports.values().map(|t| t.as_media().stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }
}

fn compute_capabilities(media_codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities> {
    if media_codecs.is_empty() {
        return Err(Error::config("codec catalog is empty"));
    }

    let mut used: Vec<u8> = media_codecs
        .iter()
        .filter_map(|c| c.preferred_payload_type)
        .collect();
    let mut next_dynamic = DYNAMIC_PT_START;
    let mut alloc = move |used: &mut Vec<u8>| -> Result<u8> {
        while used.contains(&next_dynamic) {
            next_dynamic = next_dynamic
                .checked_add(1)
                .ok_or_else(|| Error::config("dynamic payload type range exhausted"))?;
        }
        if next_dynamic > DYNAMIC_PT_END {
            return Err(Error::config("dynamic payload type range exhausted"));
        }
        let pt = next_dynamic;
        used.push(pt);
        Ok(pt)
    };

    let mut codecs = Vec::new();
    for entry in media_codecs {
        if entry.is_rtx() {
            return Err(Error::config(
                "codec catalog must not list RTX; it is added per video codec",
            ));
        }
        let mut codec = entry.clone();
        if codec.preferred_payload_type.is_none() {
            codec.preferred_payload_type = Some(alloc(&mut used)?);
        }
        codec.rtcp_feedback = feedback_for(codec.kind);
        let media_pt = codec.preferred_payload_type.unwrap_or(0);
        let kind = codec.kind;
        let clock_rate = codec.clock_rate;
        codecs.push(codec);

        if kind == MediaKind::Video {
            let mut parameters = std::collections::BTreeMap::new();
            parameters.insert("apt".to_string(), serde_json::json!(media_pt));
            codecs.push(RtpCodecCapability {
                kind,
                mime_type: "video/rtx".into(),
                preferred_payload_type: Some(alloc(&mut used)?),
                clock_rate,
                channels: None,
                parameters,
                rtcp_feedback: Vec::new(),
            });
        }
    }

    let capabilities = RtpCapabilities {
        codecs,
        header_extensions: header_extensions(),
    };
    capabilities.validate()?;
    Ok(capabilities)
}

fn feedback_for(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack"),
            RtcpFeedback::with_parameter("nack", "pli"),
            RtcpFeedback::with_parameter("ccm", "fir"),
            RtcpFeedback::new("goog-remb"),
            RtcpFeedback::new("transport-cc"),
        ],
    }
}

fn header_extensions() -> Vec<RtpHeaderExtension> {
    const SDES_MID: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
    const AUDIO_LEVEL: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
    const ABS_SEND_TIME: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
    const TWCC: &str =
        "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

    vec![
        RtpHeaderExtension {
            kind: MediaKind::Audio,
            uri: SDES_MID.into(),
            preferred_id: 1,
        },
        RtpHeaderExtension {
            kind: MediaKind::Video,
            uri: SDES_MID.into(),
            preferred_id: 1,
        },
        RtpHeaderExtension {
            kind: MediaKind::Audio,
            uri: ABS_SEND_TIME.into(),
            preferred_id: 4,
        },
        RtpHeaderExtension {
            kind: MediaKind::Video,
            uri: ABS_SEND_TIME.into(),
            preferred_id: 4,
        },
        RtpHeaderExtension {
            kind: MediaKind::Audio,
            uri: TWCC.into(),
            preferred_id: 5,
        },
        RtpHeaderExtension {
            kind: MediaKind::Video,
            uri: TWCC.into(),
            preferred_id: 5,
        },
        RtpHeaderExtension {
            kind: MediaKind::Audio,
            uri: AUDIO_LEVEL.into(),
            preferred_id: 10,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpCodecParameters, RtpEncoding};
    use crate::transport::DtlsRole;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn catalog() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".into(),
                preferred_payload_type: Some(111),
                clock_rate: 48_000,
                channels: Some(2),
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".into(),
                preferred_payload_type: Some(96),
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            },
        ]
    }

    fn vp8_params() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncoding {
                ssrc: Some(424_242),
                max_bitrate: None,
            }],
            rtcp: Default::default(),
        }
    }

    fn webrtc_opts() -> WebRtcTransportOptions {
        WebRtcTransportOptions { listen_ip: LOOPBACK }
    }

    fn dtls() -> crate::transport::DtlsParameters {
        crate::transport::DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: Vec::new(),
        }
    }

    #[test]
    fn capabilities_add_rtx_and_feedback() {
        let router = Router::new(&catalog()).unwrap();
        let caps = router.capabilities();
        // opus + VP8 + VP8's RTX companion.
        assert_eq!(caps.codecs.len(), 3);
        let vp8 = caps.find_codec("video/VP8").unwrap();
        assert!(vp8.rtcp_feedback.iter().any(|f| f.sdp_value() == "nack pli"));
        let rtx = caps.find_codec("video/rtx").unwrap();
        assert_eq!(rtx.parameters.get("apt"), Some(&serde_json::json!(96)));
        assert_eq!(caps.header_extension_id(MediaKind::Video, "abs-send-time"), 4);
    }

    #[test]
    fn catalog_with_rtx_entry_is_rejected() {
        let mut bad = catalog();
        bad.push(RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/rtx".into(),
            preferred_payload_type: Some(97),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        });
        assert!(matches!(Router::new(&bad), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn produce_before_connect_is_an_ordering_error() {
        let mut router = Router::new(&catalog()).unwrap();
        let transport = router.create_webrtc_transport(webrtc_opts()).await.unwrap();

        let err = router
            .produce(transport, MediaKind::Video, vp8_params())
            .unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));

        router.webrtc_mut(transport).unwrap().connect(dtls()).unwrap();
        let producer = router
            .produce(transport, MediaKind::Video, vp8_params())
            .unwrap();
        assert!(router.find_producer(producer).is_some());
    }

    #[tokio::test]
    async fn consume_before_produce_is_an_ordering_error() {
        let mut router = Router::new(&catalog()).unwrap();
        let transport = router.create_webrtc_transport(webrtc_opts()).await.unwrap();
        let caps = router.capabilities().clone();

        let err = router
            .consume(transport, Uuid::new_v4(), &caps, false)
            .unwrap_err();
        assert!(matches!(err, Error::Ordering(_)));
    }

    #[tokio::test]
    async fn consume_derives_parameters_and_tracks_pause_state() {
        let mut router = Router::new(&catalog()).unwrap();
        let send = router.create_webrtc_transport(webrtc_opts()).await.unwrap();
        router.webrtc_mut(send).unwrap().connect(dtls()).unwrap();
        let producer = router.produce(send, MediaKind::Video, vp8_params()).unwrap();

        let recv = router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: LOOPBACK,
                rtcp_mux: false,
                comedia: false,
                enable_srtp: false,
            })
            .await
            .unwrap();

        let caps = router.capabilities().clone();
        let consumer = router.consume(recv, producer, &caps, true).unwrap();
        assert!(consumer.paused());
        assert_eq!(consumer.producer_id, producer);
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 96);

        router.set_consumers_paused(recv, false).unwrap();
        let stats = router.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats.iter().map(|s| s.consumers).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn plain_transport_produces_while_awaiting_first_packet() {
        let mut router = Router::new(&catalog()).unwrap();
        let recv = router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: LOOPBACK,
                rtcp_mux: true,
                comedia: true,
                enable_srtp: false,
            })
            .await
            .unwrap();
        // Comedia transports accept producers before discovery completes.
        let producer = router.produce(recv, MediaKind::Video, vp8_params());
        assert!(producer.is_ok());
        assert!(router
            .plain_mut(recv)
            .unwrap()
            .wait_for_discovery(Duration::from_millis(20))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_everything() {
        let mut router = Router::new(&catalog()).unwrap();
        let send = router.create_webrtc_transport(webrtc_opts()).await.unwrap();
        router.webrtc_mut(send).unwrap().connect(dtls()).unwrap();
        router.produce(send, MediaKind::Video, vp8_params()).unwrap();

        router.close();
        assert_eq!(router.transport_count(), 0);
        assert!(router.webrtc(send).is_err());
        router.close();
    }
}
