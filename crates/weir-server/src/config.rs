//! Validated runtime configuration.
//!
//! Built once from CLI arguments in `main`, then shared read-only through
//! the session. The codec catalog defined here is the source of truth for
//! what a session may negotiate.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use weir_common::{Error, Result};
use weir_core::media::MediaKind;
use weir_core::rtp::RtpCodecCapability;

/// Fixed destination ports for a recorder started out-of-band. The
/// recorder listens; the session connects its plain transports here.
#[derive(Debug, Clone, Copy)]
pub struct RecorderPorts {
    pub audio_port: u16,
    pub audio_rtcp_port: u16,
    pub video_port: u16,
    pub video_rtcp_port: u16,
}

impl RecorderPorts {
    /// Build the port set from the two RTP ports, with RTCP on port + 1.
    pub fn from_rtp_ports(audio_port: u16, video_port: u16) -> Result<Self> {
        let rtcp = |port: u16| {
            port.checked_add(1).ok_or_else(|| {
                Error::config(format!("recorder port {port} leaves no room for RTCP on port + 1"))
            })
        };
        Ok(Self {
            audio_port,
            audio_rtcp_port: rtcp(audio_port)?,
            video_port,
            video_rtcp_port: rtcp(video_port)?,
        })
    }
}

impl Default for RecorderPorts {
    fn default() -> Self {
        Self {
            audio_port: 5004,
            audio_rtcp_port: 5005,
            video_port: 5006,
            video_rtcp_port: 5007,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// Directory of the static demo page.
    pub public_dir: PathBuf,
    /// Address media sockets bind to, and the address announced in bridge
    /// offers.
    pub media_ip: IpAddr,
    /// WebSocket URL of the peer pipeline engine.
    pub pipeline_url: String,
    /// Where recordings and the generated receiver SDP land.
    pub recording_dir: PathBuf,
    pub recorder_ports: RecorderPorts,
    /// Offer H264 alongside VP8 in the catalog.
    pub enable_h264: bool,
}

impl Config {
    /// Sanity checks that should stop the process at startup rather than
    /// surface mid-session.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_url.is_empty() {
            return Err(Error::config("pipeline URL must not be empty"));
        }
        if !(self.pipeline_url.starts_with("ws://") || self.pipeline_url.starts_with("wss://")) {
            return Err(Error::config(format!(
                "pipeline URL must be a ws:// or wss:// URL, got {}",
                self.pipeline_url
            )));
        }
        let p = &self.recorder_ports;
        let ports = [
            p.audio_port,
            p.audio_rtcp_port,
            p.video_port,
            p.video_rtcp_port,
        ];
        for (i, a) in ports.iter().enumerate() {
            if *a == 0 {
                return Err(Error::config("recorder ports must be nonzero"));
            }
            if ports[i + 1..].contains(a) {
                return Err(Error::config(format!("recorder port {a} is used twice")));
            }
        }
        Ok(())
    }

    /// Every codec a session may negotiate.
    pub fn codec_catalog(&self) -> Vec<RtpCodecCapability> {
        let mut catalog = vec![opus(), vp8()];
        if self.enable_h264 {
            catalog.push(h264());
        }
        catalog
    }

    /// Pick the session's codec set: always opus for audio, plus exactly
    /// one video codec, by hint or VP8 by default. A hint naming a codec
    /// outside the catalog is rejected; the hint comes from the client
    /// but the catalog is server configuration.
    pub fn select_codecs(&self, video_codec: Option<&str>) -> Result<Vec<RtpCodecCapability>> {
        let catalog = self.codec_catalog();
        let hint = video_codec.unwrap_or("VP8");
        let video = catalog
            .iter()
            .find(|c| {
                c.kind == MediaKind::Video && c.encoding_name().eq_ignore_ascii_case(hint)
            })
            .cloned()
            .ok_or_else(|| {
                Error::config(format!("video codec {hint} is not in the catalog"))
            })?;
        Ok(vec![opus(), video])
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            public_dir: PathBuf::from("public"),
            media_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            pipeline_url: "ws://127.0.0.1:8888/pipeline".into(),
            recording_dir: PathBuf::from("recording"),
            recorder_ports: RecorderPorts::default(),
            enable_h264: false,
        }
    }
}

fn opus() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Audio,
        mime_type: "audio/opus".into(),
        preferred_payload_type: Some(111),
        clock_rate: 48_000,
        channels: Some(2),
        parameters: BTreeMap::from([("minptime".into(), serde_json::json!(10))]),
        rtcp_feedback: Vec::new(),
    }
}

fn vp8() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/VP8".into(),
        preferred_payload_type: Some(96),
        clock_rate: 90_000,
        channels: None,
        parameters: BTreeMap::new(),
        rtcp_feedback: Vec::new(),
    }
}

fn h264() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/H264".into(),
        preferred_payload_type: Some(125),
        clock_rate: 90_000,
        channels: None,
        parameters: BTreeMap::from([
            ("level-asymmetry-allowed".into(), serde_json::json!(1)),
            ("packetization-mode".into(), serde_json::json!(1)),
            ("profile-level-id".into(), serde_json::json!("42e01f")),
        ]),
        rtcp_feedback: Vec::new(),
    }
}
