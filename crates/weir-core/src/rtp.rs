//! RTP capability and parameter types.
//!
//! These mirror the wire shapes a browser-side device expects (camelCase
//! JSON), so a capability descriptor returned from session start can be
//! fed straight into client device initialization and come back untouched
//! in consume requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::media::MediaKind;
use weir_common::{Error, Result};

/// An RTCP feedback mechanism advertised for a codec ("nack", "nack pli",
/// "ccm fir", "goog-remb", "transport-cc").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl RtcpFeedback {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: None,
        }
    }

    pub fn with_parameter(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: Some(parameter.to_string()),
        }
    }

    /// Render as the value part of an `a=rtcp-fb` SDP attribute.
    pub fn sdp_value(&self) -> String {
        match &self.parameter {
            Some(p) => format!("{} {}", self.kind, p),
            None => self.kind.clone(),
        }
    }
}

/// A codec the engine session can route, as listed in the configuration
/// catalog and in the computed capability descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Codec subtype, i.e. the part after the `/` in the MIME type.
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }

    pub fn is_rtx(&self) -> bool {
        self.encoding_name().eq_ignore_ascii_case("rtx")
    }

    fn matches(&self, other: &RtpCodecCapability) -> bool {
        self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && self.channels.unwrap_or(1) == other.channels.unwrap_or(1)
    }
}

/// A header extension the engine supports, with its preferred id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    pub kind: MediaKind,
    pub uri: String,
    pub preferred_id: u8,
}

/// The authoritative descriptor of everything an engine session can
/// negotiate: codecs (including engine-added RTX entries and feedback
/// mechanisms) and header extensions. Immutable once computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Check internal consistency: every codec has a payload type, payload
    /// types don't collide, RTX codecs reference a clock rate.
    pub fn validate(&self) -> Result<()> {
        if self.codecs.iter().all(|c| c.is_rtx()) {
            return Err(Error::negotiation("capability set has no media codecs"));
        }
        let mut seen = Vec::new();
        for codec in &self.codecs {
            let pt = codec
                .preferred_payload_type
                .ok_or_else(|| Error::protocol(format!("{} has no payload type", codec.mime_type)))?;
            if seen.contains(&pt) {
                return Err(Error::protocol(format!("duplicate payload type {pt}")));
            }
            seen.push(pt);
        }
        Ok(())
    }

    pub fn find_codec(&self, mime_type: &str) -> Option<&RtpCodecCapability> {
        self.codecs
            .iter()
            .find(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }

    /// The engine's preferred payload type for a codec, 0 if unknown.
    pub fn preferred_payload_type(&self, mime_type: &str) -> u8 {
        self.find_codec(mime_type)
            .and_then(|c| c.preferred_payload_type)
            .unwrap_or(0)
    }

    /// The preferred id of a header extension whose URI contains `name`.
    pub fn header_extension_id(&self, kind: MediaKind, name: &str) -> u8 {
        self.header_extensions
            .iter()
            .find(|e| e.kind == kind && e.uri.contains(name))
            .map(|e| e.preferred_id)
            .unwrap_or(0)
    }
}

/// Codec entry inside concrete send/receive parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    pub fn encoding_name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }

    pub fn is_rtx(&self) -> bool {
        self.encoding_name().eq_ignore_ascii_case("rtx")
    }
}

/// Header extension entry inside concrete parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
}

/// One RTP stream within the parameters (we never do simulcast on the
/// engine-facing legs, so there is one encoding with one SSRC).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// Stream-level RTCP parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default)]
    pub reduced_size: bool,
}

/// Concrete parameters of one producer or consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncoding>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// First media (non-RTX) codec, if any.
    pub fn media_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| !c.is_rtx())
    }

    /// SSRC of the first encoding, if assigned.
    pub fn ssrc(&self) -> Option<u32> {
        self.encodings.first().and_then(|e| e.ssrc)
    }
}

/// Derive the parameters for a consumer feeding a downstream receiver.
///
/// Intersects the producer's codecs with the receiver's capabilities; the
/// receiver's preferred payload types win (it is the one that has to parse
/// the packets). Fails with a negotiation error when no common media codec
/// exists. The consumer gets a fresh SSRC; the CNAME is inherited from the
/// producer so RTCP correlation survives the hop.
pub fn derive_consumer_parameters(
    producer: &RtpParameters,
    receiver: &RtpCapabilities,
) -> Result<RtpParameters> {
    let mut codecs = Vec::new();
    for codec in producer.codecs.iter().filter(|c| !c.is_rtx()) {
        let probe = RtpCodecCapability {
            kind: MediaKind::Audio, // kind is not part of the match
            mime_type: codec.mime_type.clone(),
            preferred_payload_type: None,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: BTreeMap::new(),
            rtcp_feedback: Vec::new(),
        };
        if let Some(cap) = receiver
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .find(|c| c.matches(&probe))
        {
            // Feedback limited to what both sides understand.
            let rtcp_feedback = codec
                .rtcp_feedback
                .iter()
                .filter(|fb| cap.rtcp_feedback.contains(fb))
                .cloned()
                .collect();
            codecs.push(RtpCodecParameters {
                mime_type: cap.mime_type.clone(),
                payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                clock_rate: cap.clock_rate,
                channels: cap.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback,
            });
        }
    }

    if codecs.is_empty() {
        return Err(Error::negotiation(
            "no codec in common between producer and receiver capabilities",
        ));
    }

    let header_extensions = producer
        .header_extensions
        .iter()
        .filter(|ext| receiver.header_extensions.iter().any(|e| e.uri == ext.uri))
        .cloned()
        .collect();

    Ok(RtpParameters {
        mid: None,
        codecs,
        header_extensions,
        encodings: vec![RtpEncoding {
            ssrc: Some(generate_ssrc()),
            max_bitrate: None,
        }],
        rtcp: RtcpParameters {
            cname: producer
                .rtcp
                .cname
                .clone()
                .or_else(|| Some(generate_cname())),
            reduced_size: producer.rtcp.reduced_size,
        },
    })
}

/// Random SSRC in the range SFU engines typically pick from.
pub fn generate_ssrc() -> u32 {
    rand::random::<u32>() | 1
}

/// Random RTCP canonical name.
pub fn generate_cname() -> String {
    format!("weir-{}", hex::encode(rand::random::<[u8; 4]>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus_cap(pt: u8) -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: Some(pt),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![RtcpFeedback::new("transport-cc")],
        }
    }

    fn vp8_cap(pt: u8) -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: Some(pt),
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![
                RtcpFeedback::new("nack"),
                RtcpFeedback::with_parameter("nack", "pli"),
                RtcpFeedback::new("goog-remb"),
            ],
        }
    }

    fn vp8_producer_params() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 101,
                clock_rate: 90_000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: vec![
                    RtcpFeedback::new("nack"),
                    RtcpFeedback::with_parameter("nack", "pli"),
                ],
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncoding {
                ssrc: Some(1234),
                max_bitrate: None,
            }],
            rtcp: RtcpParameters {
                cname: Some("browser".into()),
                reduced_size: true,
            },
        }
    }

    #[test]
    fn consumer_parameters_take_receiver_payload_type() {
        let receiver = RtpCapabilities {
            codecs: vec![vp8_cap(96)],
            header_extensions: Vec::new(),
        };
        let params = derive_consumer_parameters(&vp8_producer_params(), &receiver).unwrap();
        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.codecs[0].payload_type, 96);
        assert_eq!(params.rtcp.cname.as_deref(), Some("browser"));
        assert!(params.ssrc().is_some());
        assert_ne!(params.ssrc(), Some(1234));
    }

    #[test]
    fn consumer_feedback_is_intersected() {
        let receiver = RtpCapabilities {
            codecs: vec![vp8_cap(96)],
            header_extensions: Vec::new(),
        };
        let params = derive_consumer_parameters(&vp8_producer_params(), &receiver).unwrap();
        // Producer offers nack + nack pli; receiver also knows goog-remb,
        // but feedback the producer never sends must not appear.
        let fb = &params.codecs[0].rtcp_feedback;
        assert!(fb.contains(&RtcpFeedback::new("nack")));
        assert!(!fb.iter().any(|f| f.kind == "goog-remb"));
    }

    #[test]
    fn no_common_codec_is_a_negotiation_error() {
        let receiver = RtpCapabilities {
            codecs: vec![opus_cap(111)],
            header_extensions: Vec::new(),
        };
        let err = derive_consumer_parameters(&vp8_producer_params(), &receiver).unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
    }

    #[test]
    fn capabilities_validate_rejects_duplicate_payload_types() {
        let caps = RtpCapabilities {
            codecs: vec![vp8_cap(96), opus_cap(96)],
            header_extensions: Vec::new(),
        };
        assert!(caps.validate().is_err());

        let caps = RtpCapabilities {
            codecs: vec![vp8_cap(96), opus_cap(111)],
            header_extensions: Vec::new(),
        };
        assert!(caps.validate().is_ok());
    }

    #[test]
    fn capability_descriptor_round_trips_through_json() {
        let caps = RtpCapabilities {
            codecs: vec![opus_cap(111), vp8_cap(96)],
            header_extensions: vec![RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".into(),
                preferred_id: 4,
            }],
        };
        let json = serde_json::to_string(&caps).unwrap();
        let back: RtpCapabilities = serde_json::from_str(&json).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.codecs.len(), 2);
        assert_eq!(back.preferred_payload_type("video/vp8"), 96);
        assert_eq!(back.header_extension_id(MediaKind::Video, "abs-send-time"), 4);
    }
}
