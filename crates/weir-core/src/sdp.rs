//! Minimal SDP subset for bridging to engines that speak no shared
//! capability protocol.
//!
//! Only what the offer/answer handshake with an RTP endpoint needs:
//! single-codec media sections with explicit RTP/RTCP ports, optional
//! SDES crypto for SRTP legs, abs-send-time extmap and ssrc/cname lines.
//! The parser is equally narrow; it extracts the addressing and codec
//! facts the session needs and ignores everything else.

use std::fmt::Write as _;
use std::net::IpAddr;

use crate::media::MediaKind;
use crate::rtp::{RtcpFeedback, RtpCapabilities, RtpCodecCapability};
use crate::transport::SrtpParameters;
use weir_common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
}

impl Direction {
    fn attribute(self) -> &'static str {
        match self {
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
        }
    }
}

/// One `m=` section of an offer or a receiver description.
#[derive(Debug, Clone)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub port: u16,
    /// Explicit RTCP port (`a=rtcp:`); `None` when RTCP rides on `port+1`
    /// implicitly.
    pub rtcp_port: Option<u16>,
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub rtcp_feedback: Vec<RtcpFeedback>,
    pub direction: Option<Direction>,
    /// abs-send-time extension id, 0 to omit the extmap line.
    pub abs_send_time_id: u8,
    /// Present on SRTP legs; switches the profile to RTP/SAVPF and emits
    /// the SDES crypto line.
    pub srtp: Option<SrtpParameters>,
    pub ssrc_cname: Option<(u32, String)>,
}

impl MediaSection {
    fn render(&self, out: &mut String) {
        let profile = if self.srtp.is_some() {
            "RTP/SAVPF"
        } else {
            "RTP/AVPF"
        };
        let _ = writeln!(out, "m={} {} {} {}", self.kind, self.port, profile, self.payload_type);
        if let Some(id) = nonzero(self.abs_send_time_id) {
            let _ = writeln!(
                out,
                "a=extmap:{id} http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time"
            );
        }
        if let Some(direction) = self.direction {
            let _ = writeln!(out, "a={}", direction.attribute());
        }
        if let Some(rtcp_port) = self.rtcp_port {
            let _ = writeln!(out, "a=rtcp:{rtcp_port}");
        }
        if let Some(srtp) = &self.srtp {
            let _ = writeln!(
                out,
                "a=crypto:2 {} inline:{}|2^31|1:1",
                srtp.crypto_suite, srtp.key_base64
            );
        }
        match self.channels {
            Some(channels) if channels > 1 => {
                let _ = writeln!(
                    out,
                    "a=rtpmap:{} {}/{}/{}",
                    self.payload_type, self.encoding_name, self.clock_rate, channels
                );
            }
            _ => {
                let _ = writeln!(
                    out,
                    "a=rtpmap:{} {}/{}",
                    self.payload_type, self.encoding_name, self.clock_rate
                );
            }
        }
        for fb in &self.rtcp_feedback {
            let _ = writeln!(out, "a=rtcp-fb:{} {}", self.payload_type, fb.sdp_value());
        }
        if let Some((ssrc, cname)) = &self.ssrc_cname {
            let _ = writeln!(out, "a=ssrc:{ssrc} cname:{cname}");
        }
    }
}

fn nonzero(id: u8) -> Option<u8> {
    (id != 0).then_some(id)
}

/// Render a complete session description with the given media sections.
pub fn build_sdp(ip: IpAddr, sections: &[MediaSection]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "v=0");
    let _ = writeln!(out, "o=- 0 0 IN IP4 {ip}");
    let _ = writeln!(out, "s=-");
    let _ = writeln!(out, "c=IN IP4 {ip}");
    let _ = writeln!(out, "t=0 0");
    for section in sections {
        section.render(&mut out);
    }
    out
}

/// Render a single-section offer. Convenience wrapper for the bridge
/// legs, which negotiate one kind at a time.
pub fn build_offer(ip: IpAddr, section: &MediaSection) -> String {
    build_sdp(ip, std::slice::from_ref(section))
}

/// One codec line extracted from an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerCodec {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

/// The facts the session needs out of a remote answer: where to send
/// media, and what the remote actually accepted.
#[derive(Debug, Clone)]
pub struct SdpAnswer {
    pub connection_ip: IpAddr,
    pub port: u16,
    pub rtcp_port: u16,
    pub codecs: Vec<AnswerCodec>,
    pub ssrc: Option<u32>,
    pub cname: Option<String>,
}

impl SdpAnswer {
    /// Express the answer's codec list as a capability set, so it can be
    /// intersected against the session's own capabilities.
    pub fn to_capabilities(&self, kind: MediaKind) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self
                .codecs
                .iter()
                .map(|c| RtpCodecCapability {
                    kind,
                    mime_type: format!("{kind}/{}", c.encoding_name),
                    preferred_payload_type: Some(c.payload_type),
                    clock_rate: c.clock_rate,
                    channels: c.channels,
                    parameters: Default::default(),
                    rtcp_feedback: Vec::new(),
                })
                .collect(),
            header_extensions: Vec::new(),
        }
    }
}

/// Parse the first media section of an answer.
///
/// The connection address may appear at session level, at media level, or
/// both; media level wins. The RTCP port defaults to `port + 1` when no
/// `a=rtcp:` attribute is present.
pub fn parse_answer(sdp: &str) -> Result<SdpAnswer> {
    let mut session_ip: Option<IpAddr> = None;
    let mut media_ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut rtcp_port: Option<u16> = None;
    let mut codecs: Vec<AnswerCodec> = Vec::new();
    let mut ssrc: Option<u32> = None;
    let mut cname: Option<String> = None;
    let mut in_media = false;

    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("m=") {
            if in_media {
                // Only the first media section matters.
                break;
            }
            in_media = true;
            let mut fields = rest.split_whitespace();
            let _kind = fields
                .next()
                .ok_or_else(|| Error::protocol("malformed m= line"))?;
            port = Some(
                fields
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| Error::protocol(format!("malformed m= line: {line}")))?,
            );
        } else if let Some(rest) = line.strip_prefix("c=") {
            let ip = parse_connection(rest)
                .ok_or_else(|| Error::protocol(format!("malformed c= line: {line}")))?;
            if in_media {
                media_ip = Some(ip);
            } else {
                session_ip = Some(ip);
            }
        } else if !in_media {
            continue;
        } else if let Some(rest) = line.strip_prefix("a=rtcp:") {
            rtcp_port = rest.split_whitespace().next().and_then(|p| p.parse().ok());
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some(codec) = parse_rtpmap(rest) {
                codecs.push(codec);
            }
        } else if let Some(rest) = line.strip_prefix("a=ssrc:") {
            let mut fields = rest.split_whitespace();
            if ssrc.is_none() {
                ssrc = fields.next().and_then(|s| s.parse().ok());
            } else {
                fields.next();
            }
            if cname.is_none() {
                cname = fields
                    .next()
                    .and_then(|attr| attr.strip_prefix("cname:"))
                    .map(str::to_string);
            }
        }
    }

    let port = port.ok_or_else(|| Error::protocol("answer has no media section"))?;
    let connection_ip = media_ip
        .or(session_ip)
        .ok_or_else(|| Error::protocol("answer has no connection address"))?;

    Ok(SdpAnswer {
        connection_ip,
        port,
        rtcp_port: rtcp_port.unwrap_or_else(|| port.saturating_add(1)),
        codecs,
        ssrc,
        cname,
    })
}

fn parse_connection(rest: &str) -> Option<IpAddr> {
    let mut fields = rest.split_whitespace();
    let nettype = fields.next()?;
    let addrtype = fields.next()?;
    if nettype != "IN" || !(addrtype == "IP4" || addrtype == "IP6") {
        return None;
    }
    // Strip any TTL/count suffix ("224.2.1.1/127").
    let addr = fields.next()?.split('/').next()?;
    addr.parse().ok()
}

fn parse_rtpmap(rest: &str) -> Option<AnswerCodec> {
    let (pt, encoding) = rest.split_once(' ')?;
    let payload_type = pt.parse().ok()?;
    let mut parts = encoding.trim().split('/');
    let encoding_name = parts.next()?.to_string();
    let clock_rate = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok());
    Some(AnswerCodec {
        payload_type,
        encoding_name,
        clock_rate,
        channels,
    })
}
