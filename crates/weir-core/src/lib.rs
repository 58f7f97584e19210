//! Core orchestration model for Weir.
//!
//! This crate holds the state the signaling server keeps on behalf of the
//! media engine: the negotiated capability descriptor of an engine session
//! (the "router"), the lifecycle of its transports, and the bookkeeping
//! that binds producers to consumers across transports. It also builds and
//! parses the minimal SDP offer/answer subset used to bridge a session to
//! a peer engine that speaks no shared capability protocol.
//!
//! Ordering rules (capabilities before transports, connect before produce,
//! produce before consume) are enforced here as state-machine
//! preconditions with typed errors, never left to caller discipline.

#![forbid(unsafe_code)]

pub mod media;
pub mod router;
pub mod rtp;
pub mod sdp;
pub mod transport;

pub use media::{Consumer, MediaKind, Producer};
pub use router::Router;
pub use rtp::{RtpCapabilities, RtpCodecCapability, RtpParameters};
pub use transport::{
    DtlsParameters, PlainTransport, PlainTransportOptions, TransportState, WebRtcTransport,
};

pub use weir_common::{Error, Result};
