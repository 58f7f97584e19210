//! Producer and consumer handles.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rtp::RtpParameters;

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// An inbound media source bound to one transport.
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: Uuid,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    paused: bool,
}

impl Producer {
    pub fn new(kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            rtp_parameters,
            paused: false,
        }
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }
}

/// An outbound media sink bound to one transport, fed by one producer.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    paused: bool,
}

impl Consumer {
    pub fn new(
        producer_id: Uuid,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer_id,
            kind,
            rtp_parameters,
            paused,
        }
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }
}
