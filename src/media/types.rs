#![forbid(unsafe_code)]

// Common types and error handling for the media module

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("No live worker available")]
    NoWorkerAvailable,

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Handle already closed: {0}")]
    Closed(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Direction of a WebRTC transport, from the participant's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// Video source tag supplied by clients when producing video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Camera,
    Screen,
}

/// Media role a participant can hold at most one producer for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaRole {
    Audio,
    Video,
    Screen,
}

impl MediaRole {
    /// Resolves the role of a new producer from its kind and optional source tag.
    /// Audio producers are always `Audio`; video is `Screen` only when tagged so.
    pub fn resolve(kind: MediaKind, producer_type: Option<ProducerType>) -> Self {
        match (kind, producer_type) {
            (MediaKind::Audio, _) => MediaRole::Audio,
            (MediaKind::Video, Some(ProducerType::Screen)) => MediaRole::Screen,
            (MediaKind::Video, _) => MediaRole::Video,
        }
    }

    pub fn kind(self) -> MediaKind {
        match self {
            MediaRole::Audio => MediaKind::Audio,
            MediaRole::Video | MediaRole::Screen => MediaKind::Video,
        }
    }

    /// Source tag announced alongside `newProducer` for video roles
    pub fn producer_type(self) -> Option<ProducerType> {
        match self {
            MediaRole::Audio => None,
            MediaRole::Video => Some(ProducerType::Camera),
            MediaRole::Screen => Some(ProducerType::Screen),
        }
    }
}

/// Transport information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Metadata attached to every producer created through the engine
#[derive(Debug, Clone)]
pub struct ProducerMeta {
    pub user_id: String,
    pub channel_id: String,
    pub role: MediaRole,
}

/// Capability set served to clients.
///
/// Once any router exists its negotiated capabilities are used; before that
/// the configured codec list is served, which is equivalent because every
/// router is created from the same codec configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RouterCapabilities {
    Negotiated(RtpCapabilitiesFinalized),
    Configured(RtpCapabilities),
}
