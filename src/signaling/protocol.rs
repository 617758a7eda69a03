#![forbid(unsafe_code)]

// Signaling protocol - message types exchanged over the WebSocket

use crate::media::types::{ProducerType, RouterCapabilities, TransportDirection, TransportInfo};
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// Client-to-server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a voice channel
    #[serde(rename_all = "camelCase")]
    Join {
        channel_id: String,
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    /// Leave a channel; defaults to the joined one
    #[serde(rename_all = "camelCase")]
    Leave {
        #[serde(default)]
        channel_id: Option<String>,
    },
    CreateTransport {
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        producer_type: Option<ProducerType>,
    },
    /// Subscribe to a producer; capabilities default to those sent on join
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateState {
        #[serde(default)]
        muted: Option<bool>,
        #[serde(default)]
        deafened: Option<bool>,
        #[serde(default)]
        video_enabled: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
}

impl ClientMessage {
    /// Wire tags this server understands
    pub const TYPES: [&'static str; 8] = [
        "join",
        "leave",
        "createTransport",
        "connectTransport",
        "produce",
        "consume",
        "updateState",
        "resumeConsumer",
    ];

    pub fn is_known_type(tag: &str) -> bool {
        Self::TYPES.contains(&tag)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::CreateTransport { .. } => "createTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::UpdateState { .. } => "updateState",
            ClientMessage::ResumeConsumer { .. } => "resumeConsumer",
        }
    }
}

/// Outcome of parsing one inbound frame
#[derive(Debug)]
pub enum Inbound {
    Message(Box<ClientMessage>),
    /// Well-formed object with a `type` this server does not handle
    Unknown(String),
}

/// Parses an inbound frame. Unknown message types are not an error.
pub fn parse_client_message(raw: &str) -> Result<Inbound, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if let Some(tag) = value.get("type").and_then(|t| t.as_str()) {
        if !ClientMessage::is_known_type(tag) {
            return Ok(Inbound::Unknown(tag.to_string()));
        }
    }
    serde_json::from_value(value).map(|m| Inbound::Message(Box::new(m)))
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RouterCapabilities {
        rtp_capabilities: RouterCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        user_id: String,
        kind: MediaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        producer_type: Option<ProducerType>,
    },
    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    UserStateUpdate {
        user_id: String,
        muted: bool,
        deafened: bool,
        video_enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl From<TransportInfo> for ServerMessage {
    fn from(info: TransportInfo) -> Self {
        ServerMessage::TransportCreated {
            transport_id: info.id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
        }
    }
}
