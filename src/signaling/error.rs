#![forbid(unsafe_code)]

// Errors raised while handling one signaling message

use crate::media::types::MediaError;
use crate::room::RoomError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Not joined to a channel")]
    NotJoined,

    #[error("Already joined to channel {0}")]
    AlreadyJoined(String),

    #[error("Transport {0} not found")]
    TransportNotFound(String),

    #[error("Producer {0} not found")]
    ProducerNotFound(String),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(String),

    #[error("Participant {0} not found")]
    ParticipantNotFound(String),

    #[error("No receive transport")]
    NoReceiveTransport,

    #[error("Cannot consume producer {0}")]
    CannotConsume(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SignalingError {
    /// Stable error category sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::NotJoined
            | SignalingError::AlreadyJoined(_)
            | SignalingError::NoReceiveTransport
            | SignalingError::CannotConsume(_) => "precondition",
            SignalingError::TransportNotFound(_)
            | SignalingError::ProducerNotFound(_)
            | SignalingError::ConsumerNotFound(_)
            | SignalingError::ParticipantNotFound(_) => "not_found",
            SignalingError::InvalidMessage(_) => "invalid_message",
            SignalingError::Media(_) => "engine",
            SignalingError::Store(_) => "store",
        }
    }
}

impl From<RoomError> for SignalingError {
    fn from(e: RoomError) -> Self {
        match e {
            RoomError::Media(e) => SignalingError::Media(e),
            RoomError::Store(e) => SignalingError::Store(e),
            RoomError::ParticipantNotFound { user_id, .. } => SignalingError::ParticipantNotFound(user_id),
            RoomError::UpdateConflict(user_id) => SignalingError::Store(StoreError::Command(format!(
                "concurrent updates to participant {user_id}"
            ))),
        }
    }
}

pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_errors_keep_their_category() {
        let e: SignalingError = RoomError::ParticipantNotFound {
            channel_id: "general".into(),
            user_id: "alice".into(),
        }
        .into();
        assert_eq!(e.code(), "not_found");

        let e: SignalingError = RoomError::Media(MediaError::NoWorkerAvailable).into();
        assert_eq!(e.code(), "engine");

        let e: SignalingError = RoomError::UpdateConflict("alice".into()).into();
        assert_eq!(e.code(), "store");
    }
}
