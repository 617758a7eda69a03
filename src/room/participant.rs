#![forbid(unsafe_code)]

// Durable room and participant records as stored in the shared state store

use crate::media::types::{MediaRole, TransportDirection};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub channel_id: String,
    pub router_id: String,
    pub created_at: i64,
}

/// Producer id per media role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSlots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
}

impl ProducerSlots {
    pub fn get(&self, role: MediaRole) -> Option<&str> {
        match role {
            MediaRole::Audio => self.audio.as_deref(),
            MediaRole::Video => self.video.as_deref(),
            MediaRole::Screen => self.screen.as_deref(),
        }
    }

    pub fn set(&mut self, role: MediaRole, producer_id: String) {
        let slot = match role {
            MediaRole::Audio => &mut self.audio,
            MediaRole::Video => &mut self.video,
            MediaRole::Screen => &mut self.screen,
        };
        *slot = Some(producer_id);
    }

    /// Occupied slots
    pub fn iter(&self) -> impl Iterator<Item = (MediaRole, &str)> {
        [MediaRole::Audio, MediaRole::Video, MediaRole::Screen]
            .into_iter()
            .filter_map(move |role| self.get(role).map(|id| (role, id)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleState {
    pub muted: bool,
    pub deafened: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// Partial toggle update; absent fields are left unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    pub muted: Option<bool>,
    pub deafened: Option<bool>,
    pub video_enabled: Option<bool>,
}

impl StatePatch {
    pub fn apply(&self, state: &mut ToggleState) {
        if let Some(muted) = self.muted {
            state.muted = muted;
        }
        if let Some(deafened) = self.deafened {
            state.deafened = deafened;
        }
        if let Some(video_enabled) = self.video_enabled {
            state.video_enabled = video_enabled;
        }
    }
}

/// A user's membership in one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub user_id: String,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_transport_id: Option<String>,
    #[serde(default)]
    pub producers: ProducerSlots,
    #[serde(default)]
    pub state: ToggleState,
    pub joined_at: i64,
}

impl ParticipantRecord {
    pub fn new(user_id: &str, connection_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            send_transport_id: None,
            recv_transport_id: None,
            producers: ProducerSlots::default(),
            state: ToggleState::default(),
            joined_at: now_millis(),
        }
    }

    pub fn transport_id(&self, direction: TransportDirection) -> Option<&str> {
        match direction {
            TransportDirection::Send => self.send_transport_id.as_deref(),
            TransportDirection::Recv => self.recv_transport_id.as_deref(),
        }
    }

    pub fn set_transport(&mut self, direction: TransportDirection, transport_id: String) {
        match direction {
            TransportDirection::Send => self.send_transport_id = Some(transport_id),
            TransportDirection::Recv => self.recv_transport_id = Some(transport_id),
        }
    }

    /// Stores the producer in its role slot and raises the matching toggle
    pub fn record_producer(&mut self, role: MediaRole, producer_id: String) {
        self.producers.set(role, producer_id);
        match role {
            MediaRole::Audio => {}
            MediaRole::Video => self.state.video_enabled = true,
            MediaRole::Screen => self.state.screen_sharing = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_format() {
        let mut record = ParticipantRecord::new("u1", "c1");
        record.joined_at = 1_700_000_000_000;
        record.set_transport(TransportDirection::Send, "t1".into());
        record.record_producer(MediaRole::Audio, "p1".into());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "userId": "u1",
                "connectionId": "c1",
                "sendTransportId": "t1",
                "producers": { "audio": "p1" },
                "state": { "muted": false, "deafened": false, "videoEnabled": false, "screenSharing": false },
                "joinedAt": 1_700_000_000_000_i64,
            })
        );
        let back: ParticipantRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn producer_roles_raise_toggles() {
        let mut record = ParticipantRecord::new("u1", "c1");
        record.record_producer(MediaRole::Video, "v".into());
        assert!(record.state.video_enabled);
        assert!(!record.state.screen_sharing);

        record.record_producer(MediaRole::Screen, "s".into());
        assert!(record.state.screen_sharing);
        assert_eq!(
            record.producers.iter().collect::<Vec<_>>(),
            vec![(MediaRole::Video, "v"), (MediaRole::Screen, "s")]
        );
    }

    #[test]
    fn patch_leaves_absent_fields_unchanged() {
        let mut state = ToggleState {
            deafened: true,
            video_enabled: true,
            ..ToggleState::default()
        };
        let patch: StatePatch = serde_json::from_str(r#"{"muted": true}"#).unwrap();
        patch.apply(&mut state);
        assert_eq!(
            state,
            ToggleState {
                muted: true,
                deafened: true,
                video_enabled: true,
                screen_sharing: false,
            }
        );
    }
}
