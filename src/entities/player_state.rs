//! Player state snapshot delivered on every frame.
//!
//! A `PlayerState` is built by the player for each listener call, then
//! committed to the store as `Arc<PlayerState>` and never mutated again.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::time::Time;

/// Variables shared by every panel and forwarded to the player.
pub type GlobalVariables = BTreeMap<String, serde_json::Value>;

/// Connection/loading status of the player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerPresence {
    #[default]
    NotPresent,
    Initializing,
    Buffering,
    Present,
    Reconnecting,
    Error,
}

/// Optional features a player may support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerCapability {
    SetSpeed,
    PlaybackControl,
    Publish,
    Advertise,
    CallServices,
    Assets,
}

/// Half-open range expressed as fractions of the source duration (0.0..=1.0).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub start: f64,
    pub end: f64,
}

/// Loading progress reported by the player. Passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fully_loaded_fraction_ranges: Vec<Range>,
    pub memory_info: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub schema_name: Option<String>,
}

/// A single message delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub topic: String,
    pub receive_time: Time,
    pub payload: Bytes,
    pub schema_name: String,
    pub size_in_bytes: usize,
}

impl MessageEvent {
    pub fn new(topic: impl Into<String>, receive_time: Time, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            topic: topic.into(),
            receive_time,
            size_in_bytes: payload.len(),
            payload,
            schema_name: String::new(),
        }
    }
}

/// Data present once the player has a source loaded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActiveData {
    /// Messages emitted in this frame, in receive order.
    pub messages: Vec<MessageEvent>,
    pub current_time: Time,
    pub start_time: Time,
    pub end_time: Time,
    /// Opaque seek token; any change means a discontinuity.
    pub last_seek_time: u64,
    pub is_playing: bool,
    pub speed: f64,
    pub topics: Vec<Topic>,
    pub total_bytes_received: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warn,
    Error,
}

/// Non-fatal problem surfaced to panels through `PlayerState::alerts`.
#[derive(Clone, Debug)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub cause: Option<Arc<anyhow::Error>>,
    pub tip: Option<String>,
}

impl Alert {
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warn,
            message: message.into(),
            cause: None,
            tip: None,
        }
    }

    pub fn error(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            severity: AlertSeverity::Error,
            message: message.into(),
            cause: Some(Arc::new(cause)),
            tip: None,
        }
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

// Causes compare by rendered message; anyhow::Error has no PartialEq.
impl PartialEq for Alert {
    fn eq(&self, other: &Self) -> bool {
        self.severity == other.severity
            && self.message == other.message
            && self.tip == other.tip
            && self.cause.as_ref().map(|c| c.to_string()) == other.cause.as_ref().map(|c| c.to_string())
    }
}

/// Complete snapshot of the player for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlayerState {
    pub player_id: String,
    pub name: Option<String>,
    pub presence: PlayerPresence,
    pub capabilities: Vec<PlayerCapability>,
    pub profile: Option<String>,
    pub progress: Progress,
    pub active_data: Option<ActiveData>,
    pub alerts: Vec<Alert>,
}

impl PlayerState {
    /// State used while no player is attached.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn has_capability(&self, capability: PlayerCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn current_time(&self) -> Option<Time> {
        self.active_data.as_ref().map(|d| d.current_time)
    }

    pub fn messages(&self) -> &[MessageEvent] {
        self.active_data.as_ref().map(|d| d.messages.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_state() {
        let state = PlayerState::absent();
        assert_eq!(state.presence, PlayerPresence::NotPresent);
        assert!(state.active_data.is_none());
        assert!(state.messages().is_empty());
        assert!(state.current_time().is_none());
    }

    #[test]
    fn test_message_size_from_payload() {
        let msg = MessageEvent::new("/pose", Time::new(1, 0), vec![1u8, 2, 3]);
        assert_eq!(msg.size_in_bytes, 3);
    }

    #[test]
    fn test_alert_eq_compares_cause_text() {
        let a = Alert::error("boom", anyhow::anyhow!("disk full"));
        let b = Alert::error("boom", anyhow::anyhow!("disk full"));
        let c = Alert::error("boom", anyhow::anyhow!("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
