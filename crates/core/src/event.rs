//! Action events exchanged between room members

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// "This player just used this action"
///
/// Serialized with the wire field names (`skill_id`, `player`, `timestamp`);
/// the timestamp is unix seconds as a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    #[serde(rename = "skill_id")]
    pub action_id: String,
    #[serde(rename = "player")]
    pub player_name: String,
    #[serde(default)]
    pub timestamp: f64,
}

impl ActionEvent {
    /// Create an event stamped with the current time
    pub fn new(action_id: impl Into<String>, player_name: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            player_name: player_name.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    /// When the originator sent the event
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        if !self.timestamp.is_finite() {
            return None;
        }
        Utc.timestamp_millis_opt((self.timestamp * 1000.0) as i64).single()
    }
}
