//! Topic subscription requests sent from panels toward the player.

use serde::{Deserialize, Serialize};

/// How much history a subscriber needs.
///
/// `Full` asks the player to preload the whole topic (e.g. for plots);
/// `Partial` only needs messages around the playhead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadType {
    Full,
    #[default]
    Partial,
}

/// One subscription to a topic.
///
/// `fields: None` requests every field and wins over any explicit list.
/// `fields: Some(vec![])` requests nothing and is dropped by the aggregator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub preload_type: PreloadType,
}

impl SubscribePayload {
    /// All fields, partial preload.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            fields: None,
            preload_type: PreloadType::Partial,
        }
    }

    /// Selected fields, partial preload.
    pub fn with_fields<I, S>(topic: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic: topic.into(),
            fields: Some(fields.into_iter().map(Into::into).collect()),
            preload_type: PreloadType::Partial,
        }
    }

    pub fn preload(mut self, preload_type: PreloadType) -> Self {
        self.preload_type = preload_type;
        self
    }
}
