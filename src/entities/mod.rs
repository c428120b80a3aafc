//! Entities - plain data exchanged between players, the pipeline and panels

pub mod player_state;
pub mod subscription;
pub mod time;

pub use player_state::{
    ActiveData, Alert, AlertSeverity, GlobalVariables, MessageEvent, PlayerCapability, PlayerPresence, PlayerState,
    Progress, Range, Topic,
};
pub use subscription::{PreloadType, SubscribePayload};
pub use time::Time;
