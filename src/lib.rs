//! msgpipe - message pipeline between a playback source and UI panels
//!
//! A player emits `PlayerState` frames; the pipeline checks message
//! ordering, commits each frame to an observable store, paces the player
//! to the panels' frame rate, and aggregates what the panels subscribe to.

// Core engine (aggregation, pacing, ordering, store, lifecycle)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod synthetic;

// Re-export commonly used types
pub use config::{PipelineConfig, RenderAck};
pub use crate::core::event_bus::{BoxedEvent, EventBus, EventEmitter, downcast_event};
pub use crate::core::panel::Panel;
pub use crate::core::pipeline::Pipeline;
pub use crate::core::player::{FrameAck, Player, PlayerListener};
pub use error::{PipelineError, Result};

pub use entities::{PlayerState, SubscribePayload, Time};
