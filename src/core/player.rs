//! Contract between the pipeline and an upstream player.
//!
//! **Handshake**: the pipeline installs a [`PlayerListener`]; the player calls
//! it once per frame with a fresh [`PlayerState`] and must wait on the
//! returned [`FrameAck`] before calling it again. Calling early is a
//! protocol violation and panics.
//!
//! Everything else (subscriptions, global variables, playback control) flows
//! from the pipeline to the player through the trait methods.

use crossbeam_channel::{Receiver, bounded};
use std::sync::Arc;

use crate::entities::{GlobalVariables, PlayerState, SubscribePayload, Time};
use crate::error::PipelineError;

/// Resolves once the pipeline is ready for the next frame.
///
/// Disconnects without a value if the attachment is torn down mid-frame.
pub type FrameAck = Receiver<Result<(), PipelineError>>;

/// Per-frame entry point into the pipeline.
pub type PlayerListener = Arc<dyn Fn(PlayerState) -> FrameAck + Send + Sync>;

/// Ack that is already resolved.
pub fn resolved_ack() -> FrameAck {
    let (tx, rx) = bounded(1);
    let _ = tx.send(Ok(()));
    rx
}

/// Upstream data source.
///
/// Implementations typically run their own thread and hold the listener
/// there; the trait methods are called from the pipeline's host thread.
pub trait Player: Send {
    fn set_listener(&mut self, listener: PlayerListener);

    /// Minimal merged subscription set; equal payloads keep their `Arc`.
    fn set_subscriptions(&mut self, subscriptions: Vec<Arc<SubscribePayload>>);

    fn set_global_variables(&mut self, variables: Arc<GlobalVariables>);

    fn start_playback(&mut self) {}

    fn pause_playback(&mut self) {}

    fn seek_playback(&mut self, _time: Time) {}

    fn set_playback_speed(&mut self, _speed: f64) {}

    /// Stop emitting and release resources. The listener must not be called afterwards.
    fn close(&mut self);
}
