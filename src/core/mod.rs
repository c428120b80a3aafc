//! Core engine modules - subscriptions, pacing, ordering, store, lifecycle
//!
//! Independent of any UI: hosts drive the pipeline through `Pipeline` and
//! `Panel`, players plug in through the `Player` trait.

pub mod debounce;
pub mod event_bus;
pub mod frame_pacer;
pub mod order_tracker;
pub mod panel;
pub mod pipeline;
pub mod pipeline_events;
pub mod player;
pub mod store;
pub mod subscriptions;
pub mod workers;

// Re-exports for convenience
pub use debounce::Debouncer;
pub use event_bus::EventBus;
pub use frame_pacer::{FrameBudget, FramePacer, FramePromise, PacerPhase};
pub use order_tracker::OrderTracker;
pub use panel::Panel;
pub use pipeline::Pipeline;
pub use player::{FrameAck, Player, PlayerListener, resolved_ack};
pub use store::{StateStore, StoreSubscription};
pub use subscriptions::{SubscriptionMemo, merge_subscriptions, same_subscriptions};
pub use workers::Workers;
