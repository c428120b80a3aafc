//! Events published on the pipeline's notification bus.

/// One or more frame promises resolved with an error during a frame.
///
/// Emitted at most once per frame. Timeouts are not reported here; they are
/// only logged.
#[derive(Clone, Debug)]
pub struct FramePromiseFailedEvent {
    /// Names of the failed promises
    pub names: Vec<String>,
    pub message: String,
}

/// A player was attached (a fresh store is now live).
#[derive(Clone, Debug)]
pub struct PlayerAttachedEvent {
    pub epoch: u64,
}

/// The player was detached and closed.
#[derive(Clone, Debug)]
pub struct PlayerDetachedEvent {
    pub epoch: u64,
}

/// The state store was replaced; every selector sees the new default state.
#[derive(Clone, Debug)]
pub struct StoreResetEvent {
    pub epoch: u64,
}

/// Merged subscriptions were pushed to the player.
#[derive(Clone, Debug)]
pub struct SubscriptionsPushedEvent {
    pub count: usize,
}
