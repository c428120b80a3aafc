//! Consumer handle: one per panel (plot, 3D view, table...).
//!
//! A panel declares what it needs (subscriptions), reads what it gets
//! (selectors over the committed `PlayerState`), and can hold a frame open
//! while it finishes async work (frame promises).
//!
//! Panels hold a weak reference to the pipeline. Once every `Pipeline`
//! handle is gone, reads return the default state and writes are dropped.

use crossbeam_channel::Receiver;
use log::trace;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

use crate::core::frame_pacer::FramePromise;
use crate::core::pipeline::{Binder, Shared};
use crate::core::store::StateStore;
use crate::entities::{PlayerState, SubscribePayload};
use crate::error::{PipelineError, Result};

pub struct Panel {
    id: Uuid,
    name: String,
    shared: Weak<Shared>,
}

impl Panel {
    pub(crate) fn new(name: String, shared: Weak<Shared>) -> Self {
        let id = Uuid::new_v4();
        trace!("Panel '{}' created ({})", name, id);
        Self { id, name, shared }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply `selector` to the latest committed state.
    pub fn select<R>(&self, selector: impl FnOnce(&PlayerState) -> R) -> R {
        match self.shared.upgrade() {
            Some(shared) => shared.store().select(selector),
            None => selector(&PlayerState::absent()),
        }
    }

    /// Call `on_change` now and whenever `selector(state)` changes.
    ///
    /// The watch follows the pipeline across store resets: after a player
    /// swap it is re-evaluated on the new (default) state and fires only if
    /// the selection differs from the last one delivered.
    pub fn watch<R, S, F>(&self, selector: S, on_change: F) -> Result<u64>
    where
        R: PartialEq + Clone + Send + 'static,
        S: Fn(&PlayerState) -> R + Send + Sync + 'static,
        F: Fn(&R) + Send + Sync + 'static,
    {
        let shared = self.shared.upgrade().ok_or(PipelineError::Closed)?;
        let selector = Arc::new(selector);
        let on_change = Arc::new(on_change);
        let delivered: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));

        let bind: Binder = Arc::new(move |store: &StateStore<PlayerState>| {
            let selector = Arc::clone(&selector);
            let on_change = Arc::clone(&on_change);
            let delivered = Arc::clone(&delivered);
            store.subscribe_immediate(
                move |state: &PlayerState| selector(state),
                move |value: &R| {
                    {
                        let mut last = delivered.lock().unwrap_or_else(|e| e.into_inner());
                        if last.as_ref() == Some(value) {
                            return;
                        }
                        *last = Some(value.clone());
                    }
                    on_change(value);
                },
            )
        });
        Ok(shared.add_watch(self.id, bind))
    }

    /// Remove a watch created by [`watch`](Self::watch).
    pub fn unwatch(&self, watch_id: u64) -> bool {
        self.shared.upgrade().is_some_and(|shared| shared.remove_watch(watch_id))
    }

    /// Add one subscription to this panel's set.
    pub fn register_subscription(&self, subscription: SubscribePayload) {
        if let Some(shared) = self.shared.upgrade() {
            shared.add_panel_subscription(self.id, subscription);
        }
    }

    /// Replace this panel's whole subscription set.
    pub fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_panel_subscriptions(self.id, subscriptions);
        }
    }

    pub fn clear_subscriptions(&self) {
        self.set_subscriptions(Vec::new());
    }

    pub fn subscriptions(&self) -> Vec<SubscribePayload> {
        self.shared
            .upgrade()
            .map(|shared| shared.panel_subscriptions(self.id))
            .unwrap_or_default()
    }

    /// Hold the current frame open until `done` yields.
    ///
    /// Call while handling a state change. `Ok` or a dropped sender lets the
    /// frame proceed; `Err` is reported once on the event bus. Discarded when
    /// no player is attached.
    pub fn register_frame_promise(&self, name: &str, done: Receiver<anyhow::Result<()>>) {
        let promise = FramePromise {
            name: format!("{}:{}", self.name, name),
            done,
        };
        match self.shared.upgrade() {
            Some(shared) => shared.register_frame_promise(promise),
            None => trace!("Discarding frame promise '{}' (pipeline dropped)", promise.name),
        }
    }
}

impl Drop for Panel {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_panel(self.id);
        }
        trace!("Panel '{}' dropped", self.name);
    }
}

impl std::fmt::Debug for Panel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Panel").field("id", &self.id).field("name", &self.name).finish()
    }
}
