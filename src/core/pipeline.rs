//! Lifecycle manager: wires one player to the store, pacer and panels.
//!
//! ```text
//! Player thread                 Host thread                Worker pool
//! -------------                 -----------                -----------
//! listener(state) --> on_frame
//!   order tracker, commit
//!   panels notified (sync)
//!   ack <---------------------------------------------- await_frame
//!                               tick(): debounce, drift
//!                               render_committed()
//! ```
//!
//! Each `attach()` builds a fresh [`AttachmentContext`] under a new epoch and
//! a fresh store. The listener handed to the player captures only that
//! context, so a replaced player can never write into the new store: its
//! pacer is cancelled, its queued worker jobs are stale, and late listener
//! calls return an already-resolved ack.

use crossbeam_channel::bounded;
use indexmap::IndexMap;
use log::{debug, info, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{PipelineConfig, RenderAck};
use crate::core::debounce::Debouncer;
use crate::core::event_bus::EventBus;
use crate::core::frame_pacer::{FrameBudget, FramePacer, FramePromise, PacerPhase};
use crate::core::order_tracker::OrderTracker;
use crate::core::panel::Panel;
use crate::core::pipeline_events::{PlayerAttachedEvent, PlayerDetachedEvent, StoreResetEvent, SubscriptionsPushedEvent};
use crate::core::player::{FrameAck, Player, resolved_ack};
use crate::core::store::{StateStore, StoreSubscription};
use crate::core::subscriptions::{SubscriptionMemo, same_subscriptions};
use crate::core::workers::Workers;
use crate::entities::{GlobalVariables, PlayerState, SubscribePayload, Time};
use crate::error::{PipelineError, Result};

/// Re-creates a panel watch against a given store.
pub(crate) type Binder = Arc<dyn Fn(&StateStore<PlayerState>) -> StoreSubscription + Send + Sync>;

/// Durable panel watch; survives store resets by rebinding.
pub(crate) struct Watch {
    pub(crate) panel: Uuid,
    pub(crate) bind: Binder,
    pub(crate) active: Option<StoreSubscription>,
}

/// Everything the listener of one player attachment needs.
pub(crate) struct AttachmentContext {
    epoch: u64,
    store: Arc<StateStore<PlayerState>>,
    tracker: Mutex<OrderTracker>,
    pub(crate) pacer: Arc<FramePacer>,
    render_ack: RenderAck,
    /// Weak so the pool is never dropped (and joined) from one of its own workers
    workers: Weak<Workers>,
}

impl AttachmentContext {
    fn on_frame(&self, mut state: PlayerState) -> FrameAck {
        if self.pacer.is_closed() {
            trace!("Ignoring frame for closed attachment (epoch {})", self.epoch);
            return resolved_ack();
        }

        let dispatched_at = self.pacer.begin_frame();
        let alerts = self
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_at(&state, dispatched_at);
        state.alerts.extend(alerts);

        if self.pacer.is_closed() {
            return resolved_ack();
        }
        self.store.commit(Arc::new(state));

        self.pacer.await_render();
        if self.render_ack == RenderAck::Immediate {
            self.pacer.render_committed();
        }

        let (done_tx, done_rx) = bounded(1);
        match self.workers.upgrade() {
            Some(workers) => {
                let pacer = Arc::clone(&self.pacer);
                workers.execute_with_epoch(self.epoch, move || pacer.await_frame(dispatched_at, done_tx));
            }
            None => {
                let _ = done_tx.send(Err(PipelineError::Closed));
            }
        }
        done_rx
    }

    fn poll_drift(&self, now: Instant) {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner()).poll(now);
    }
}

pub(crate) struct Shared {
    config: PipelineConfig,
    budget: FrameBudget,
    epoch: Arc<AtomicU64>,
    workers: Arc<Workers>,
    bus: EventBus,
    store: RwLock<Arc<StateStore<PlayerState>>>,
    player: Mutex<Option<Box<dyn Player>>>,
    attachment: Mutex<Option<Arc<AttachmentContext>>>,
    registry: Mutex<IndexMap<Uuid, Vec<SubscribePayload>>>,
    memo: Mutex<SubscriptionMemo>,
    /// Last merged set sent to the current player
    pushed: Mutex<Vec<Arc<SubscribePayload>>>,
    debouncer: Mutex<Debouncer>,
    globals: Mutex<Option<Arc<GlobalVariables>>>,
    watches: Mutex<IndexMap<u64, Watch>>,
    next_watch: AtomicU64,
}

impl Shared {
    pub(crate) fn store(&self) -> Arc<StateStore<PlayerState>> {
        Arc::clone(&self.store.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn context(&self) -> Option<Arc<AttachmentContext>> {
        self.attachment.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace one panel's entry in the registry and schedule a push.
    pub(crate) fn set_panel_subscriptions(&self, panel: Uuid, subscriptions: Vec<SubscribePayload>) {
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if subscriptions.is_empty() {
                if registry.shift_remove(&panel).is_none() {
                    return;
                }
            } else {
                registry.insert(panel, subscriptions);
            }
        }
        self.debouncer.lock().unwrap_or_else(|e| e.into_inner()).schedule();
    }

    pub(crate) fn add_panel_subscription(&self, panel: Uuid, subscription: SubscribePayload) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(panel)
            .or_default()
            .push(subscription);
        self.debouncer.lock().unwrap_or_else(|e| e.into_inner()).schedule();
    }

    pub(crate) fn panel_subscriptions(&self, panel: Uuid) -> Vec<SubscribePayload> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&panel)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a durable watch and bind it to the current store.
    pub(crate) fn add_watch(&self, panel: Uuid, bind: Binder) -> u64 {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        self.watches.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Watch {
                panel,
                bind: Arc::clone(&bind),
                active: None,
            },
        );
        // Bound outside the lock: the first notification runs user code.
        let subscription = bind(&self.store());
        if let Some(watch) = self.watches.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&id) {
            watch.active = Some(subscription);
        }
        id
    }

    pub(crate) fn remove_watch(&self, id: u64) -> bool {
        let removed = self.watches.lock().unwrap_or_else(|e| e.into_inner()).shift_remove(&id);
        removed.is_some()
    }

    /// Drop everything a panel left behind.
    pub(crate) fn release_panel(&self, panel: Uuid) {
        let removed: Vec<Watch> = {
            let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<u64> = watches.iter().filter(|(_, w)| w.panel == panel).map(|(id, _)| *id).collect();
            ids.into_iter().filter_map(|id| watches.shift_remove(&id)).collect()
        };
        if !removed.is_empty() {
            trace!("Released {} watch(es) of panel {}", removed.len(), panel);
        }
        self.set_panel_subscriptions(panel, Vec::new());
    }

    pub(crate) fn register_frame_promise(&self, promise: FramePromise) {
        match self.context() {
            Some(ctx) => ctx.pacer.register(promise),
            None => trace!("Discarding frame promise '{}' (no player)", promise.name),
        }
    }

    fn merged_subscriptions(&self) -> Vec<Arc<SubscribePayload>> {
        let all: Vec<SubscribePayload> = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .cloned()
            .collect();
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).merge(&all)
    }

    /// Merge the registry as it is now and push it if it changed.
    fn push_subscriptions(&self) {
        let merged = self.merged_subscriptions();
        let mut pushed = self.pushed.lock().unwrap_or_else(|e| e.into_inner());
        if same_subscriptions(&pushed, &merged) {
            trace!("Merged subscriptions unchanged, skipping push");
            return;
        }
        let mut player = self.player.lock().unwrap_or_else(|e| e.into_inner());
        let Some(player) = player.as_mut() else {
            trace!("No player, holding {} subscription(s) for next attach", merged.len());
            return;
        };
        let count = merged.len();
        player.set_subscriptions(merged.clone());
        *pushed = merged;
        debug!("Pushed {} merged subscription(s)", count);
        self.bus.emit(SubscriptionsPushedEvent { count });
    }

    /// Swap in a fresh default store and rebind every durable watch to it.
    fn replace_store(&self, epoch: u64) -> Arc<StateStore<PlayerState>> {
        let store = Arc::new(StateStore::new(PlayerState::absent()));
        let old = std::mem::replace(&mut *self.store.write().unwrap_or_else(|e| e.into_inner()), Arc::clone(&store));
        drop(old);

        let binders: Vec<(u64, Binder)> = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, w)| (*id, Arc::clone(&w.bind)))
            .collect();
        for (id, bind) in binders {
            let subscription = bind(&store);
            let previous = match self.watches.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&id) {
                Some(watch) => watch.active.replace(subscription),
                // Removed while rebinding; the new subscription drops with it.
                None => Some(subscription),
            };
            drop(previous);
        }

        debug!("State store reset (epoch {})", epoch);
        self.bus.emit(StoreResetEvent { epoch });
        store
    }

    /// Close the current attachment. Returns false if nothing was attached.
    fn teardown(&self, reset_store: bool) -> bool {
        let ctx = self.attachment.lock().unwrap_or_else(|e| e.into_inner()).take();
        let player = self.player.lock().unwrap_or_else(|e| e.into_inner()).take();
        if ctx.is_none() && player.is_none() {
            return false;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(ctx) = &ctx {
            ctx.pacer.cancel();
        }
        self.debouncer.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        if let Some(mut player) = player {
            player.close();
        }
        self.pushed.lock().unwrap_or_else(|e| e.into_inner()).clear();

        let detached = ctx.map(|c| c.epoch).unwrap_or(epoch);
        info!("Player detached (epoch {})", detached);
        self.bus.emit(PlayerDetachedEvent { epoch: detached });

        if reset_store {
            self.replace_store(epoch);
        }
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.teardown(false);
    }
}

/// Handle to a message pipeline. Cheap to clone; clones share one pipeline.
///
/// The player and background workers are shut down when the last handle drops.
/// [`Panel`]s hold only a weak reference and go inert after that.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let budget = FrameBudget::from_rate(config.frame_rate)?;
        let epoch = Arc::new(AtomicU64::new(0));
        let workers = Arc::new(Workers::new(config.worker_threads, Arc::clone(&epoch)));
        debug!(
            "Pipeline created: {} fps, {}ms promise ceiling, {} worker(s)",
            config.frame_rate,
            config.promise_timeout_ms,
            workers.threads()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                budget,
                epoch,
                workers,
                bus: EventBus::new(),
                store: RwLock::new(Arc::new(StateStore::new(PlayerState::absent()))),
                player: Mutex::new(None),
                attachment: Mutex::new(None),
                registry: Mutex::new(IndexMap::new()),
                memo: Mutex::new(SubscriptionMemo::new()),
                pushed: Mutex::new(Vec::new()),
                debouncer: Mutex::new(Debouncer::new(config.subscription_debounce_ms)),
                globals: Mutex::new(None),
                watches: Mutex::new(IndexMap::new()),
                next_watch: AtomicU64::new(0),
                config,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Replace the current player (if any) with `player`.
    ///
    /// The store is recreated, and the current merged subscriptions and
    /// global variables are pushed to the new player right away.
    pub fn attach(&self, mut player: Box<dyn Player>) {
        let shared = &self.shared;
        shared.teardown(false);

        let epoch = shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let store = shared.replace_store(epoch);
        let config = &shared.config;
        let ctx = Arc::new(AttachmentContext {
            epoch,
            store,
            tracker: Mutex::new(OrderTracker::new(
                config.track_message_order,
                config.drift_threshold_secs,
                Duration::from_millis(config.drift_grace_ms),
            )),
            pacer: Arc::new(FramePacer::new(
                shared.budget.clone(),
                Duration::from_millis(config.promise_timeout_ms),
                shared.bus.emitter(),
            )),
            render_ack: config.render_ack,
            workers: Arc::downgrade(&shared.workers),
        });
        *shared.attachment.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&ctx));

        player.set_listener(Arc::new(move |state: PlayerState| ctx.on_frame(state)));

        // The initial push covers anything the debounce was waiting on.
        shared.debouncer.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        let merged = shared.merged_subscriptions();
        let count = merged.len();
        player.set_subscriptions(merged.clone());
        *shared.pushed.lock().unwrap_or_else(|e| e.into_inner()) = merged;
        if let Some(globals) = shared.globals.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            player.set_global_variables(globals);
        }

        *shared.player.lock().unwrap_or_else(|e| e.into_inner()) = Some(player);
        info!("Player attached (epoch {}, {} subscription(s))", epoch, count);
        shared.bus.emit(SubscriptionsPushedEvent { count });
        shared.bus.emit(PlayerAttachedEvent { epoch });
    }

    /// Close the current player and reset the store. No-op without a player.
    pub fn detach(&self) {
        if !self.shared.teardown(true) {
            trace!("detach() without an attached player");
        }
    }

    pub fn has_player(&self) -> bool {
        self.shared.player.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Drive time-based work: debounced subscription push and drift alerts.
    ///
    /// Call from the host loop, at least as often as the debounce delay.
    pub fn tick(&self) {
        let fire = self.shared.debouncer.lock().unwrap_or_else(|e| e.into_inner()).tick();
        if fire {
            self.shared.push_subscriptions();
        }
        if let Some(ctx) = self.shared.context() {
            ctx.poll_drift(Instant::now());
        }
    }

    /// Host signal that panels finished rendering the current frame.
    ///
    /// Only needed with `RenderAck::Explicit`; ignored when no frame waits for it.
    pub fn render_committed(&self) {
        if let Some(ctx) = self.shared.context() {
            ctx.pacer.render_committed();
        }
    }

    /// Forward global variables to the player unless nothing changed.
    pub fn set_global_variables(&self, variables: Arc<GlobalVariables>) {
        {
            let mut globals = self.shared.globals.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = globals.as_ref() {
                if Arc::ptr_eq(current, &variables) || **current == *variables {
                    trace!("Global variables unchanged, skipping push");
                    return;
                }
            }
            *globals = Some(Arc::clone(&variables));
        }
        if let Some(player) = self.shared.player.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            debug!("Pushing {} global variable(s)", variables.len());
            player.set_global_variables(variables);
        }
    }

    pub fn global_variables(&self) -> Option<Arc<GlobalVariables>> {
        self.shared.globals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Change the frame budget; applies from the next frame on.
    pub fn set_frame_rate(&self, frames_per_second: f64) -> Result<()> {
        self.shared.budget.set_rate(frames_per_second)?;
        debug!("Frame budget now {:?}", self.shared.budget.get());
        Ok(())
    }

    pub fn frame_budget(&self) -> Duration {
        self.shared.budget.get()
    }

    pub fn start_playback(&self) -> Result<()> {
        self.with_player(|p| p.start_playback())
    }

    pub fn pause_playback(&self) -> Result<()> {
        self.with_player(|p| p.pause_playback())
    }

    pub fn seek_playback(&self, time: Time) -> Result<()> {
        self.with_player(|p| p.seek_playback(time))
    }

    pub fn set_playback_speed(&self, speed: f64) -> Result<()> {
        self.with_player(|p| p.set_playback_speed(speed))
    }

    fn with_player(&self, f: impl FnOnce(&mut dyn Player)) -> Result<()> {
        let mut player = self.shared.player.lock().unwrap_or_else(|e| e.into_inner());
        let player = player.as_mut().ok_or(PipelineError::NoPlayer)?;
        f(&mut **player);
        Ok(())
    }

    /// Latest committed state.
    pub fn current_state(&self) -> Arc<PlayerState> {
        self.shared.store().get()
    }

    /// The live store. Replaced on every attach/detach; prefer [`Panel::watch`].
    pub fn store(&self) -> Arc<StateStore<PlayerState>> {
        self.shared.store()
    }

    /// Merged subscriptions last pushed to the current player.
    pub fn subscriptions(&self) -> Vec<Arc<SubscribePayload>> {
        self.shared.pushed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Pacer phase of the current attachment.
    pub fn pacer_phase(&self) -> Option<PacerPhase> {
        self.shared.context().map(|ctx| ctx.pacer.phase())
    }

    /// New consumer handle.
    pub fn panel(&self, name: impl Into<String>) -> Panel {
        Panel::new(name.into(), Arc::downgrade(&self.shared))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("epoch", &self.shared.epoch.load(Ordering::Relaxed))
            .field("has_player", &self.has_player())
            .field("pacer_phase", &self.pacer_phase())
            .finish()
    }
}
