//! Frame pacing (backpressure between the player and the panels).
//!
//! One frame at a time moves through:
//!
//! ```text
//! Idle -> Dispatching -> AwaitingRender -> AwaitingPromises -> Idle
//! ```
//!
//! - **Dispatching**: the listener validates, commits and notifies panels
//!   on the player's thread. Panels may register frame promises.
//! - **AwaitingRender**: a worker waits for the render-committed signal,
//!   bounded by the ceiling. A signal sent while panels are still being
//!   notified (Dispatching) counts for the current frame.
//! - **AwaitingPromises**: the worker sleeps out the rest of the frame budget
//!   (`1000 / fps` ms since dispatch), then waits for all collected promises,
//!   bounded as a set by the ceiling (5000 ms by default).
//!
//! Then the player's ack resolves. A ceiling timeout is only logged; a failed
//! promise produces one notification on the bus. Either way the pipeline
//! moves on.

use crossbeam_channel::{Receiver, Sender, after, bounded, select};
use log::{error, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core::event_bus::EventEmitter;
use crate::core::pipeline_events::FramePromiseFailedEvent;
use crate::error::{PipelineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacerPhase {
    Idle,
    Dispatching,
    AwaitingRender,
    AwaitingPromises,
}

/// A panel's request to hold the current frame open until `done` resolves.
///
/// A dropped sender counts as success.
#[derive(Debug)]
pub struct FramePromise {
    pub name: String,
    pub done: Receiver<anyhow::Result<()>>,
}

/// Shared, adjustable frame budget (stored as microseconds).
#[derive(Clone, Debug)]
pub struct FrameBudget(Arc<AtomicU64>);

impl FrameBudget {
    pub fn from_rate(frames_per_second: f64) -> Result<Self> {
        let budget = Self(Arc::new(AtomicU64::new(0)));
        budget.set_rate(frames_per_second)?;
        Ok(budget)
    }

    pub fn set_rate(&self, frames_per_second: f64) -> Result<()> {
        if !frames_per_second.is_finite() || frames_per_second <= 0.0 {
            return Err(PipelineError::InvalidFrameRate(frames_per_second));
        }
        let micros = (1_000_000.0 / frames_per_second).round() as u64;
        self.0.store(micros, Ordering::Release);
        Ok(())
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Acquire))
    }
}

/// Result of waiting on a frame's promises.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Resolved,
    TimedOut { pending: Vec<String> },
    Failed { name: String, message: String },
    Cancelled,
}

/// Wait for every promise, bounded as a whole by `ceiling`.
///
/// Stops at the first failure, like `Promise.all`.
pub fn wait_all(promises: &[FramePromise], ceiling: Duration, cancel: &Receiver<()>) -> WaitOutcome {
    if promises.is_empty() {
        return WaitOutcome::Resolved;
    }
    let timeout = after(ceiling);
    for (idx, promise) in promises.iter().enumerate() {
        select! {
            recv(promise.done) -> result => {
                if let Ok(Err(err)) = result {
                    return WaitOutcome::Failed {
                        name: promise.name.clone(),
                        message: format!("{:#}", err),
                    };
                }
            }
            recv(timeout) -> _ => {
                // A dropped sender counts as resolved, so only live, empty channels are pending.
                let pending = promises[idx..]
                    .iter()
                    .filter(|p| p.done.is_empty() && matches!(p.done.try_recv(), Err(crossbeam_channel::TryRecvError::Empty)))
                    .map(|p| p.name.clone())
                    .collect();
                return WaitOutcome::TimedOut { pending };
            }
            recv(cancel) -> _ => return WaitOutcome::Cancelled,
        }
    }
    WaitOutcome::Resolved
}

/// Per-attachment pacing state machine.
pub struct FramePacer {
    phase: Mutex<PacerPhase>,
    promises: Mutex<Vec<FramePromise>>,
    budget: FrameBudget,
    ceiling: Duration,
    render_tx: Sender<()>,
    render_rx: Receiver<()>,
    /// Dropped on cancel; every wait selects on `cancel_rx`.
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    closed: AtomicBool,
    notifier: EventEmitter,
}

impl FramePacer {
    pub fn new(budget: FrameBudget, ceiling: Duration, notifier: EventEmitter) -> Self {
        let (render_tx, render_rx) = bounded(1);
        let (cancel_tx, cancel_rx) = bounded(0);
        Self {
            phase: Mutex::new(PacerPhase::Idle),
            promises: Mutex::new(Vec::new()),
            budget,
            ceiling,
            render_tx,
            render_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            closed: AtomicBool::new(false),
            notifier,
        }
    }

    pub fn phase(&self) -> PacerPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: PacerPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Idle -> Dispatching. Returns the dispatch instant.
    ///
    /// # Panics
    /// If the previous frame has not been acknowledged yet: the player broke
    /// the one-frame-in-flight contract.
    pub fn begin_frame(&self) -> Instant {
        let previous = {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            let previous = *phase;
            if previous == PacerPhase::Idle {
                *phase = PacerPhase::Dispatching;
            }
            previous
        };
        if previous != PacerPhase::Idle {
            panic!(
                "Player emitted a new state before the previous frame was acknowledged (pacer phase: {:?})",
                previous
            );
        }
        // A signal left over from a previous frame must not skip this one's render wait.
        while self.render_rx.try_recv().is_ok() {}
        Instant::now()
    }

    /// Dispatching -> AwaitingRender, once panels have been notified.
    pub fn await_render(&self) {
        self.set_phase(PacerPhase::AwaitingRender);
    }

    /// Render-committed signal for the frame in flight. Ignored while Idle.
    pub fn render_committed(&self) {
        match self.phase() {
            PacerPhase::Dispatching | PacerPhase::AwaitingRender => {
                let _ = self.render_tx.try_send(());
            }
            phase => trace!("Ignoring render-committed signal in {:?}", phase),
        }
    }

    /// Collect a promise for the frame currently being paced.
    pub fn register(&self, promise: FramePromise) {
        if self.is_closed() {
            trace!("Discarding frame promise '{}' (pacer closed)", promise.name);
            return;
        }
        self.promises.lock().unwrap_or_else(|e| e.into_inner()).push(promise);
    }

    pub fn pending_promises(&self) -> usize {
        self.promises.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Abort any wait in progress and turn later resolutions into no-ops.
    pub fn cancel(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let discarded = std::mem::take(&mut *self.promises.lock().unwrap_or_else(|e| e.into_inner()));
        if !discarded.is_empty() {
            trace!("Discarded {} outstanding frame promise(s)", discarded.len());
        }
    }

    /// Worker side of a frame: wait render, budget and promises, then ack.
    ///
    /// On cancellation `done` is dropped without a value.
    pub fn await_frame(&self, dispatched_at: Instant, done: Sender<Result<()>>) {
        select! {
            recv(self.render_rx) -> _ => {}
            recv(self.cancel_rx) -> _ => {
                trace!("Frame cancelled while awaiting render");
                return;
            }
            default(self.ceiling) => {
                warn!("Render not committed within {}ms, continuing", self.ceiling.as_millis());
            }
        }
        self.set_phase(PacerPhase::AwaitingPromises);

        let remaining = self.budget.get().saturating_sub(dispatched_at.elapsed());
        if !remaining.is_zero() {
            select! {
                recv(self.cancel_rx) -> _ => return,
                default(remaining) => {}
            }
        }

        let promises = std::mem::take(&mut *self.promises.lock().unwrap_or_else(|e| e.into_inner()));
        match wait_all(&promises, self.ceiling, &self.cancel_rx) {
            WaitOutcome::Resolved => {}
            WaitOutcome::TimedOut { pending } => {
                warn!(
                    "Frame promises not resolved within {}ms, continuing: {}",
                    self.ceiling.as_millis(),
                    pending.join(", ")
                );
            }
            WaitOutcome::Failed { name, message } => {
                error!("Frame promise '{}' failed: {}", name, message);
                self.notifier.emit(FramePromiseFailedEvent {
                    names: vec![name],
                    message,
                });
            }
            WaitOutcome::Cancelled => {
                trace!("Frame cancelled while awaiting promises");
                return;
            }
        }

        if self.is_closed() {
            return;
        }
        self.set_phase(PacerPhase::Idle);
        let _ = done.send(Ok(()));
    }
}

impl std::fmt::Debug for FramePacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePacer")
            .field("phase", &self.phase())
            .field("budget", &self.budget.get())
            .field("ceiling", &self.ceiling)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::{EventBus, downcast_event};
    use std::thread;

    fn pacer(bus: &EventBus, fps: f64, ceiling_ms: u64) -> Arc<FramePacer> {
        Arc::new(FramePacer::new(
            FrameBudget::from_rate(fps).unwrap(),
            Duration::from_millis(ceiling_ms),
            bus.emitter(),
        ))
    }

    fn run_frame(pacer: &Arc<FramePacer>) -> Receiver<Result<()>> {
        let dispatched_at = pacer.begin_frame();
        pacer.await_render();
        pacer.render_committed();
        let (tx, rx) = bounded(1);
        let p = Arc::clone(pacer);
        thread::spawn(move || p.await_frame(dispatched_at, tx));
        rx
    }

    #[test]
    fn test_budget_from_rate() {
        let budget = FrameBudget::from_rate(50.0).unwrap();
        assert_eq!(budget.get(), Duration::from_millis(20));
        assert!(FrameBudget::from_rate(0.0).is_err());
        assert!(budget.set_rate(f64::NAN).is_err());
    }

    #[test]
    fn test_frame_without_promises() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 100);
        let rx = run_frame(&pacer);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert_eq!(pacer.phase(), PacerPhase::Idle);
    }

    #[test]
    fn test_waits_out_frame_budget() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 20.0, 100); // 50ms budget
        let start = Instant::now();
        let rx = run_frame(&pacer);
        rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_waits_for_promise() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 1000);
        let (tx, done) = bounded(1);
        pacer.register(FramePromise { name: "plot".into(), done });

        let rx = run_frame(&pacer);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        tx.send(Ok(())).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert_eq!(pacer.pending_promises(), 0);
    }

    #[test]
    fn test_slow_promise_hits_ceiling_without_notification() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 50);
        let (tx, done) = bounded::<anyhow::Result<()>>(1);
        pacer.register(FramePromise { name: "slow".into(), done });

        // Longer than the ceiling
        let slow = thread::spawn(move || {
            thread::sleep(Duration::from_millis(120));
            let _ = tx.send(Ok(()));
        });

        let start = Instant::now();
        let rx = run_frame(&pacer);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert!(start.elapsed() < Duration::from_millis(110));
        assert!(bus.poll().is_empty());

        // The next frame is not blocked
        let rx = run_frame(&pacer);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        slow.join().unwrap();
    }

    #[test]
    fn test_failed_promise_notifies_once() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 500);
        for name in ["a", "b"] {
            let (tx, done) = bounded(1);
            tx.send(Err(anyhow::anyhow!("render of {} failed", name))).unwrap();
            pacer.register(FramePromise { name: name.into(), done });
        }

        let rx = run_frame(&pacer);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());

        let events = bus.poll();
        assert_eq!(events.len(), 1);
        let event = downcast_event::<FramePromiseFailedEvent>(&events[0]).unwrap();
        assert_eq!(event.names, vec!["a".to_string()]);
        assert!(event.message.contains("render of a failed"));
    }

    #[test]
    fn test_dropped_promise_counts_as_resolved() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 500);
        let (tx, done) = bounded::<anyhow::Result<()>>(1);
        pacer.register(FramePromise { name: "gone".into(), done });
        drop(tx);
        let rx = run_frame(&pacer);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_explicit_render_ack() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 1000);
        // Signal with no frame in flight is ignored
        pacer.render_committed();
        let dispatched_at = pacer.begin_frame();
        pacer.await_render();

        let (tx, rx) = bounded(1);
        let p = Arc::clone(&pacer);
        thread::spawn(move || p.await_frame(dispatched_at, tx));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pacer.render_committed();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
    }

    #[test]
    fn test_render_signal_during_dispatch_counts() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 5000);
        let dispatched_at = pacer.begin_frame();
        // Panel reacting synchronously to the commit
        pacer.render_committed();
        pacer.await_render();

        let (tx, rx) = bounded(1);
        let p = Arc::clone(&pacer);
        thread::spawn(move || p.await_frame(dispatched_at, tx));
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
    }

    #[test]
    fn test_render_wait_bounded_by_ceiling() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 50);
        let start = Instant::now();
        let dispatched_at = pacer.begin_frame();
        pacer.await_render();

        let (tx, rx) = bounded(1);
        let p = Arc::clone(&pacer);
        thread::spawn(move || p.await_frame(dispatched_at, tx));
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(pacer.phase(), PacerPhase::Idle);
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_timeout_pending_excludes_dropped_promises() {
        let (_slow_tx, slow) = bounded::<anyhow::Result<()>>(1);
        let (gone_tx, gone) = bounded::<anyhow::Result<()>>(1);
        drop(gone_tx);
        let promises = vec![
            FramePromise { name: "slow".into(), done: slow },
            FramePromise { name: "gone".into(), done: gone },
        ];
        let (_cancel_tx, cancel) = bounded::<()>(0);
        assert_eq!(
            wait_all(&promises, Duration::from_millis(20), &cancel),
            WaitOutcome::TimedOut { pending: vec!["slow".to_string()] }
        );
    }

    #[test]
    fn test_cancel_drops_ack() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 1000.0, 5000);
        let (_keep, done) = bounded::<anyhow::Result<()>>(1);
        pacer.register(FramePromise { name: "stuck".into(), done });

        let rx = run_frame(&pacer);
        thread::sleep(Duration::from_millis(20));
        pacer.cancel();
        // Sender dropped without a value
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
        assert!(pacer.is_closed());
        assert!(bus.poll().is_empty());
    }

    #[test]
    #[should_panic(expected = "before the previous frame was acknowledged")]
    fn test_reentrant_frame_panics() {
        let bus = EventBus::new();
        let pacer = pacer(&bus, 60.0, 100);
        pacer.begin_frame();
        pacer.begin_frame();
    }

    #[test]
    fn test_wait_all_empty() {
        let (_tx, cancel) = bounded::<()>(0);
        assert_eq!(wait_all(&[], Duration::from_millis(1), &cancel), WaitOutcome::Resolved);
    }
}
