//! Background pool for frame waits.
//!
//! Frame pacing blocks (render ack, frame budget, promise ceiling), and that
//! blocking must not happen on the player's thread. Jobs run here instead.
//!
//! Epoch mechanism: every player attachment bumps the shared epoch. A job
//! queued under an older epoch is skipped when a worker picks it up, so a
//! swapped-out player can never be acknowledged by a late job.

use crossbeam_channel::{Sender, unbounded};
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool fed by one shared queue.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(2, epoch);
/// workers.execute_with_epoch(epoch_at_attach, move || pacer.await_frame(ticket));
/// ```
pub struct Workers {
    sender: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    current_epoch: Arc<AtomicU64>,
}

impl Workers {
    /// Spawn `num_threads` workers (at least one) sharing `epoch`.
    pub fn new(num_threads: usize, epoch: Arc<AtomicU64>) -> Self {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let handles = (0..num_threads)
            .map(|worker_id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("msgpipe-worker-{}", worker_id))
                    .spawn(move || {
                        trace!("Worker {} started", worker_id);
                        // Ends when the pool drops its sender.
                        for job in receiver.iter() {
                            job();
                        }
                        trace!("Worker {} stopped", worker_id);
                    })
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        trace!("Workers initialized: {} threads", num_threads);

        Self {
            sender: Some(sender),
            handles,
            current_epoch: epoch,
        }
    }

    /// Run `f` on a worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            // Only fails when every worker is gone, i.e. during drop.
            let _ = sender.send(Box::new(f));
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Run `f` only if the epoch still equals `epoch` when a worker starts it.
    pub fn execute_with_epoch<F>(&self, epoch: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current_epoch = Arc::clone(&self.current_epoch);
        self.execute(move || {
            if current_epoch.load(Ordering::Acquire) == epoch {
                f();
            } else {
                trace!("Skipping stale job (epoch {})", epoch);
            }
        });
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        // Closing the queue lets idle workers exit; busy ones finish their job first.
        self.sender = None;

        // Pending frame waits are cancelled before the pool drops, so this is short.
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, leaving remaining workers detached");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_execute_runs_job() {
        let workers = Workers::new(2, Arc::new(AtomicU64::new(0)));
        let (tx, rx) = bounded(1);
        workers.execute(move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn test_stale_epoch_skipped() {
        let epoch = Arc::new(AtomicU64::new(3));
        let workers = Workers::new(1, Arc::clone(&epoch));
        let (tx, rx) = bounded::<u64>(2);

        let stale = tx.clone();
        workers.execute_with_epoch(2, move || {
            stale.send(2).unwrap();
        });
        workers.execute_with_epoch(3, move || {
            tx.send(3).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
        // Both senders are gone once the jobs ran or were skipped
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_min_one_thread() {
        let workers = Workers::new(0, Arc::new(AtomicU64::new(0)));
        assert_eq!(workers.threads(), 1);
    }
}
