//! Disconnect Recovery Coordinator.
//!
//! The error callback must not restart the stream itself: it runs on a thread
//! the platform owns and the restart has to close that very stream. Instead it
//! schedules a restart on a worker thread owned here.
//!
//! At most one worker exists. Disconnects reported while it runs are folded
//! into one more pass once it finishes. [`RecoveryCoordinator::cancel`] stops
//! the current pass at its next check; [`RecoveryCoordinator::shutdown`] also
//! refuses new work and joins the worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::engine::config::RecoveryConfig;
use crate::engine::error::StreamError;

/// Result of one restart attempt.
#[derive(Debug)]
pub enum Attempt {
    /// The stream was restarted.
    Recovered,
    /// Nothing to do (playback no longer requested, or already running).
    Skipped,
    /// The restart failed; it may be retried.
    Failed(StreamError),
}

/// Cancellation flag that sleeping workers can be woken from.
///
/// Each cancel bumps an epoch; a pass is cancelled once the epoch moves past
/// the one it started with.
#[derive(Default)]
struct CancelToken {
    epoch: Mutex<u64>,
    changed: Condvar,
}

impl CancelToken {
    fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    fn cancel(&self) {
        *self.epoch.lock() += 1;
        self.changed.notify_all();
    }

    fn is_cancelled(&self, seen: u64) -> bool {
        *self.epoch.lock() != seen
    }

    /// Sleeps for `duration` unless cancelled first. Returns `true` if cancelled.
    fn sleep(&self, seen: u64, duration: Duration) -> bool {
        let mut epoch = self.epoch.lock();
        self.changed
            .wait_while_for(&mut epoch, |epoch| *epoch == seen, duration);
        *epoch != seen
    }
}

#[derive(Default)]
struct WorkerSlot {
    handle: Option<JoinHandle<()>>,
    running: bool,
    pending: bool,
    closed: bool,
}

struct Inner {
    config: RecoveryConfig,
    slot: Mutex<WorkerSlot>,
    cancel: CancelToken,
    recoveries: AtomicU32,
    exhausted: AtomicU32,
}

pub struct RecoveryCoordinator {
    inner: Arc<Inner>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slot: Mutex::new(WorkerSlot::default()),
                cancel: CancelToken::default(),
                recoveries: AtomicU32::new(0),
                exhausted: AtomicU32::new(0),
            }),
        }
    }

    /// Runs `attempt` on the recovery worker, retrying with backoff.
    ///
    /// Returns `true` if a new worker was spawned, `false` if the request was
    /// folded into a running worker or refused after shutdown.
    pub fn schedule<F>(&self, attempt: F) -> bool
    where
        F: FnMut() -> Attempt + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        if slot.closed {
            debug!("Recovery requested after shutdown, ignoring");
            return false;
        }
        if slot.running {
            debug!("Recovery already in flight, coalescing");
            slot.pending = true;
            return false;
        }
        if let Some(finished) = slot.handle.take() {
            let _ = finished.join();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("stream-recovery".to_string())
            .spawn(move || inner.run(attempt));
        match spawned {
            Ok(handle) => {
                slot.running = true;
                slot.handle = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn recovery worker: {}", e);
                false
            }
        }
    }

    /// Abandons the current pass and any coalesced request.
    pub fn cancel(&self) {
        self.inner.slot.lock().pending = false;
        self.inner.cancel.cancel();
    }

    /// Cancels, refuses further requests and joins the worker.
    pub fn shutdown(&self) {
        let handle = {
            let mut slot = self.inner.slot.lock();
            slot.closed = true;
            slot.pending = false;
            slot.handle.take()
        };
        self.inner.cancel.cancel();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Recovery worker panicked");
            }
        }
    }

    /// Whether a worker is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.slot.lock().running
    }

    /// Restarts that brought the stream back.
    pub fn recoveries(&self) -> u32 {
        self.inner.recoveries.load(Ordering::SeqCst)
    }

    /// Passes that gave up after exhausting their attempts.
    pub fn exhausted(&self) -> u32 {
        self.inner.exhausted.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn run<F: FnMut() -> Attempt>(&self, mut attempt: F) {
        loop {
            self.run_pass(&mut attempt);

            let mut slot = self.slot.lock();
            if slot.pending && !slot.closed {
                slot.pending = false;
                continue;
            }
            slot.running = false;
            return;
        }
    }

    fn run_pass<F: FnMut() -> Attempt>(&self, attempt: &mut F) {
        let epoch = self.cancel.epoch();
        let mut backoff = self.config.initial_backoff;

        for number in 1..=self.config.max_attempts {
            if self.cancel.is_cancelled(epoch) {
                debug!("Recovery cancelled");
                return;
            }

            match attempt() {
                Attempt::Recovered => {
                    self.recoveries.fetch_add(1, Ordering::SeqCst);
                    info!("Stream recovered after {} attempt(s)", number);
                    return;
                }
                Attempt::Skipped => {
                    debug!("Recovery not needed");
                    return;
                }
                Attempt::Failed(e) => {
                    warn!(
                        "Recovery attempt {}/{} failed: {}",
                        number, self.config.max_attempts, e
                    );
                }
            }

            if number < self.config.max_attempts {
                if self.cancel.sleep(epoch, backoff) {
                    debug!("Recovery cancelled during backoff");
                    return;
                }
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }

        self.exhausted.fetch_add(1, Ordering::SeqCst);
        error!(
            "Giving up on stream recovery after {} attempts",
            self.config.max_attempts
        );
    }
}

impl Drop for RecoveryCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn fast_config(max_attempts: u32) -> RecoveryConfig {
        RecoveryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn wait_idle(coordinator: &RecoveryCoordinator) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.is_running() {
            assert!(Instant::now() < deadline, "recovery worker never finished");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_successful_attempt_counts_recovery() {
        let coordinator = RecoveryCoordinator::new(fast_config(3));
        assert!(coordinator.schedule(|| Attempt::Recovered));
        wait_idle(&coordinator);
        assert_eq!(coordinator.recoveries(), 1);
        assert_eq!(coordinator.exhausted(), 0);
    }

    #[test]
    fn test_retries_until_success() {
        let coordinator = RecoveryCoordinator::new(fast_config(5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        coordinator.schedule(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Attempt::Failed(StreamError::NotOpen)
            } else {
                Attempt::Recovered
            }
        });
        wait_idle(&coordinator);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.recoveries(), 1);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let coordinator = RecoveryCoordinator::new(fast_config(4));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        coordinator.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Attempt::Failed(StreamError::Disconnected)
        });
        wait_idle(&coordinator);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(coordinator.exhausted(), 1);
        assert_eq!(coordinator.recoveries(), 0);
    }

    #[test]
    fn test_requests_during_a_pass_are_coalesced() {
        let coordinator = RecoveryCoordinator::new(fast_config(1));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        assert!(coordinator.schedule(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
            }
            Attempt::Skipped
        }));
        entered_rx.recv().unwrap();

        assert!(!coordinator.schedule(|| Attempt::Recovered));
        assert!(!coordinator.schedule(|| Attempt::Recovered));
        release_tx.send(()).unwrap();
        wait_idle(&coordinator);

        // one extra pass, run with the first closure
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.recoveries(), 0);
    }

    #[test]
    fn test_cancel_interrupts_backoff() {
        let coordinator = RecoveryCoordinator::new(RecoveryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        });
        let (failed_tx, failed_rx) = mpsc::channel();
        coordinator.schedule(move || {
            let _ = failed_tx.send(());
            Attempt::Failed(StreamError::NotOpen)
        });
        failed_rx.recv().unwrap();

        let started = Instant::now();
        coordinator.cancel();
        wait_idle(&coordinator);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(coordinator.exhausted(), 0);
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let coordinator = RecoveryCoordinator::new(fast_config(1));
        coordinator.shutdown();
        assert!(!coordinator.schedule(|| Attempt::Recovered));
        assert_eq!(coordinator.recoveries(), 0);
    }
}
