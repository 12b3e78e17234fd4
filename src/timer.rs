//! Single-shot deadline scheduler backing the engine's retry/timeout
//! accounting (§5, §9, §11.2).
//!
//! At most one deadline is armed at a time. Re-arming cancels whatever was
//! previously pending; cancellation is idempotent. A background thread
//! waits on a [`Condvar`] for either a notification (arm/cancel/shutdown)
//! or the current deadline, and invokes the engine's callback with the
//! generation the deadline was armed under — the engine re-checks that
//! generation against the one it last armed before acting on the fire,
//! which is what makes a cancel racing a fire safe (§5 "Cancellation and
//! timeouts").
//!
//! This replaces the teacher's blocking `port.read()` timeouts (handled
//! for free by the `serialport` crate) with an explicit scheduler, since
//! this engine never blocks on input (§5).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct TimerState {
    generation: u64,
    deadline: Option<Instant>,
    stopped: bool,
}

/// State shared between [`TimerService`] and its background thread.
struct Shared {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

impl Shared {
    fn run(self: Arc<Self>, on_fire: impl Fn(u64)) {
        loop {
            let mut state = self.state.lock().expect("timer lock poisoned");
            loop {
                if state.stopped {
                    return;
                }
                match state.deadline {
                    None => {
                        state = self.condvar.wait(state).expect("timer lock poisoned");
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        let (guard, _timed_out) = self
                            .condvar
                            .wait_timeout(state, deadline - now)
                            .expect("timer lock poisoned");
                        state = guard;
                    }
                }
            }
            if state.stopped {
                return;
            }
            let generation = state.generation;
            state.deadline = None;
            drop(state);
            on_fire(generation);
        }
    }
}

/// Background single-shot deadline scheduler.
///
/// One [`TimerService`] serves a single [`crate::engine::Engine`]. Dropping
/// it (or calling [`TimerService::shutdown`]) joins the background thread.
pub struct TimerService {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Spawn the background thread. `on_fire` is invoked (off the thread
    /// that called [`TimerService::arm`]) with the generation of the
    /// deadline that elapsed.
    pub fn new<F>(on_fire: F) -> Self
    where
        F: Fn(u64) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                generation: 0,
                deadline: None,
                stopped: false,
            }),
            condvar: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("xmodem-timer".into())
            .spawn(move || worker.run(on_fire))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Arm a new deadline `dur` from now, superseding whatever was armed
    /// before. Returns the generation token of this deadline; the caller
    /// stores it and compares against the token handed to `on_fire`.
    pub fn arm(&self, dur: Duration) -> u64 {
        let mut state = self.shared.state.lock().expect("timer lock poisoned");
        state.generation += 1;
        state.deadline = Some(Instant::now() + dur);
        let generation = state.generation;
        drop(state);
        self.shared.condvar.notify_one();
        generation
    }

    /// Cancel any pending deadline. Idempotent — cancelling twice, or
    /// cancelling with nothing armed, is a no-op beyond bumping the
    /// generation so a fire already in flight is recognized as stale.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().expect("timer lock poisoned");
        state.generation += 1;
        state.deadline = None;
        drop(state);
        self.shared.condvar.notify_one();
    }

    /// Tear down the background thread, draining any callback already in
    /// flight. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("timer lock poisoned");
            state.stopped = true;
            state.deadline = None;
        }
        self.shared.condvar.notify_one();
        if let Some(handle) = self.handle.lock().expect("timer lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn fires_armed_deadline_with_matching_generation() {
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let timer = TimerService::new(move |generation| {
            fired_clone.store(generation, Ordering::SeqCst);
        });
        let token = timer.arm(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), token);
    }

    #[test]
    fn cancel_suppresses_a_pending_fire() {
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let timer = TimerService::new(move |generation| {
            fired_clone.store(generation, Ordering::SeqCst);
        });
        timer.arm(Duration::from_millis(20));
        timer.cancel();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearming_supersedes_the_previous_deadline() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = Arc::clone(&calls);
        let timer = TimerService::new(move |_generation| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        timer.arm(Duration::from_millis(200));
        let second = timer.arm(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second > 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_joins_the_thread() {
        let timer = TimerService::new(|_| {});
        timer.shutdown();
        timer.shutdown();
    }
}
