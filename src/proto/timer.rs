//! Hashed-wheel read-timeout timer.
//!
//! One process-wide wheel serves every client in the process, the same
//! instance for the whole library lifetime. A dedicated thread advances the
//! wheel; expired tasks run on that thread. Registry and promise mutations
//! are lock-protected, so running them off the connection task is sound.
//!
//! Tick duration and wheel size are read once from the environment:
//! `COURIER_WHEEL_TICK_MS` (default 30) and `COURIER_WHEEL_SIZE`
//! (default 512, rounded up to a power of two).

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

const STATE_PENDING: u8 = 0;
const STATE_CANCELED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

type Task = Box<dyn FnOnce() + Send>;

struct TimeoutState {
    state: AtomicU8,
    deadline_tick: u64,
    task: Mutex<Option<Task>>,
}

/// A scheduled task handle.
///
/// Cancelling wins any race with expiry: once `cancel` returns `true`, the
/// task is guaranteed never to run.
#[derive(Clone)]
pub(crate) struct Timeout {
    state: Arc<TimeoutState>,
}

impl Timeout {
    /// Cancels the task. Returns `false` if it already ran or was already
    /// cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let won = self
            .state
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_CANCELED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            // Drop the task eagerly so captured resources are not pinned
            // until the slot is next visited.
            self.state.task.lock().unwrap().take();
        }
        won
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.state.load(Ordering::Acquire) == STATE_CANCELED
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.state.state.load(Ordering::Acquire) == STATE_EXPIRED
    }
}

struct Wheel {
    slots: Vec<Vec<Arc<TimeoutState>>>,
    stopped: bool,
}

struct Shared {
    wheel: Mutex<Wheel>,
    cv: Condvar,
    tick: Duration,
    mask: u64,
    started_at: Instant,
    current_tick: AtomicU64,
}

/// A hashed-wheel timer.
///
/// `schedule` is O(1); precision is one tick. The driving thread exits when
/// [`HashedWheelTimer::stop`] is called.
pub(crate) struct HashedWheelTimer {
    shared: Arc<Shared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl HashedWheelTimer {
    pub(crate) fn new(tick: Duration, wheel_size: usize) -> HashedWheelTimer {
        let size = wheel_size.max(1).next_power_of_two();
        let shared = Arc::new(Shared {
            wheel: Mutex::new(Wheel {
                slots: (0..size).map(|_| Vec::new()).collect(),
                stopped: false,
            }),
            cv: Condvar::new(),
            tick: tick.max(Duration::from_millis(1)),
            mask: (size - 1) as u64,
            started_at: Instant::now(),
            current_tick: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("courier-read-timeout".into())
            .spawn(move || Self::run(worker))
            .expect("failed to spawn timer thread");
        HashedWheelTimer {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(shared: Arc<Shared>) {
        let mut tick: u64 = 0;
        loop {
            let deadline = shared.started_at + shared.tick * (tick as u32 + 1);
            let mut wheel = shared.wheel.lock().unwrap();
            loop {
                if wheel.stopped {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = shared
                    .cv
                    .wait_timeout(wheel, deadline - now)
                    .unwrap();
                wheel = guard;
            }

            tick += 1;
            shared.current_tick.store(tick, Ordering::Release);
            let slot = (tick & shared.mask) as usize;
            let mut due = Vec::new();
            wheel.slots[slot].retain(|entry| {
                if entry.state.load(Ordering::Acquire) != STATE_PENDING {
                    return false;
                }
                if entry.deadline_tick <= tick {
                    due.push(Arc::clone(entry));
                    return false;
                }
                true
            });
            drop(wheel);

            for entry in due {
                if entry
                    .state
                    .compare_exchange(
                        STATE_PENDING,
                        STATE_EXPIRED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    if let Some(task) = entry.task.lock().unwrap().take() {
                        task();
                    }
                }
            }
        }
    }

    /// Schedules `task` to run once `delay` has elapsed.
    ///
    /// After `stop` the returned token is already cancelled and the task
    /// will never run.
    pub(crate) fn schedule(&self, task: Task, delay: Duration) -> Timeout {
        let now_tick = self.shared.current_tick.load(Ordering::Acquire);
        let ticks = delay.as_nanos().div_ceil(self.shared.tick.as_nanos().max(1)) as u64;
        let deadline_tick = now_tick + ticks.max(1);
        let state = Arc::new(TimeoutState {
            state: AtomicU8::new(STATE_PENDING),
            deadline_tick,
            task: Mutex::new(Some(task)),
        });

        let mut wheel = self.shared.wheel.lock().unwrap();
        let token = Timeout {
            state: Arc::clone(&state),
        };
        if wheel.stopped {
            drop(wheel);
            token.cancel();
            return token;
        }
        let slot = (deadline_tick & self.shared.mask) as usize;
        wheel.slots[slot].push(state);
        token
    }

    /// Stops the wheel, returning the tokens that were still outstanding so
    /// callers can cancel or inspect them.
    pub(crate) fn stop(&self) -> Vec<Timeout> {
        let mut outstanding = Vec::new();
        {
            let mut wheel = self.shared.wheel.lock().unwrap();
            if wheel.stopped {
                return outstanding;
            }
            wheel.stopped = true;
            for slot in wheel.slots.iter_mut() {
                for entry in slot.drain(..) {
                    if entry.state.load(Ordering::Acquire) == STATE_PENDING {
                        outstanding.push(Timeout { state: entry });
                    }
                }
            }
            self.shared.cv.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        outstanding
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The process-wide wheel used for read timeouts.
pub(crate) fn global() -> &'static HashedWheelTimer {
    static TIMER: OnceLock<HashedWheelTimer> = OnceLock::new();
    TIMER.get_or_init(|| {
        let tick = env_u64("COURIER_WHEEL_TICK_MS", 30);
        let size = env_u64("COURIER_WHEEL_SIZE", 512) as usize;
        HashedWheelTimer::new(Duration::from_millis(tick), size)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn task_fires_after_delay() {
        let timer = HashedWheelTimer::new(Duration::from_millis(5), 32);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let token = timer.schedule(
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(20),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(token.is_expired());
        timer.stop();
    }

    #[test]
    fn cancelled_task_never_fires() {
        let timer = HashedWheelTimer::new(Duration::from_millis(5), 32);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let token = timer.schedule(
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(30),
        );
        assert!(token.cancel());
        assert!(!token.cancel());
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.stop();
    }

    #[test]
    fn stop_returns_outstanding_tokens() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 32);
        let _fast = timer.schedule(Box::new(|| {}), Duration::from_secs(60));
        let _slow = timer.schedule(Box::new(|| {}), Duration::from_secs(120));
        let outstanding = timer.stop();
        assert_eq!(outstanding.len(), 2);
        for token in &outstanding {
            token.cancel();
        }
        assert!(outstanding.iter().all(|t| t.is_cancelled()));
    }

    #[test]
    fn schedule_after_stop_is_cancelled() {
        let timer = HashedWheelTimer::new(Duration::from_millis(5), 32);
        timer.stop();
        let token = timer.schedule(Box::new(|| panic!("must not run")), Duration::ZERO);
        assert!(token.is_cancelled());
    }
}
