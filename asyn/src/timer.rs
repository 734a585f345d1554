//! A single shared timeout engine, one per [`Manager`](crate::Manager).
//!
//! The original links every port's queued-request timeout into one process-wide
//! `epicsTimerQueue`; `queueRequest` arms a timer, `cancelRequest` (called from
//! user code or from the timer firing itself) disarms it. This engine keeps a
//! single-threaded timer wheel (`BinaryHeap<Reverse<TimerEntry>>` keyed by
//! deadline, tombstone-on-cancel) serviced by one dedicated thread that
//! invokes callbacks directly, since this crate's callers block rather than
//! poll for readiness.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use slab::Slab;

use asyn_log::instrument;

type TimeoutFn = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    key: usize,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

struct Slot {
    deadline: Instant,
    callback: Option<TimeoutFn>,
}

struct State {
    slots: Slab<Slot>,
    heap: BinaryHeap<Reverse<TimerEntry>>,
    shutdown: bool,
}

/// A handle to an armed timer. Dropping it does not cancel the timer; call
/// [`TimerEngine::cancel`] explicitly, matching `epicsTimerCancel`'s
/// explicit-disarm contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(usize);

/// The shared timer engine: one dedicated thread, one min-heap of deadlines.
pub struct TimerEngine {
    state: Mutex<State>,
    woken: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerEngine {
    pub fn new() -> Arc<Self> {
        let engine = Arc::new(Self {
            state: Mutex::new(State {
                slots: Slab::new(),
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            woken: Condvar::new(),
            thread: Mutex::new(None),
        });
        // Only a `Weak` reference crosses into the worker closure, re-upgraded
        // every wake cycle: a strong clone held for the thread's lifetime
        // would keep this `Arc`'s refcount above zero forever, so `impl Drop
        // for TimerEngine` (which signals and joins this thread) would never
        // run.
        let weak = Arc::downgrade(&engine);
        let handle = std::thread::Builder::new()
            .name("asyn-timer".into())
            .spawn(move || Self::run_weak(weak))
            .expect("failed to spawn asyn timer thread");
        *engine.thread.lock().unwrap() = Some(handle);
        engine
    }

    /// Arm a timer that invokes `callback` after `delay` unless cancelled
    /// first. Returns `None` if `delay` is zero (callers should treat a
    /// zero/negative timeout as "no timer", per `queueRequest`'s contract).
    pub fn arm(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> Option<TimerToken> {
        if delay.is_zero() {
            return None;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock().unwrap();
        let key = state.slots.insert(Slot {
            deadline,
            callback: Some(Box::new(callback)),
        });
        state.heap.push(Reverse(TimerEntry { deadline, key }));
        drop(state);
        self.woken.notify_one();
        Some(TimerToken(key))
    }

    /// Disarm a timer. A no-op if it already fired or was already cancelled.
    pub fn cancel(&self, token: TimerToken) {
        let mut state = self.state.lock().unwrap();
        state.slots.try_remove(token.0);
    }

    /// The worker thread's entry point: holds only a [`Weak`] reference,
    /// re-upgraded every cycle, so the last external strong reference going
    /// away lets this thread notice (the next upgrade fails) and exit,
    /// rather than pinning the engine alive forever.
    fn run_weak(weak: Weak<Self>) {
        instrument!(asyn_log::Level::DEBUG, "asyn_timer_thread");
        loop {
            let Some(engine) = weak.upgrade() else { return };
            if !engine.run_once() {
                return;
            }
        }
    }

    /// One wake-and-process cycle. Waits in bounded chunks (so the caller
    /// periodically re-checks whether the engine is still referenced)
    /// until the next deadline or a wake, then fires any due callbacks.
    /// Returns `false` once `shutdown` has been signalled.
    fn run_once(&self) -> bool {
        const MAX_WAIT: Duration = Duration::from_millis(200);
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return false;
        }
        let next_deadline = state.heap.peek().map(|e| e.0.deadline);
        let ready = match next_deadline {
            None => {
                let (guard, _) = self.woken.wait_timeout(state, MAX_WAIT).unwrap();
                state = guard;
                Vec::new()
            }
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    let (guard, _) = self.woken.wait_timeout(state, (deadline - now).min(MAX_WAIT)).unwrap();
                    state = guard;
                }
                self.drain_ready(&mut state)
            }
        };
        drop(state);
        for callback in ready {
            callback();
        }
        true
    }

    fn drain_ready(&self, state: &mut State) -> Vec<TimeoutFn> {
        let now = Instant::now();
        let mut ready = Vec::new();
        while let Some(top) = state.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            let Reverse(entry) = state.heap.pop().unwrap();
            if let Some(slot) = state.slots.get_mut(entry.key) {
                if slot.deadline != entry.deadline {
                    // Stale heap entry from a slot reused after cancellation; skip it.
                    continue;
                }
                if let Some(cb) = slot.callback.take() {
                    ready.push(cb);
                }
                state.slots.remove(entry.key);
            }
        }
        ready
    }

    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.woken.notify_one();
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            // As in `PortInner`'s Drop: the worker can be the one dropping
            // the last strong reference, in which case joining it would be
            // a thread joining itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
