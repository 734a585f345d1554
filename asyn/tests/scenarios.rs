//! Integration tests exercising the concrete scenarios and a sample of the
//! universal properties from this crate's specification: connection
//! lifecycle, multi-device addressing, timeouts, exception fan-out/defer,
//! the lock-holder fast path, and connect-priority draining.
//!
//! None of these tests register a concrete `asynCommon` driver (out of
//! scope for this crate), so each simulates the transport by calling
//! `Manager::exception_connect` directly, exactly as a driver would once its
//! own `connect()` succeeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use asyn::{AsynUser, ExceptionKind, Manager, PortConfig, Priority, RequestHandler};

struct Noop;
impl RequestHandler for Noop {
    fn on_queue(&self, _user: &AsynUser) {}
}

/// Runs a closure when queued and signals a channel; records the order it
/// ran in via a shared counter, for FIFO/ordering assertions.
struct RecordingHandler {
    order: Arc<Mutex<Vec<&'static str>>>,
    label: &'static str,
    tx: Mutex<Option<mpsc::Sender<()>>>,
}
impl RequestHandler for RecordingHandler {
    fn on_queue(&self, _user: &AsynUser) {
        self.order.lock().unwrap().push(self.label);
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

struct TimeoutHandler {
    queue_calls: Arc<AtomicUsize>,
    timeout_tx: Mutex<Option<mpsc::Sender<()>>>,
}
impl RequestHandler for TimeoutHandler {
    fn on_queue(&self, _user: &AsynUser) {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
    }
    fn on_timeout(&self, _user: &AsynUser) {
        if let Some(tx) = self.timeout_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// S1. Single-device port, one queued request: the callback runs exactly
/// once and the user is no longer queued once it does.
#[test]
fn s1_single_device_request_runs_once() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("P1").auto_connect(true)).unwrap();

    let bootstrap = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&bootstrap, "P1", None).unwrap();
    mgr.exception_connect(&bootstrap).unwrap();

    let (tx, rx) = mpsc::channel();
    let count = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let user = mgr.create_user(Arc::new(RecordingHandler {
        order: order.clone(),
        label: "U",
        tx: Mutex::new(Some(tx)),
    }));
    let _ = count; // silence unused in this scenario; shared struct reused below
    mgr.connect_user(&user, "P1", None).unwrap();
    mgr.queue_request(&user, Priority::Medium, Duration::ZERO).unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["U"]);
    assert!(!user.is_queued());
}

/// S2. Two users on distinct addresses of a multi-device port both run.
#[test]
fn s2_multi_device_distinct_addresses_both_run() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("P2").multi_device(true)).unwrap();

    // The port-level endpoint (addr None) gates entry into the worker's
    // user-priority scheduling phase, independent of any device's own
    // connected state -- connect it before queueing device-addressed work.
    let bootstrap = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&bootstrap, "P2", None).unwrap();
    mgr.exception_connect(&bootstrap).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx1, rx1) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();

    let u1 = mgr.create_user(Arc::new(RecordingHandler {
        order: order.clone(),
        label: "U1",
        tx: Mutex::new(Some(tx1)),
    }));
    mgr.connect_user(&u1, "P2", Some(3)).unwrap();
    mgr.exception_connect(&u1).unwrap();

    let u2 = mgr.create_user(Arc::new(RecordingHandler {
        order: order.clone(),
        label: "U2",
        tx: Mutex::new(Some(tx2)),
    }));
    mgr.connect_user(&u2, "P2", Some(5)).unwrap();
    mgr.exception_connect(&u2).unwrap();

    mgr.queue_request(&u1, Priority::Medium, Duration::ZERO).unwrap();
    mgr.queue_request(&u2, Priority::Medium, Duration::ZERO).unwrap();

    rx1.recv_timeout(Duration::from_secs(2)).unwrap();
    rx2.recv_timeout(Duration::from_secs(2)).unwrap();

    let ran = order.lock().unwrap();
    assert_eq!(ran.len(), 2);
    assert!(ran.contains(&"U1"));
    assert!(ran.contains(&"U2"));
}

/// S3. A request queued with a timeout on a never-connected port fires its
/// timeout callback, is dequeued, and a subsequent request by the same user
/// succeeds.
#[test]
fn s3_timeout_fires_then_requeue_succeeds() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("P3").auto_connect(false)).unwrap();

    let (tx, rx) = mpsc::channel();
    let queue_calls = Arc::new(AtomicUsize::new(0));
    let user = mgr.create_user(Arc::new(TimeoutHandler {
        queue_calls: queue_calls.clone(),
        timeout_tx: Mutex::new(Some(tx)),
    }));
    mgr.connect_user(&user, "P3", None).unwrap();

    mgr.queue_request(&user, Priority::Low, Duration::from_millis(50)).unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert!(!user.is_queued());
    assert_eq!(queue_calls.load(Ordering::SeqCst), 0);
    assert!(mgr.queue_request(&user, Priority::Low, Duration::ZERO).is_ok());
    mgr.cancel_request(&user).unwrap();
}

/// S4. A subscriber removed from within another subscriber's callback during
/// an active notification pass is deferred until the pass completes, and the
/// remover's call unblocks once it has.
#[test]
fn s4_exception_callback_remove_defers_during_notification() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("P4")).unwrap();

    let watcher = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&watcher, "P4", None).unwrap();

    let other = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&other, "P4", None).unwrap();
    mgr.exception_callback_add(&other, Arc::new(|_, _| {})).unwrap();

    let removed = Arc::new(Mutex::new(false));
    let removed_in_cb = removed.clone();
    let mgr_in_cb = mgr.clone();
    let other_in_cb = other.clone();
    let remover_done = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
    let remover_done_cb = remover_done.clone();

    mgr.exception_callback_add(
        &watcher,
        Arc::new(move |_user, _kind| {
            // Spawn the remover from inside the notification callback so it
            // observes exceptionActive=true and must defer.
            let mgr2 = mgr_in_cb.clone();
            let other2 = other_in_cb.clone();
            let done = remover_done_cb.clone();
            let removed2 = removed_in_cb.clone();
            std::thread::spawn(move || {
                mgr2.exception_callback_remove(&other2).unwrap();
                *removed2.lock().unwrap() = true;
                let (lock, cvar) = &*done;
                *lock.lock().unwrap() = true;
                cvar.notify_all();
            });
            // Give the remover a moment to actually block on the active flag
            // before this callback (and the notification pass) returns.
            std::thread::sleep(Duration::from_millis(30));
        }),
    )
    .unwrap();

    mgr.exception_connect(&watcher).unwrap();

    let (lock, cvar) = &*remover_done;
    let mut done = lock.lock().unwrap();
    while !*done {
        let (d, _) = cvar.wait_timeout(done, Duration::from_secs(2)).unwrap();
        done = d;
        if *done {
            break;
        }
    }
    assert!(*removed.lock().unwrap());
}

/// A handler for the lock holder in [`s5_lock_holder_fast_path`]: every
/// invocation records itself, and the first invocation blocks until the test
/// says to proceed, so the test can queue a peer's request and the holder's
/// own follow-up while the holder's first callback is still in flight (and
/// `lockHolder` is therefore already set to the holder).
struct PausingHolder {
    order: Arc<Mutex<Vec<&'static str>>>,
    started: Mutex<Option<mpsc::Sender<()>>>,
    proceed: Mutex<Option<mpsc::Receiver<()>>>,
}
impl RequestHandler for PausingHolder {
    fn on_queue(&self, _user: &AsynUser) {
        self.order.lock().unwrap().push("holder");
        if let Some(tx) = self.started.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.proceed.lock().unwrap().take() {
            let _ = rx.recv_timeout(Duration::from_secs(2));
        }
    }
}

/// S5. A lock holder's follow-up request runs ahead of a peer already queued
/// at the same priority; the peer becomes runnable only once the holder
/// releases the lock.
#[test]
fn s5_lock_holder_fast_path() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("P5")).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();

    let holder = mgr.create_user(Arc::new(PausingHolder {
        order: order.clone(),
        started: Mutex::new(Some(started_tx)),
        proceed: Mutex::new(Some(proceed_rx)),
    }));
    mgr.connect_user(&holder, "P5", None).unwrap();
    mgr.exception_connect(&holder).unwrap();

    mgr.lock(&holder).unwrap();
    mgr.queue_request(&holder, Priority::Low, Duration::ZERO).unwrap();
    // Wait until the holder's first callback (R1) has actually started: at
    // this point the worker has already set `lockHolder` to the holder.
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let (tx_peer, rx_peer) = mpsc::channel();
    let peer = mgr.create_user(Arc::new(RecordingHandler {
        order: order.clone(),
        label: "peer",
        tx: Mutex::new(Some(tx_peer)),
    }));
    mgr.connect_user(&peer, "P5", None).unwrap();
    mgr.queue_request(&peer, Priority::Low, Duration::ZERO).unwrap(); // R2
    mgr.queue_request(&holder, Priority::Low, Duration::ZERO).unwrap(); // R3, fast path

    // Let R1 finish; R3 should now run (head of queue, holder still owns the
    // lock) while R2 stays queued behind the lock.
    proceed_tx.send(()).unwrap();

    // Give the worker time to process R3 before asserting order, since R2's
    // completion is the only externally observable synchronization point.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(order.lock().unwrap().as_slice(), &["holder", "holder"]);
    assert!(rx_peer.try_recv().is_err(), "peer must not run before unlock");

    mgr.unlock(&holder).unwrap();
    rx_peer.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), &["holder", "holder", "peer"]);
}

/// S6. Connect-priority entries all drain before any user-priority entry in
/// the same wake cycle.
#[test]
fn s6_connect_priority_drains_before_user_priority() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("P6").auto_connect(false)).unwrap();

    let bootstrap = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&bootstrap, "P6", None).unwrap();
    mgr.exception_connect(&bootstrap).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx_done, rx_done) = mpsc::channel();
    let remaining = Arc::new(AtomicUsize::new(4));

    let make_handler = |label: &'static str| {
        let order = order.clone();
        let tx_done = tx_done.clone();
        let remaining = remaining.clone();
        RecordingHandlerCounting {
            order,
            label,
            tx_done,
            remaining,
        }
    };

    struct RecordingHandlerCounting {
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        tx_done: mpsc::Sender<()>,
        remaining: Arc<AtomicUsize>,
    }
    impl RequestHandler for RecordingHandlerCounting {
        fn on_queue(&self, _user: &AsynUser) {
            self.order.lock().unwrap().push(self.label);
            if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                let _ = self.tx_done.send(());
            }
        }
    }

    let c1 = mgr.create_user(Arc::new(make_handler("C1")));
    mgr.connect_user(&c1, "P6", None).unwrap();
    let m1 = mgr.create_user(Arc::new(make_handler("M1")));
    mgr.connect_user(&m1, "P6", None).unwrap();
    let m2 = mgr.create_user(Arc::new(make_handler("M2")));
    mgr.connect_user(&m2, "P6", None).unwrap();
    let m3 = mgr.create_user(Arc::new(make_handler("M3")));
    mgr.connect_user(&m3, "P6", None).unwrap();

    mgr.queue_request(&c1, Priority::Connect, Duration::ZERO).unwrap();
    mgr.queue_request(&m1, Priority::Medium, Duration::ZERO).unwrap();
    mgr.queue_request(&m2, Priority::Medium, Duration::ZERO).unwrap();
    mgr.queue_request(&m3, Priority::Medium, Duration::ZERO).unwrap();

    rx_done.recv_timeout(Duration::from_secs(2)).unwrap();

    let ran = order.lock().unwrap();
    assert_eq!(ran.len(), 4);
    assert_eq!(ran[0], "C1");
}

/// Universal property: a user is queued iff it appears in exactly one port's
/// priority list, observable here as `is_queued()` flipping false once its
/// callback has been dispatched.
#[test]
fn prop_is_queued_false_after_dispatch() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("PQ")).unwrap();
    let bootstrap = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&bootstrap, "PQ", None).unwrap();
    mgr.exception_connect(&bootstrap).unwrap();

    let (tx, rx) = mpsc::channel();
    let order = Arc::new(Mutex::new(Vec::new()));
    let user = mgr.create_user(Arc::new(RecordingHandler {
        order,
        label: "u",
        tx: Mutex::new(Some(tx)),
    }));
    mgr.connect_user(&user, "PQ", None).unwrap();

    assert!(!user.is_queued());
    mgr.queue_request(&user, Priority::Low, Duration::ZERO).unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(!user.is_queued());
}

/// Universal property: `lock`/`queueRequest`/`unlock` round-trips leave
/// `lockCount` balanced.
#[test]
fn prop_lock_count_round_trips() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("PL")).unwrap();
    let user = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&user, "PL", None).unwrap();
    mgr.exception_connect(&user).unwrap();

    assert_eq!(user.lock_count(), 0);
    mgr.lock(&user).unwrap();
    assert_eq!(user.lock_count(), 1);
    mgr.queue_request(&user, Priority::Low, Duration::ZERO).unwrap();
    // give the worker a moment to dispatch
    std::thread::sleep(Duration::from_millis(100));
    mgr.unlock(&user).unwrap();
    assert_eq!(user.lock_count(), 0);
}

/// ExceptionKind::Enable fires when a port's enabled state is toggled.
#[test]
fn enable_toggle_emits_exception() {
    let mgr = Manager::new();
    mgr.register_port(PortConfig::new("PE")).unwrap();
    let user = mgr.create_user(Arc::new(Noop));
    mgr.connect_user(&user, "PE", None).unwrap();

    let seen: Arc<Mutex<Vec<ExceptionKind>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    mgr.exception_callback_add(
        &user,
        Arc::new(move |_, kind| seen2.lock().unwrap().push(kind)),
    )
    .unwrap();

    mgr.enable(&user, false).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[ExceptionKind::Enable]);
    mgr.exception_callback_remove(&user).unwrap();
}
