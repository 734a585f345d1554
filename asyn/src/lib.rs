//! `asyn`: an asynchronous I/O manager and driver framework for instrument
//! and device communication, mirroring `asynManager`'s embedding API.
//!
//! A [`Manager`] owns the registry of [`Port`]s, the process-wide timer
//! engine, and the process-wide trace lock. Callers register ports and
//! interfaces, create [`AsynUser`] handles, connect them to a port (and,
//! for multi-device ports, an address), and submit callbacks through
//! [`Manager::queue_request`]. Everything that drives actual transport I/O
//! -- the concrete serial/TCP/GPIB drivers, the record-engine layer, and
//! `syncIO`-style blocking wrappers -- is deliberately out of scope; this
//! crate schedules and serializes access to a port, it does not itself
//! perform I/O.
//!
//! See the `port`, `user`, `exception`, `interface`, and `trace` modules
//! for the pieces this facade composes.

mod device;
mod endpoint;
mod error;
mod exception;
mod interface;
mod port;
mod timer;
mod trace;
mod user;

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use endpoint::Priority;
pub use error::{AsynError, CancelOutcome, Status, ERROR_MESSAGE_CAPACITY};
pub use exception::ExceptionKind;
pub use interface::Interface;
pub use port::{CommonHandle, CommonInterface, Port, PortConfig, ASYN_COMMON_INTERFACE};
pub use trace::{TraceIoMask, TraceMask, DEFAULT_TRACE_TRUNCATE_SIZE};
pub use user::{AsynUser, ExceptionCallback, RequestHandler};

use port::PortRegistry;
use timer::TimerEngine;
use trace::TraceLock;

/// Builder for a [`Manager`]: there is currently nothing to configure beyond
/// defaults, but the type exists so construction can grow knobs (e.g. a
/// default trace mask for newly registered ports) without an API break.
#[derive(Default)]
pub struct ManagerBuilder {
    _private: (),
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> Manager {
        Manager::new()
    }
}

struct ManagerInner {
    ports: Mutex<PortRegistry>,
    timer: Arc<TimerEngine>,
    trace_lock: Arc<TraceLock>,
}

/// The process-wide (per-instance) runtime: the port registry, the shared
/// timer engine, and the shared trace lock. The original keeps a single
/// `pasynBase` global; this crate keeps the same shape but as an explicitly
/// constructed value so independent tests (and, in principle, independent
/// embedders in one process) don't share state. Cheap to clone -- every
/// clone refers to the same registry, timer engine, and trace lock.
#[derive(Clone)]
pub struct Manager(Arc<ManagerInner>);

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self(Arc::new(ManagerInner {
            ports: Mutex::new(PortRegistry::new()),
            timer: TimerEngine::new(),
            trace_lock: Arc::new(TraceLock::new()),
        }))
    }

    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    fn port(&self, name: &str) -> Result<Port, AsynError> {
        self.0
            .ports
            .lock()
            .unwrap()
            .get(name)
            .ok_or_else(|| AsynError::misuse(format!("port {} not found", name)))
    }

    fn user_port(&self, user: &AsynUser) -> Result<Port, AsynError> {
        user.sched().lock().unwrap().port.clone().ok_or_else(|| {
            let err = AsynError::misuse("user not connected to a port");
            user.set_error(err.message());
            err
        })
    }

    // -- port/device/user model (spec.md 4.1) --------------------------------

    /// Register a new port and spawn its dedicated worker thread. Fails if
    /// `config.name` is already registered.
    pub fn register_port(&self, config: PortConfig) -> Result<Port, AsynError> {
        let mut ports = self.0.ports.lock().unwrap();
        if ports.contains(&config.name) {
            return Err(AsynError::misuse(format!(
                "port {} is already registered",
                config.name
            )));
        }
        let port = Port::spawn(config, self.0.timer.clone(), self.0.trace_lock.clone());
        ports.insert(port.clone());
        Ok(port)
    }

    /// Create a new, as-yet-unconnected user handle.
    pub fn create_user(&self, handler: Arc<dyn RequestHandler>) -> AsynUser {
        AsynUser::new(handler)
    }

    /// Free a user handle. Fails if the user is still connected to a port,
    /// still queued, still holds a lock, or still has an active exception
    /// subscription -- silently dropping any of that state would strand the
    /// port's bookkeeping.
    pub fn free_user(&self, user: &AsynUser) -> Result<(), AsynError> {
        let mut sched = user.sched().lock().unwrap();
        if sched.port.is_some() {
            let err = AsynError::misuse("freeUser: still connected");
            user.set_error(err.message());
            return Err(err);
        }
        if sched.is_queued {
            let err = AsynError::misuse("freeUser: is queued");
            user.set_error(err.message());
            return Err(err);
        }
        if sched.lock_count > 0 {
            let err = AsynError::misuse("freeUser: is locked");
            user.set_error(err.message());
            return Err(err);
        }
        if sched.has_exception_subscription {
            let err = AsynError::misuse("freeUser: on exceptionCallback list");
            user.set_error(err.message());
            return Err(err);
        }
        sched.timer_token = None;
        Ok(())
    }

    /// Whether `port_name` was registered with `multiDevice=true`. Fails if
    /// the port is unknown.
    pub fn is_multi_device(&self, port_name: &str) -> Result<bool, AsynError> {
        Ok(self.port(port_name)?.is_multi_device())
    }

    /// Connect `user` to `port_name`, materializing a device at `addr` on
    /// demand if the port is multi-device. Fails if the user is already
    /// connected or the port is unknown.
    pub fn connect_user(&self, user: &AsynUser, port_name: &str, addr: Option<i32>) -> Result<(), AsynError> {
        let port = self.port(port_name).map_err(|err| {
            user.set_error(err.message());
            err
        })?;
        port.connect_user(user, addr)
    }

    /// Disconnect `user` from its port. Fails if the user is queued, holds a
    /// lock, or has an active exception subscription.
    pub fn disconnect_user(&self, user: &AsynUser) -> Result<(), AsynError> {
        let port = self.user_port(user)?;
        port.disconnect_user(user)
    }

    /// The address `user` is connected to, or `-1` if the port is
    /// single-device or the user isn't bound to an address. Unlike most
    /// operations here this never fails, matching the original's bare `int`
    /// return.
    pub fn get_addr(&self, user: &AsynUser) -> i32 {
        match self.user_port(user) {
            Ok(port) => port.get_addr(user),
            Err(_) => -1,
        }
    }

    pub fn is_connected(&self, user: &AsynUser) -> Result<bool, AsynError> {
        Ok(self.user_port(user)?.is_connected(user))
    }

    pub fn is_enabled(&self, user: &AsynUser) -> Result<bool, AsynError> {
        Ok(self.user_port(user)?.is_enabled(user))
    }

    pub fn is_auto_connect(&self, user: &AsynUser) -> Result<bool, AsynError> {
        Ok(self.user_port(user)?.is_auto_connect(user))
    }

    pub fn enable(&self, user: &AsynUser, yes: bool) -> Result<(), AsynError> {
        self.user_port(user)?.enable(user, yes)
    }

    pub fn auto_connect(&self, user: &AsynUser, yes: bool) -> Result<(), AsynError> {
        self.user_port(user)?.set_auto_connect(user, yes)
    }

    /// Reported by driver code when the underlying transport has connected.
    pub fn exception_connect(&self, user: &AsynUser) -> Result<(), AsynError> {
        self.user_port(user)?.exception_connect(user)
    }

    /// Reported by driver code when the underlying transport has
    /// disconnected.
    pub fn exception_disconnect(&self, user: &AsynUser) -> Result<(), AsynError> {
        self.user_port(user)?.exception_disconnect(user)
    }

    // -- interface registry (spec.md 4.2) ------------------------------------

    pub fn register_interface(&self, port_name: &str, interface: Interface) -> Result<(), AsynError> {
        self.port(port_name)?.register_interface(interface)
    }

    /// Install an overlay interface at device level (if `addr` is given) or
    /// port level, returning whichever interface it shadows.
    pub fn interpose_interface(
        &self,
        port_name: &str,
        addr: Option<i32>,
        interface: Interface,
    ) -> Result<Option<Interface>, AsynError> {
        Ok(self.port(port_name)?.interpose_interface(addr, interface))
    }

    /// Resolve `interface_type` for `user`'s connected endpoint. Lookup order
    /// is device-interpose, then port-interpose, then port-base; if
    /// `interpose_ok` is false only the port-base registration is considered.
    pub fn find_interface(&self, user: &AsynUser, interface_type: &str, interpose_ok: bool) -> Option<Interface> {
        let port = self.user_port(user).ok()?;
        port.find_interface(user, interface_type, interpose_ok)
    }

    // -- exception fan-out (spec.md 4.3) --------------------------------------

    pub fn exception_callback_add(&self, user: &AsynUser, callback: ExceptionCallback) -> Result<(), AsynError> {
        self.user_port(user)?.exception_callback_add(user, callback)
    }

    pub fn exception_callback_remove(&self, user: &AsynUser) -> Result<(), AsynError> {
        self.user_port(user)?.exception_callback_remove(user)
    }

    // -- request queue & scheduler (spec.md 4.4) ------------------------------

    /// Submit `user`'s request callback at `priority`. If `timeout` is
    /// positive, the request is cancelled and `user`'s
    /// [`RequestHandler::on_timeout`] fires if it is still queued once the
    /// timeout elapses. Fails if the user isn't connected or is already
    /// queued.
    pub fn queue_request(&self, user: &AsynUser, priority: Priority, timeout: Duration) -> Result<(), AsynError> {
        self.user_port(user)?.queue_request(user, priority, timeout)
    }

    pub fn cancel_request(&self, user: &AsynUser) -> Result<CancelOutcome, AsynError> {
        let port = self.user_port(user)?;
        port.cancel_request(user)
    }

    // -- lock protocol (spec.md 4.5) ------------------------------------------

    pub fn lock(&self, user: &AsynUser) -> Result<(), AsynError> {
        self.user_port(user)?.lock(user)
    }

    pub fn unlock(&self, user: &AsynUser) -> Result<(), AsynError> {
        self.user_port(user)?.unlock(user)
    }

    // -- trace subsystem (spec.md 4.7) ----------------------------------------

    pub fn set_trace_mask(&self, user: &AsynUser, mask: TraceMask) -> Result<(), AsynError> {
        let port = self.user_port(user)?;
        port.set_trace_mask(user, mask);
        port.exception_occurred(user, ExceptionKind::TraceMask);
        Ok(())
    }

    pub fn trace_mask(&self, user: &AsynUser) -> Result<TraceMask, AsynError> {
        Ok(self.user_port(user)?.trace_mask(user))
    }

    pub fn set_trace_io_mask(&self, user: &AsynUser, mask: TraceIoMask) -> Result<(), AsynError> {
        self.user_port(user)?.set_trace_io_mask(user, mask);
        Ok(())
    }

    pub fn trace_io_mask(&self, user: &AsynUser) -> Result<TraceIoMask, AsynError> {
        Ok(self.user_port(user)?.trace_io_mask(user))
    }

    pub fn set_trace_io_truncate_size(&self, user: &AsynUser, size: usize) -> Result<(), AsynError> {
        self.user_port(user)?.set_trace_io_truncate_size(user, size);
        Ok(())
    }

    pub fn set_trace_file(&self, user: &AsynUser, sink: Option<Box<dyn std::io::Write + Send>>) -> Result<(), AsynError> {
        self.user_port(user)?.set_trace_file(user, sink);
        Ok(())
    }

    pub fn has_trace_file(&self, user: &AsynUser) -> Result<bool, AsynError> {
        Ok(self.user_port(user)?.has_trace_file(user))
    }

    pub fn trace_print(&self, user: &AsynUser, mask: TraceMask, message: &str) -> Result<(), AsynError> {
        self.user_port(user)?.trace_print(user, mask, message);
        Ok(())
    }

    pub fn trace_print_io(
        &self,
        user: &AsynUser,
        mask: TraceMask,
        message: &str,
        buffer: &[u8],
    ) -> Result<(), AsynError> {
        self.user_port(user)?.trace_print_io(user, mask, message, buffer);
        Ok(())
    }

    /// Run `f` with the process-wide trace output lock held, for embedders
    /// that want to interleave their own writes with `tracePrint`-style
    /// output atomically (`traceLock`/`traceUnlock`).
    pub fn trace_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.0.trace_lock.with_lock(f)
    }

    // -- reporting -------------------------------------------------------------

    /// A structured diagnostic dump of every registered port, its devices,
    /// and (at `details > 0`) its interfaces -- the Rust equivalent of
    /// `asynManager`'s `report(FILE*, details)`.
    pub fn report(&self, details: i32) -> String {
        let ports = self.0.ports.lock().unwrap();
        let mut out = String::new();
        for port in ports.values() {
            out.push_str(&port.report(details));
        }
        out
    }
}
