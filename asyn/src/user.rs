//! The user handle (`asynUser`/`userPvt` in the original): the caller's
//! request callback, its bounded error-message buffer, and the scheduling
//! state a port worker needs while the user is connected to one of its
//! endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ErrorBuffer;
use crate::port::Port;
use crate::timer::TimerToken;

static NEXT_USER_ID: AtomicU64 = AtomicU64::new(1);

/// A caller-supplied handler invoked when a queued request reaches the
/// front of its port's queue (`queueCallback`) and, optionally, when it
/// times out before that happens (`timeoutCallback`).
///
/// Both methods run on the port's worker thread (or, for a timeout, on the
/// shared timer thread) with no lock held -- they are free to call back
/// into the [`Manager`](crate::Manager) with this same [`AsynUser`].
pub trait RequestHandler: Send + Sync {
    fn on_queue(&self, user: &AsynUser);

    /// Called when a request queued with a nonzero timeout is still queued
    /// when the timeout fires. The default does nothing, matching
    /// `queueRequest`'s behavior for a user with no `timeoutCallback`.
    fn on_timeout(&self, _user: &AsynUser) {}
}

/// A caller-supplied callback invoked in response to a connection,
/// enable, auto-connect, or trace-mask exception. See
/// [`crate::exception::ExceptionKind`].
pub type ExceptionCallback = Arc<dyn Fn(&AsynUser, crate::exception::ExceptionKind) + Send + Sync>;

/// Scheduling bookkeeping for a user currently connected to a port,
/// guarded by that port's lock (never its own) -- this is the inner half
/// of the fixed-order nested lock discipline described on [`Port`].
pub(crate) struct UserSched {
    pub port: Option<Port>,
    pub device_addr: Option<i32>,
    pub is_queued: bool,
    pub lock_count: u32,
    pub timeout: Duration,
    pub timer_token: Option<TimerToken>,
    pub has_exception_subscription: bool,
}

impl UserSched {
    fn new() -> Self {
        Self {
            port: None,
            device_addr: None,
            is_queued: false,
            lock_count: 0,
            timeout: Duration::ZERO,
            timer_token: None,
            has_exception_subscription: false,
        }
    }
}

struct UserInner {
    id: u64,
    handler: Arc<dyn RequestHandler>,
    error: Mutex<ErrorBuffer>,
    pub(crate) sched: Mutex<UserSched>,
}

/// A handle through which a caller queues requests against a connected
/// port or device. Cheap to clone; clones refer to the same underlying
/// user (same id, same error buffer, same scheduling state).
#[derive(Clone)]
pub struct AsynUser(Arc<UserInner>);

impl AsynUser {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        let id = NEXT_USER_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(id, handler)
    }

    pub(crate) fn with_id(id: u64, handler: Arc<dyn RequestHandler>) -> Self {
        Self(Arc::new(UserInner {
            id,
            handler,
            error: Mutex::new(ErrorBuffer::empty()),
            sched: Mutex::new(UserSched::new()),
        }))
    }

    /// A stable identity for this user, unique for the process lifetime.
    /// Used to recognize "this is the lock holder" / "this subscriber" by
    /// value rather than by pointer.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn handler(&self) -> &Arc<dyn RequestHandler> {
        &self.0.handler
    }

    pub fn set_error(&self, message: impl AsRef<str>) {
        self.0.error.lock().unwrap().set(message.as_ref());
    }

    pub fn clear_error(&self) {
        self.0.error.lock().unwrap().clear();
    }

    /// The current contents of this user's error-message buffer.
    pub fn error_message(&self) -> String {
        self.0.error.lock().unwrap().as_str().to_string()
    }

    pub(crate) fn sched(&self) -> &Mutex<UserSched> {
        &self.0.sched
    }

    /// Whether this user currently appears in exactly one port's priority
    /// queue (`isQueued`). Exposed for introspection/testing; ordinary
    /// callers don't need to poll it, since [`queue_request`](crate::Manager::queue_request)
    /// and the handler invocation already enforce the invariant.
    pub fn is_queued(&self) -> bool {
        self.0.sched.lock().unwrap().is_queued
    }

    /// This user's current exclusive-lock nesting count (`lockCount`).
    pub fn lock_count(&self) -> u32 {
        self.0.sched.lock().unwrap().lock_count
    }

    pub(crate) fn ptr_eq(&self, other: &AsynUser) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for AsynUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsynUser").field("id", &self.0.id).finish()
    }
}

impl PartialEq for AsynUser {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for AsynUser {}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    struct NoopHandler;
    impl RequestHandler for NoopHandler {
        fn on_queue(&self, _user: &AsynUser) {}
    }

    pub(crate) fn test_user(id: u64) -> AsynUser {
        AsynUser::with_id(id, Arc::new(NoopHandler))
    }
}
