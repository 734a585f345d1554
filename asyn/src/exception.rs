//! Exception subscription and fan-out, shared by every endpoint (a port or
//! one of its devices).
//!
//! `exceptionOccurred` in the original runs in three phases under the port
//! lock's protection without holding it the whole time: mark the endpoint
//! "exception active" (locked), call every subscriber's callback in
//! registration order with no lock held at all (so a callback is free to
//! call back into the manager without deadlocking), then re-lock to clear
//! the active flag and release anyone who was waiting to add or remove a
//! subscription while it was active. [`ExceptionRegistry`] holds the data
//! for all three phases; the caller in `port.rs` supplies the lock/condvar
//! and drives the phase transitions, since it alone owns the port mutex.

use std::sync::Arc;

use crate::user::AsynUser;

/// The four conditions the original fans out to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// The endpoint connected or disconnected.
    Connect,
    /// The endpoint was enabled or disabled.
    Enable,
    /// The endpoint's auto-connect setting changed.
    AutoConnect,
    /// The endpoint's trace mask changed.
    TraceMask,
}

/// A subscriber registered via `exceptionCallbackAdd`.
///
/// The original allows at most one subscription per [`AsynUser`]; `port.rs`
/// enforces that by checking [`AsynUser::id`] before inserting.
pub struct Subscriber {
    pub user: AsynUser,
    pub callback: Arc<dyn Fn(&AsynUser, ExceptionKind) + Send + Sync>,
}

/// Per-endpoint exception state: the subscriber list and the "an
/// `exceptionOccurred` fan-out is in progress" flag that
/// `exceptionCallbackAdd`/`Remove` must wait out before mutating the list.
#[derive(Default)]
pub struct ExceptionRegistry {
    subscribers: Vec<Subscriber>,
    active: bool,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Insert `subscriber`, replacing nothing -- the caller has already
    /// confirmed this user has no existing subscription and that
    /// `is_active()` is false.
    pub fn add(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    /// Remove the subscription belonging to `user_id`, returning whether one
    /// was found.
    pub fn remove(&mut self, user_id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.user.id() != user_id);
        self.subscribers.len() != before
    }

    pub fn has_subscriber(&self, user_id: u64) -> bool {
        self.subscribers.iter().any(|s| s.user.id() == user_id)
    }

    /// Phase 1: mark a fan-out in progress. Call with the endpoint lock held.
    pub fn begin(&mut self) {
        self.active = true;
    }

    /// Phase 2: the list of callbacks to invoke, snapshotted so the caller
    /// can release the endpoint lock before calling them -- matching the
    /// original's unlocked `ellFirst`/`ellNext` walk.
    pub fn subscribers_snapshot(&self) -> Vec<(AsynUser, Arc<dyn Fn(&AsynUser, ExceptionKind) + Send + Sync>)> {
        self.subscribers
            .iter()
            .map(|s| (s.user.clone(), s.callback.clone()))
            .collect()
    }

    /// Phase 3: clear the in-progress flag. Call with the endpoint lock
    /// re-acquired; the caller is then responsible for waking any thread
    /// parked in `add`/`remove`'s wait-while-active loop.
    pub fn end(&mut self) {
        self.active = false;
    }
}
