//! State common to a port and to each of its devices (`dpCommon` in the
//! original): enabled/connected/auto-connect flags, the interpose and
//! exception-subscriber lists, and the trace configuration. A port without
//! addressable devices uses one [`EndpointState`]; a multi-device port has
//! one for the port itself plus one per registered device address.

use std::time::Instant;

use crate::exception::ExceptionRegistry;
use crate::interface::InterfaceList;
use crate::trace::TraceState;

/// Request priority, in ascending urgency. `Connect` requests are always
/// drained first and in full by the port worker before any other priority
/// is serviced, matching `asynQueuePriorityConnect`'s special handling in
/// `portThread`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
    Connect,
}

impl Priority {
    /// All non-`Connect` priorities, highest first -- the order the worker
    /// scans them in.
    pub const SCHEDULED: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

/// Common device/port state, guarded by the owning port's lock.
pub struct EndpointState {
    pub enabled: bool,
    pub connected: bool,
    pub auto_connect: bool,
    /// The user currently holding this endpoint's multi-step exclusive lock,
    /// if any (`plockHolder`). Set by the port worker when it dequeues a
    /// request from a user whose `lock_count` is nonzero, cleared by
    /// `unlock` once that count returns to zero.
    pub lock_holder: Option<u64>,
    pub last_disconnect: Option<Instant>,
    pub number_connects: u64,
    pub interpose: InterfaceList,
    pub exceptions: ExceptionRegistry,
    pub trace: TraceState,
}

impl EndpointState {
    pub fn new(auto_connect: bool) -> Self {
        Self {
            enabled: true,
            connected: false,
            auto_connect,
            lock_holder: None,
            last_disconnect: None,
            number_connects: 0,
            interpose: InterfaceList::new(),
            exceptions: ExceptionRegistry::new(),
            trace: TraceState::new(),
        }
    }

    /// Whether `user_id` may be dequeued from this endpoint's queue right
    /// now: nobody holds the exclusive lock, or this user does.
    pub fn available_to(&self, user_id: u64) -> bool {
        self.enabled && (self.lock_holder.is_none() || self.lock_holder == Some(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_to_holder_and_nobody() {
        let mut ep = EndpointState::new(false);
        assert!(ep.available_to(1));
        ep.lock_holder = Some(1);
        assert!(ep.available_to(1));
        assert!(!ep.available_to(2));
    }

    #[test]
    fn disabled_endpoint_is_never_available() {
        let mut ep = EndpointState::new(false);
        ep.enabled = false;
        assert!(!ep.available_to(1));
    }
}
