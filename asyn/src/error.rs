use std::fmt;

/// Capacity of [`AsynUser`](crate::AsynUser)'s error-message buffer.
///
/// The original C implementation allocates this buffer inline with the user
/// handle and never reallocates it; messages longer than this are truncated.
pub const ERROR_MESSAGE_CAPACITY: usize = 160;

/// The three-valued outcome every fallible operation in this crate reports,
/// mirroring `asynStatus` in the system this crate implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation completed as requested.
    Success,
    /// The operation did not complete before its deadline.
    Timeout,
    /// The operation failed; see the accompanying message.
    Error,
}

/// The outcome of [`Manager::cancel_request`](crate::Manager::cancel_request).
///
/// Kept distinct from [`Status`] because the original overloads a bare `int`
/// for two different binary questions ("was anything queued" vs.
/// "did this succeed") depending on call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelOutcome {
    /// The user was not queued; nothing was cancelled.
    NotQueued,
    /// A pending entry was found and removed.
    Cancelled,
}

/// An error returned by a fallible manager or trace operation.
///
/// Carries the same bounded, truncate-don't-reallocate message buffer that
/// the original stores on the user handle, so that `AsynUser::error_message`
/// and this error's [`Display`](fmt::Display) impl always agree.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AsynError {
    message: ErrorBuffer,
    status: Status,
}

impl AsynError {
    pub(crate) fn new(status: Status, message: impl AsRef<str>) -> Self {
        Self {
            message: ErrorBuffer::from_str(message.as_ref()),
            status,
        }
    }

    pub(crate) fn misuse(message: impl AsRef<str>) -> Self {
        Self::new(Status::Error, message)
    }

    /// The tri-valued status this error represents (always [`Status::Error`]
    /// or [`Status::Timeout`]).
    pub fn status(&self) -> Status {
        self.status
    }

    /// The truncated human-readable reason for the failure.
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// A fixed-capacity, truncate-rather-than-reallocate error message buffer.
///
/// Every [`AsynUser`](crate::AsynUser) owns one of these; non-success
/// returns populate it with a short reason instead of allocating.
#[derive(Clone)]
pub(crate) struct ErrorBuffer {
    buf: [u8; ERROR_MESSAGE_CAPACITY],
    len: usize,
}

impl ErrorBuffer {
    pub(crate) const fn empty() -> Self {
        Self {
            buf: [0u8; ERROR_MESSAGE_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn from_str(message: &str) -> Self {
        let mut buf = Self::empty();
        buf.set(message);
        buf
    }

    pub(crate) fn set(&mut self, message: &str) {
        let mut end = message.len().min(ERROR_MESSAGE_CAPACITY);
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        self.buf[..end].copy_from_slice(&message.as_bytes()[..end]);
        self.len = end;
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn as_str(&self) -> &str {
        // SAFETY: `set` only ever writes at a valid UTF-8 boundary taken from
        // a `&str`, so `buf[..len]` is always valid UTF-8.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl fmt::Debug for ErrorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorBuffer").field(&self.as_str()).finish()
    }
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::empty()
    }
}
