//! Per-endpoint, mask-filtered diagnostic output.
//!
//! Output is serialized through a single process-wide (really: per-[`Manager`](crate::Manager))
//! mutex so interleaved `tracePrint`-style calls from different port workers
//! never interleave mid-line, matching the original `asynTrace` contract.

use std::fmt;
use std::io::Write;
use std::sync::Mutex;

bitflags::bitflags! {
    /// Which categories of trace line are enabled for an endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceMask: u32 {
        /// Error conditions.
        const ERROR     = 0x0001;
        /// Device-level I/O (the bytes that cross the wire).
        const IO_DEVICE = 0x0002;
        /// Interposed-filter-level I/O.
        const IO_FILTER = 0x0004;
        /// Low-level driver I/O.
        const IO_DRIVER = 0x0008;
        /// Control-flow tracing (queueing, locking, connection changes).
        const FLOW      = 0x0010;
    }
}

impl Default for TraceMask {
    fn default() -> Self {
        TraceMask::ERROR
    }
}

bitflags::bitflags! {
    /// How an I/O buffer dump accompanying a trace line should be rendered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceIoMask: u32 {
        /// Render printable bytes as-is, clipped to the truncate size.
        const ASCII  = 0x0001;
        /// Render with C-style backslash escapes.
        const ESCAPE = 0x0002;
        /// Render as a hex dump wrapped every 20 bytes.
        const HEX    = 0x0004;
    }
}

/// Default number of bytes of an I/O buffer dump shown per `tracePrintIO` call.
pub const DEFAULT_TRACE_TRUNCATE_SIZE: usize = 80;

/// Per-endpoint trace configuration: the mask, the IO-dump mask, the
/// truncate size, and an optional alternate sink.
///
/// Lives embedded in each endpoint's [`EndpointState`](crate::endpoint::EndpointState);
/// the sink and formatting calls go through the [`Manager`](crate::Manager)'s
/// shared [`TraceLock`] so two endpoints never interleave output.
pub struct TraceState {
    pub mask: TraceMask,
    pub io_mask: TraceIoMask,
    pub truncate_size: usize,
    pub sink: Option<Box<dyn Write + Send>>,
}

impl TraceState {
    pub fn new() -> Self {
        Self {
            mask: TraceMask::default(),
            io_mask: TraceIoMask::empty(),
            truncate_size: DEFAULT_TRACE_TRUNCATE_SIZE,
            sink: None,
        }
    }
}

impl Default for TraceState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceState")
            .field("mask", &self.mask)
            .field("io_mask", &self.io_mask)
            .field("truncate_size", &self.truncate_size)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// The process-wide (per-[`Manager`]) trace serialization lock.
///
/// A plain `Mutex<()>` rather than a `Mutex<Stdout>` because the sink lives
/// per-endpoint (`setTraceFile` installs it there, not globally); this lock
/// only needs to guarantee that two `tracePrint`/`tracePrintIO` calls don't
/// interleave their writes.
#[derive(Default)]
pub struct TraceLock(Mutex<()>);

impl TraceLock {
    pub fn new() -> Self {
        Self(Mutex::new(()))
    }

    /// Run `f` with the global trace output serialized against concurrent
    /// trace calls from other ports.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

/// Write `buffer` to `sink` as an I/O dump per `io_mask`, clipped to
/// `truncate_size` bytes: ASCII (clipped), C-escaped, and/or a hex dump
/// wrapped every 20 bytes, in that order, matching `asynManager.c`'s
/// `tracePrintIO`.
pub fn write_io_dump(
    sink: &mut dyn Write,
    io_mask: TraceIoMask,
    truncate_size: usize,
    buffer: &[u8],
) -> std::io::Result<()> {
    let n = buffer.len().min(truncate_size);
    let clipped = &buffer[..n];

    if io_mask.contains(TraceIoMask::ASCII) && n > 0 {
        writeln!(sink, "{}", String::from_utf8_lossy(clipped))?;
    }
    if io_mask.contains(TraceIoMask::ESCAPE) {
        if n > 0 {
            write_escaped(sink, clipped)?;
        }
        writeln!(sink)?;
    }
    if io_mask.contains(TraceIoMask::HEX) && truncate_size > 0 {
        for (i, byte) in clipped.iter().enumerate() {
            if i % 20 == 0 {
                writeln!(sink)?;
            }
            write!(sink, "{:02x} ", byte)?;
        }
        writeln!(sink)?;
    }
    Ok(())
}

fn write_escaped(sink: &mut dyn Write, bytes: &[u8]) -> std::io::Result<()> {
    for &b in bytes {
        match b {
            b'\\' => write!(sink, "\\\\")?,
            b'\n' => write!(sink, "\\n")?,
            b'\r' => write!(sink, "\\r")?,
            b'\t' => write!(sink, "\\t")?,
            0x20..=0x7e => write!(sink, "{}", b as char)?,
            _ => write!(sink, "\\{:03o}", b)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_dump_clips_to_truncate_size() {
        let mut out = Vec::new();
        write_io_dump(&mut out, TraceIoMask::ASCII, 3, b"hello").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "hel\n");
    }

    #[test]
    fn hex_dump_wraps_every_20_bytes() {
        let mut out = Vec::new();
        let data = vec![0xabu8; 25];
        write_io_dump(&mut out, TraceIoMask::HEX, 25, &data).unwrap();
        let text = String::from_utf8(out).unwrap();
        // one newline at byte 0, one at byte 20, one trailing.
        assert_eq!(text.matches('\n').count(), 3);
    }

    #[test]
    fn escape_dump_renders_control_bytes() {
        let mut out = Vec::new();
        write_io_dump(&mut out, TraceIoMask::ESCAPE, 10, b"a\nb").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a\\nb\n");
    }
}
