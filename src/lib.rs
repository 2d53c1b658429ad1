//! flashlog — low-latency binary logging.
//!
//! # Overview
//!
//! Emitting a record on the hot path costs tens of nanoseconds: the
//! producing thread writes a compact binary entry (cycle timestamp,
//! format id, packed argument bytes) into its own lock-free staging ring
//! and returns. It never formats a string, never takes a lock, and never
//! touches a file. A single background drainer scans every ring,
//! delta-compresses the entries through a per-format compressor table,
//! and streams the batches to the log file through double-buffered
//! output. Rendering to text happens offline with [`LogDecoder`].
//!
//! # Key pieces
//!
//! - One [`StagingBuffer`] per producing thread, bound through
//!   thread-local storage on first emission
//! - A registry of live rings scanned round-robin by the drainer thread
//! - Per-format compressors dispatched by format id ([`CompressorTable`]),
//!   normally emitted by a build-time generator
//! - `sync` and shutdown barriers, asynchronous or synchronous file
//!   output, optional direct I/O with block-aligned batches
//!
//! # Usage
//!
//! ```no_run
//! let config = flashlog::Config {
//!     log_file: "/var/log/app.clog".into(),
//!     ..Default::default()
//! };
//! flashlog::init(config);
//!
//! // Hot path: format id 7 with eight packed argument bytes.
//! flashlog::log(7, 0, &42u64.to_le_bytes());
//!
//! flashlog::sync();
//! flashlog::print_stats();
//! flashlog::shutdown();
//! ```
//!
//! Per-thread emission order is preserved in the output; there is no
//! ordering guarantee across threads.

#![deny(missing_docs)]

mod clock;
pub mod codec;
mod drain;
mod runtime;
mod staging;

pub use clock::rdtsc;
pub use codec::decode::{ByteReader, DecodedEvent, LogDecoder};
pub use codec::{
    CompressFn, CompressorTable, DecompressFn, EntryView, VERBATIM_DECODE_TABLE, VERBATIM_TABLE,
};
pub use drain::StatsSnapshot;
pub use runtime::{Config, Error, Result, Runtime};
pub use staging::{EntryHeader, StagingBuffer};

use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use runtime::Inner;

/// The process-wide runtime.
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

thread_local! {
    static STAGING: RefCell<ThreadSlot> = RefCell::new(ThreadSlot {
        entries: Vec::new(),
    });
}

/// Per-thread staging bindings, one per runtime this thread has logged
/// through (normally one). Dropped at thread exit, which flags each
/// buffer for deallocation; the drainer destroys a flagged buffer only
/// after draining it, so the exiting thread never frees memory the
/// drainer might still read.
struct ThreadSlot {
    entries: Vec<(u64, Arc<StagingBuffer>)>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        for (_, sb) in &self.entries {
            sb.mark_deallocatable();
        }
    }
}

/// Run `f` with the calling thread's staging buffer for `inner`,
/// attaching one on first use.
pub(crate) fn with_staging<R>(inner: &Arc<Inner>, f: impl FnOnce(&StagingBuffer) -> R) -> R {
    STAGING.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some((_, sb)) = slot.entries.iter().find(|(id, _)| *id == inner.id) {
            return f(sb);
        }
        let sb = inner.registry.attach(inner.config.staging_buffer_size);
        slot.entries.push((inner.id, sb));
        let (_, sb) = slot.entries.last().expect("just pushed");
        f(sb)
    })
}

/// Install the process-wide runtime with `config`.
///
/// Configuration errors here are fatal: an unopenable log file panics
/// with a diagnostic, matching the expectation that logging must exist
/// before anything else runs. Use [`Runtime::start`] for the recoverable
/// form. When a runtime is already installed it is returned unchanged.
pub fn init(config: Config) -> &'static Runtime {
    RUNTIME.get_or_init(|| match Runtime::start(config) {
        Ok(runtime) => runtime,
        Err(e) => panic!(
            "flashlog could not open its log file; check permissions or \
             pass a different path in Config::log_file ({:?})",
            e
        ),
    })
}

/// The process-wide runtime, installed with `Config::default()` on first
/// use.
pub fn runtime() -> &'static Runtime {
    init(Config::default())
}

/// Emit one record on the process-wide runtime. See [`Runtime::log`].
#[inline]
pub fn log(fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) {
    runtime().log(fmt_id, arg_meta_bytes, args);
}

/// Non-blocking [`log`]; false when the calling thread's ring is full.
#[inline]
pub fn try_log(fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) -> bool {
    runtime().try_log(fmt_id, arg_meta_bytes, args)
}

/// [`log`] with an explicit timestamp. See [`Runtime::emit`].
#[inline]
pub fn emit(fmt_id: u32, timestamp: u64, arg_meta_bytes: u32, args: &[u8]) {
    runtime().emit(fmt_id, timestamp, arg_meta_bytes, args);
}

/// Create the calling thread's staging buffer ahead of its first record.
pub fn preallocate() {
    runtime().preallocate();
}

/// Block until every record committed before this call reaches the
/// kernel. See [`Runtime::sync`].
pub fn sync() {
    runtime().sync();
}

/// Switch the process-wide runtime's output file. See
/// [`Runtime::set_log_file`].
pub fn set_log_file<P: AsRef<Path>>(path: P) -> Result<()> {
    runtime().set_log_file(path)
}

/// Print the drainer's diagnostic digest to stdout.
pub fn print_stats() {
    runtime().print_stats();
}

/// Flush and stop the process-wide runtime's drainer.
///
/// Static teardown order is not otherwise controllable, so programs that
/// need their last records on disk call this before exiting.
pub fn shutdown() {
    if let Some(runtime) = RUNTIME.get() {
        runtime.shutdown();
    }
}
