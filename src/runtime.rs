//! Runtime service: configuration, the drainer lifecycle, and the control
//! operations (`sync`, log-file switching, shutdown).

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock;
use crate::codec::{CompressorTable, VERBATIM_TABLE};
use crate::drain::output::{open_log_file, OutputFile, BLOCK_SIZE};
use crate::drain::{self, worker, Counters, StatsSnapshot};
use crate::staging::registry::Registry;
use crate::staging::EntryHeader;

/// Errors surfaced by the runtime's control operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O failure outside of log-file handling.
    Io(io::Error),
    /// The requested log file could not be opened.
    LogFileAccess {
        /// The path that was refused.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Tuning knobs for a runtime. `Default` matches the production setup.
#[derive(Clone)]
pub struct Config {
    /// Capacity in bytes of each per-thread staging ring.
    pub staging_buffer_size: usize,
    /// Capacity in bytes of each of the two output scratch buffers; also
    /// the upper bound on one record's worst-case compressed size.
    pub output_buffer_size: usize,
    /// Write batches through the background writer thread instead of
    /// blocking the drainer on the write syscall.
    pub use_aio: bool,
    /// Open the log file with `O_DIRECT` and pad every batch to the block
    /// size. Requires a file system that supports direct I/O.
    pub direct_io: bool,
    /// Where compressed batches are appended.
    pub log_file: PathBuf,
    /// How long the drainer naps when every staging buffer is empty.
    pub poll_interval: Duration,
    /// Per-format compressor table produced by the build-time generator.
    pub table: CompressorTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staging_buffer_size: 8 * 1024 * 1024,
            output_buffer_size: 1024 * 1024,
            use_aio: true,
            direct_io: false,
            log_file: std::env::temp_dir().join("flashlog.clog"),
            poll_interval: Duration::from_micros(1),
            table: &VERBATIM_TABLE,
        }
    }
}

impl Config {
    /// Panics on configurations the drainer cannot operate with.
    pub fn validate(&self) {
        assert!(
            self.staging_buffer_size >= 4096,
            "staging_buffer_size must be at least 4 KiB"
        );
        assert!(
            self.output_buffer_size >= 4096 && self.output_buffer_size % BLOCK_SIZE == 0,
            "output_buffer_size must be a multiple of {} and at least 4 KiB",
            BLOCK_SIZE
        );
        assert!(!self.table.is_empty(), "compressor table is empty");
    }
}

/// Condition-protected flags shared with the drainer.
pub(crate) struct SyncState {
    pub sync_requested: bool,
}

/// State shared between the runtime handle, its producer threads, and the
/// drainer thread.
pub(crate) struct Inner {
    pub id: u64,
    pub config: Config,
    pub registry: Registry,
    pub counters: Counters,
    pub should_exit: AtomicBool,
    pub cond: Mutex<SyncState>,
    pub work_added: Condvar,
    pub queue_emptied: Condvar,
    /// Parked between drainer runs; taken by the running drainer.
    pub output: Mutex<Option<OutputFile>>,
    /// The open descriptor, shared so `print_stats` can flush it.
    pub file: Mutex<Arc<File>>,
    /// Delta baselines carried across drainer restarts on the same file.
    pub baselines: Mutex<(u64, u32)>,
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(0);

/// Handle to a running flashlog instance.
///
/// Most programs use the process-wide instance through [`crate::init`];
/// explicit instances exist so embedders and tests control configuration
/// and teardown ordering. Dropping the handle flushes and stops the
/// drainer.
pub struct Runtime {
    inner: Arc<Inner>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Open the log file and launch the drainer.
    pub fn start(config: Config) -> Result<Runtime> {
        config.validate();
        let file = open_log_file(&config.log_file, config.direct_io).map_err(|source| {
            Error::LogFileAccess {
                path: config.log_file.clone(),
                source,
            }
        })?;
        let file = Arc::new(file);
        let output = OutputFile::new(
            file.clone(),
            config.output_buffer_size,
            config.use_aio,
            config.direct_io,
        );

        let runtime = Runtime {
            inner: Arc::new(Inner {
                id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
                registry: Registry::new(),
                counters: Counters::default(),
                should_exit: AtomicBool::new(false),
                cond: Mutex::new(SyncState {
                    sync_requested: false,
                }),
                work_added: Condvar::new(),
                queue_emptied: Condvar::new(),
                output: Mutex::new(Some(output)),
                file: Mutex::new(file),
                baselines: Mutex::new((0, 0)),
                config,
            }),
            drainer: Mutex::new(None),
        };
        runtime.start_drainer();
        Ok(runtime)
    }

    /// Bind the calling thread's staging buffer ahead of its first log
    /// call, so the first emission does not pay the allocation.
    pub fn preallocate(&self) {
        crate::with_staging(&self.inner, |_| {});
    }

    /// Emit one record stamped with the current cycle counter.
    ///
    /// `args` are the packed argument bytes the format's compressor
    /// expects and `arg_meta_bytes` its declared descriptor slack. Blocks
    /// only when the calling thread's staging ring is full.
    #[inline]
    pub fn log(&self, fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) {
        self.emit(fmt_id, clock::rdtsc(), arg_meta_bytes, args);
    }

    /// [`log`](Self::log) with an explicit timestamp.
    #[inline]
    pub fn emit(&self, fmt_id: u32, timestamp: u64, arg_meta_bytes: u32, args: &[u8]) {
        let header = self.entry_header(fmt_id, timestamp, arg_meta_bytes, args);
        crate::with_staging(&self.inner, |sb| {
            let total = header.entry_size as usize;
            let dst = sb.reserve(total);
            unsafe {
                header.write(dst);
                std::ptr::copy_nonoverlapping(
                    args.as_ptr(),
                    dst.add(EntryHeader::SIZE),
                    args.len(),
                );
            }
            sb.commit(total);
        });
    }

    /// Non-blocking [`log`](Self::log): false when the staging ring is
    /// full, leaving the record policy to the caller.
    #[inline]
    pub fn try_log(&self, fmt_id: u32, arg_meta_bytes: u32, args: &[u8]) -> bool {
        let header = self.entry_header(fmt_id, clock::rdtsc(), arg_meta_bytes, args);
        crate::with_staging(&self.inner, |sb| {
            let total = header.entry_size as usize;
            let dst = match sb.try_reserve(total) {
                Some(dst) => dst,
                None => return false,
            };
            unsafe {
                header.write(dst);
                std::ptr::copy_nonoverlapping(
                    args.as_ptr(),
                    dst.add(EntryHeader::SIZE),
                    args.len(),
                );
            }
            sb.commit(total);
            true
        })
    }

    #[inline]
    fn entry_header(
        &self,
        fmt_id: u32,
        timestamp: u64,
        arg_meta_bytes: u32,
        args: &[u8],
    ) -> EntryHeader {
        assert!(
            (fmt_id as usize) < self.inner.config.table.len(),
            "format id {} out of range for the compressor table",
            fmt_id
        );
        let total = EntryHeader::SIZE + args.len();
        debug_assert!(
            total + arg_meta_bytes as usize <= self.inner.config.output_buffer_size,
            "record's worst case exceeds the output buffer"
        );
        EntryHeader {
            fmt_id,
            entry_size: total as u32,
            arg_meta_bytes,
            timestamp,
        }
    }

    /// Block until every record committed before this call has been
    /// handed to the kernel.
    ///
    /// Like a non-quiescent checkpoint: records committed concurrently
    /// with or after the call may be persisted too. Must not be called
    /// while the drainer is stopped.
    pub fn sync(&self) {
        let mut state = self.inner.cond.lock();
        state.sync_requested = true;
        self.inner.work_added.notify_all();
        self.inner.queue_emptied.wait(&mut state);
    }

    /// Switch the compressed output to `path`.
    ///
    /// The new file is opened first (on failure the runtime is left
    /// untouched), then buffered records are flushed to the old file, the
    /// drainer is stopped, the descriptor swapped, and the drainer
    /// restarted. Not safe to race with concurrent producers; switch
    /// before the first emission during normal operation.
    pub fn set_log_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file =
            open_log_file(path, self.inner.config.direct_io).map_err(|source| {
                Error::LogFileAccess {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        let file = Arc::new(file);

        // Everything staged so far belongs to the old file.
        self.sync();
        self.stop_drainer();

        let output = OutputFile::new(
            file.clone(),
            self.inner.config.output_buffer_size,
            self.inner.config.use_aio,
            self.inner.config.direct_io,
        );
        // Dropping the previous OutputFile joins its writer thread and
        // closes the old descriptor.
        *self.inner.output.lock() = Some(output);
        *self.inner.file.lock() = file;
        *self.inner.baselines.lock() = (0, 0);

        self.start_drainer();
        Ok(())
    }

    /// Stop and join the drainer without flushing first. Records emitted
    /// while stopped accumulate in their staging rings until
    /// [`start_drainer`](Self::start_drainer); `sync` must not be called
    /// in between.
    pub fn stop_drainer(&self) {
        let handle = self.drainer.lock().take();
        if let Some(handle) = handle {
            {
                let _state = self.inner.cond.lock();
                self.inner.should_exit.store(true, Ordering::Release);
                self.inner.work_added.notify_all();
            }
            let _ = handle.join();
        }
    }

    /// (Re)launch the drainer thread. No-op while one is running.
    pub fn start_drainer(&self) {
        let mut slot = self.drainer.lock();
        if slot.is_some() {
            return;
        }
        self.inner.should_exit.store(false, Ordering::Release);
        let output = self
            .inner
            .output
            .lock()
            .take()
            .expect("output file missing");
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("flashlog-drain".into())
            .spawn(move || worker::drain_loop(inner, output))
            .expect("failed to spawn flashlog drain thread");
        *slot = Some(handle);
    }

    /// Flush everything staged so far, then stop the drainer for good.
    /// Records logged afterwards stay in their staging rings.
    pub fn shutdown(&self) {
        if self.drainer.lock().is_none() {
            return;
        }
        self.sync();
        self.stop_drainer();
    }

    /// Current drainer counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.counters.snapshot()
    }

    /// Print a diagnostic digest to stdout. Flushes file data first so
    /// output time is accounted; not for the hot path.
    pub fn print_stats(&self) {
        let start = clock::rdtsc();
        let file = self.inner.file.lock().clone();
        if let Err(e) = file.sync_data() {
            eprintln!("flashlog: fdatasync of the log file failed: {}", e);
        }
        self.inner
            .counters
            .cycles_output
            .fetch_add(clock::rdtsc().wrapping_sub(start), Ordering::Relaxed);
        drain::print_digest(&self.stats());
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
