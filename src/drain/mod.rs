//! Background draining of staging buffers.
//!
//! A single drainer thread round-robins over the registry, compresses
//! committed entries into an aligned scratch buffer, and emits each batch
//! through the double-buffered output. This module holds the counters the
//! drainer maintains; the loop itself lives in `worker` and the output
//! path in `output`.

pub(crate) mod output;
pub(crate) mod worker;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock;

/// Counters the drainer updates as it runs. All accesses are relaxed;
/// the digest is diagnostic, not a synchronization point.
#[derive(Default)]
pub(crate) struct Counters {
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub pad_bytes_written: AtomicU64,
    pub events_processed: AtomicU64,
    pub writes_completed: AtomicU64,
    pub cycles_awake: AtomicU64,
    pub cycles_compressing: AtomicU64,
    pub cycles_scanning: AtomicU64,
    pub cycles_output: AtomicU64,
    pub cycle_at_thread_start: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> StatsSnapshot {
        let started = self.cycle_at_thread_start.load(Ordering::Relaxed);
        let seconds_alive = if started == 0 {
            0.0
        } else {
            clock::to_seconds(clock::rdtsc().wrapping_sub(started))
        };
        StatsSnapshot {
            total_bytes_read: self.total_bytes_read.load(Ordering::Relaxed),
            total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
            pad_bytes_written: self.pad_bytes_written.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            seconds_awake: clock::to_seconds(self.cycles_awake.load(Ordering::Relaxed)),
            seconds_compressing: clock::to_seconds(
                self.cycles_compressing.load(Ordering::Relaxed),
            ),
            seconds_scanning: clock::to_seconds(self.cycles_scanning.load(Ordering::Relaxed)),
            seconds_in_output: clock::to_seconds(self.cycles_output.load(Ordering::Relaxed)),
            seconds_alive,
        }
    }
}

/// Point-in-time copy of the drainer's counters, in convertible units.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    /// Uncompressed bytes consumed out of staging buffers.
    pub total_bytes_read: u64,
    /// Compressed bytes handed to the kernel, padding included.
    pub total_bytes_written: u64,
    /// Zero bytes appended for direct-I/O block alignment.
    pub pad_bytes_written: u64,
    /// Entries compressed into the output stream.
    pub events_processed: u64,
    /// Completed batch writes.
    pub writes_completed: u64,
    /// Time the drainer spent out of its idle wait.
    pub seconds_awake: f64,
    /// Time spent inside per-entry compression.
    pub seconds_compressing: f64,
    /// Time spent scanning staging buffers, compression included.
    pub seconds_scanning: f64,
    /// Time spent submitting, reaping, and syncing output.
    pub seconds_in_output: f64,
    /// Wall time since the drainer thread started.
    pub seconds_alive: f64,
}

/// Print the human-readable digest of a snapshot to stdout.
pub(crate) fn print_digest(s: &StatsSnapshot) {
    let mb = |bytes: u64| bytes as f64 / 1.0e6;
    let work_seconds = s.seconds_compressing + s.seconds_in_output;

    println!(
        "flashlog: wrote {} events ({:.2} MB) in {:.3} s of work ({:.3} s compressing)",
        s.events_processed,
        mb(s.total_bytes_written),
        work_seconds,
        s.seconds_compressing,
    );
    println!(
        "flashlog: {} batch writes, {} pad bytes",
        s.writes_completed, s.pad_bytes_written,
    );
    if s.seconds_alive > 0.0 {
        println!(
            "flashlog: drainer awake {:.3} of {:.3} s ({:.1}%), {:.3} s scanning",
            s.seconds_awake,
            s.seconds_alive,
            100.0 * s.seconds_awake / s.seconds_alive,
            s.seconds_scanning,
        );
    }
    if s.events_processed > 0 && work_seconds > 0.0 {
        println!(
            "flashlog: {:.1} bytes/event, {:.2} ns/event",
            s.total_bytes_written as f64 / s.events_processed as f64,
            work_seconds * 1.0e9 / s.events_processed as f64,
        );
    }
    if s.total_bytes_written > 0 {
        println!(
            "flashlog: compression ratio {:.2}x ({} bytes in, {} bytes out)",
            s.total_bytes_read as f64 / s.total_bytes_written as f64,
            s.total_bytes_read,
            s.total_bytes_written,
        );
    }
}
