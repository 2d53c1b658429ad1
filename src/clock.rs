//! Cycle-counter timestamps.
//!
//! Producers stamp every record with the raw CPU cycle counter so the hot
//! path never pays for a clock syscall. Converting cycles to seconds is
//! only needed by the stats digest and is calibrated lazily against the
//! OS monotonic clock.

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::_rdtsc;

/// Read the CPU cycle counter. Monotonic per core on modern hardware,
/// which is all the log format requires (per-thread monotonicity).
#[inline(always)]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _rdtsc()
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let value: u64;
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) value);
        value
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

/// Counter frequency, measured once over a short spin.
static CYCLES_PER_SEC: Lazy<f64> = Lazy::new(|| {
    let started = Instant::now();
    let first = rdtsc();
    while started.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(first);
    cycles as f64 / started.elapsed().as_secs_f64()
});

/// Convert a cycle delta to seconds. Not for the hot path; the first call
/// blocks for the calibration interval.
pub fn to_seconds(cycles: u64) -> f64 {
    cycles as f64 / *CYCLES_PER_SEC
}
