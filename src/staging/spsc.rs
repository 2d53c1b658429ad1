//! Lock-free SPSC staging ring.
//!
//! One producer thread reserves and commits contiguous byte spans; the
//! single drainer peeks and consumes them. The fast path of a reservation
//! touches only producer-local state: `min_free_space` caches how many
//! bytes the producer may write before it must look at `consumer_pos`
//! again, so the cache line shared with the drainer is read rarely.
//!
//! Position discipline:
//!
//! - `producer_pos == consumer_pos` always means the ring is empty, so at
//!   most `capacity - 1` bytes are ever in flight and no full/empty flag
//!   is needed.
//! - No entry straddles the wrap point. When the tail run is too small the
//!   producer publishes the end of valid data in `end_of_recorded` and
//!   restarts at offset 0; the consumer skips the tail slack the same way.
//! - `producer_pos` and `consumer_pos` live on separate cache lines;
//!   commits release-store `producer_pos` and the consumer acquire-loads
//!   it (and symmetrically for `consumer_pos`), which is what makes the
//!   committed bytes visible before the position advance is.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Fixed-capacity SPSC byte ring staging uncompressed log records for the
/// drainer.
pub struct StagingBuffer {
    /// Next write offset. Producer-written (release), consumer-read
    /// (acquire).
    producer_pos: CachePadded<AtomicUsize>,

    /// Producer-private cache of writable bytes remaining before
    /// `consumer_pos` must be re-read.
    min_free_space: Cell<usize>,

    /// Upper bound of valid data once the producer has wrapped. Published
    /// with release before `producer_pos` wraps so the consumer can never
    /// observe the wrapped position without it.
    end_of_recorded: AtomicUsize,

    /// Set by the owning thread's exit guard; the drainer frees the
    /// buffer once the ring is also empty.
    should_deallocate: AtomicBool,

    /// Next read offset. Consumer-written (release), producer-read
    /// (acquire).
    consumer_pos: CachePadded<AtomicUsize>,

    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,
}

// The raw storage is only ever written through a producer reservation and
// read by the single consumer behind the release/acquire position
// protocol above.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    /// Allocate a ring of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= crate::staging::EntryHeader::SIZE * 2,
            "staging buffer too small to hold a record"
        );
        let storage: Box<[UnsafeCell<u8>]> =
            (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            producer_pos: CachePadded::new(AtomicUsize::new(0)),
            min_free_space: Cell::new(capacity),
            end_of_recorded: AtomicUsize::new(0),
            should_deallocate: AtomicBool::new(false),
            consumer_pos: CachePadded::new(AtomicUsize::new(0)),
            storage,
            capacity,
        }
    }

    /// Ring capacity in bytes; at most `capacity - 1` are usable at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.storage.as_ptr() as *mut u8
    }

    /// Reserve `nbytes` contiguous writable bytes, spinning until the
    /// drainer frees enough space.
    ///
    /// Must only be called from the owning producer thread, and `nbytes`
    /// must be smaller than the capacity. The returned span becomes
    /// visible to the drainer only after [`commit`](Self::commit).
    #[inline]
    pub fn reserve(&self, nbytes: usize) -> *mut u8 {
        assert!(nbytes < self.capacity, "record larger than staging buffer");
        if self.min_free_space.get() > nbytes {
            let pp = self.producer_pos.load(Ordering::Relaxed);
            return unsafe { self.base_ptr().add(pp) };
        }
        match self.reserve_slow(nbytes, true) {
            Some(ptr) => ptr,
            // Unreachable: the blocking slow path only returns with space.
            None => unreachable!("blocking reserve returned without space"),
        }
    }

    /// Non-blocking [`reserve`](Self::reserve): `None` when the span is
    /// not currently available.
    #[inline]
    pub fn try_reserve(&self, nbytes: usize) -> Option<*mut u8> {
        assert!(nbytes < self.capacity, "record larger than staging buffer");
        if self.min_free_space.get() > nbytes {
            let pp = self.producer_pos.load(Ordering::Relaxed);
            return Some(unsafe { self.base_ptr().add(pp) });
        }
        self.reserve_slow(nbytes, false)
    }

    /// Slow path: re-read `consumer_pos` (shared cache line) and wrap the
    /// producer if the tail run cannot hold the request.
    #[cold]
    fn reserve_slow(&self, nbytes: usize, blocking: bool) -> Option<*mut u8> {
        // All space checks are strict: filling the ring to the point where
        // the positions meet would make it indistinguishable from empty.
        loop {
            let cached_cp = self.consumer_pos.load(Ordering::Acquire);
            let pp = self.producer_pos.load(Ordering::Relaxed);

            if cached_cp <= pp {
                // Free run is the tail of the buffer.
                let tail = self.capacity - pp;
                if tail > nbytes {
                    self.min_free_space.set(tail);
                    return Some(unsafe { self.base_ptr().add(pp) });
                }

                // The record must start at offset 0. Wrapping while the
                // consumer still sits at 0 would land producer_pos on
                // consumer_pos with data in the ring, and equality must
                // keep meaning empty, so the wrap waits for the consumer
                // to move first.
                if cached_cp != 0 {
                    self.end_of_recorded.store(pp, Ordering::Release);
                    self.producer_pos.store(0, Ordering::Release);
                    self.min_free_space.set(cached_cp);
                    if cached_cp > nbytes {
                        return Some(self.base_ptr());
                    }
                } else {
                    self.min_free_space.set(0);
                }
            } else {
                let free = cached_cp - pp;
                self.min_free_space.set(free);
                if free > nbytes {
                    return Some(unsafe { self.base_ptr().add(pp) });
                }
            }

            if !blocking {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Publish exactly `nbytes` previously reserved bytes to the drainer.
    #[inline]
    pub fn commit(&self, nbytes: usize) {
        debug_assert!(self.min_free_space.get() > nbytes);
        let pp = self.producer_pos.load(Ordering::Relaxed);
        self.min_free_space.set(self.min_free_space.get() - nbytes);
        self.producer_pos.store(pp + nbytes, Ordering::Release);
    }

    /// The contiguous committed run at the consumer position.
    ///
    /// Returns a pointer into the ring and the number of readable bytes
    /// starting there. When the pre-wrap region is exhausted the consumer
    /// position rolls over to offset 0 before the run is computed, so a
    /// non-empty ring eventually always yields bytes here.
    pub fn peek(&self) -> (*const u8, usize) {
        let cached_pp = self.producer_pos.load(Ordering::Acquire);
        let mut cp = self.consumer_pos.load(Ordering::Relaxed);

        if cached_pp < cp {
            // Producer has wrapped; drain up to the recorded end first.
            let end = self.end_of_recorded.load(Ordering::Acquire);
            let available = end - cp;
            if available > 0 {
                return (unsafe { self.base_ptr().add(cp) as *const u8 }, available);
            }
            self.consumer_pos.store(0, Ordering::Release);
            cp = 0;
        }

        (
            unsafe { self.base_ptr().add(cp) as *const u8 },
            cached_pp - cp,
        )
    }

    /// Release the first `nbytes` of the last peek back to the producer.
    pub fn consume(&self, nbytes: usize) {
        let cp = self.consumer_pos.load(Ordering::Relaxed);
        self.consumer_pos.store(cp + nbytes, Ordering::Release);
    }

    /// Flag the ring for destruction; called by the owning thread's exit
    /// guard. The drainer finishes draining before it lets go of the
    /// buffer.
    pub fn mark_deallocatable(&self) {
        self.should_deallocate.store(true, Ordering::Release);
    }

    /// True once the owning thread has exited and the ring is empty.
    pub fn check_can_delete(&self) -> bool {
        self.should_deallocate.load(Ordering::Acquire)
            && self.producer_pos.load(Ordering::Acquire)
                == self.consumer_pos.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn write_entry(sb: &StagingBuffer, bytes: &[u8]) {
        let dst = sb.reserve(bytes.len());
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        sb.commit(bytes.len());
    }

    fn read_entry(sb: &StagingBuffer, len: usize) -> Option<Vec<u8>> {
        let (ptr, available) = sb.peek();
        if available == 0 {
            return None;
        }
        assert!(available >= len, "entry straddles a wrap point");
        let out = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
        sb.consume(len);
        Some(out)
    }

    #[test]
    fn empty_ring_peeks_nothing() {
        let sb = StagingBuffer::new(1024);
        let (_, available) = sb.peek();
        assert_eq!(available, 0);
    }

    #[test]
    fn commit_then_peek_round_trips() {
        let sb = StagingBuffer::new(1024);
        write_entry(&sb, b"hello staging ring");
        assert_eq!(read_entry(&sb, 18).unwrap(), b"hello staging ring");
        let (_, available) = sb.peek();
        assert_eq!(available, 0);
    }

    #[test]
    fn uncommitted_bytes_stay_invisible() {
        let sb = StagingBuffer::new(1024);
        let dst = sb.reserve(64);
        unsafe { std::ptr::write_bytes(dst, 0xAB, 64) };
        let (_, available) = sb.peek();
        assert_eq!(available, 0);
        sb.commit(64);
        let (_, available) = sb.peek();
        assert_eq!(available, 64);
    }

    #[test]
    fn entries_never_straddle_the_wrap() {
        let sb = StagingBuffer::new(256);
        // Two 100-byte entries leave a 56-byte tail; the third entry must
        // come out of offset 0 in one contiguous run.
        write_entry(&sb, &[1u8; 100]);
        write_entry(&sb, &[2u8; 100]);
        assert_eq!(read_entry(&sb, 100).unwrap(), vec![1u8; 100]);
        assert_eq!(read_entry(&sb, 100).unwrap(), vec![2u8; 100]);
        write_entry(&sb, &[3u8; 100]);
        assert_eq!(read_entry(&sb, 100).unwrap(), vec![3u8; 100]);
    }

    #[test]
    fn full_ring_returns_the_sentinel() {
        let sb = StagingBuffer::new(256);
        while sb.try_reserve(100).is_some() {
            sb.commit(100);
        }
        assert!(sb.try_reserve(100).is_none());

        // Draining makes the space reservable again.
        assert!(read_entry(&sb, 100).is_some());
        assert!(read_entry(&sb, 100).is_some());
        assert!(sb.try_reserve(100).is_some());
    }

    #[test]
    fn wrap_waits_for_consumer_to_leave_offset_zero() {
        let sb = StagingBuffer::new(256);
        write_entry(&sb, &[7u8; 200]);
        // Tail is 56 bytes and the consumer still sits at 0: reserving 100
        // must fail rather than alias full with empty.
        assert!(sb.try_reserve(100).is_none());
        assert_eq!(read_entry(&sb, 200).unwrap(), vec![7u8; 200]);
        assert!(sb.try_reserve(100).is_some());
    }

    #[test]
    fn can_delete_requires_exit_and_empty() {
        let sb = StagingBuffer::new(1024);
        write_entry(&sb, &[9u8; 32]);
        assert!(!sb.check_can_delete());
        sb.mark_deallocatable();
        assert!(!sb.check_can_delete());
        read_entry(&sb, 32).unwrap();
        assert!(sb.check_can_delete());
    }

    #[test]
    fn fifo_holds_across_threads() {
        const ENTRIES: u32 = 200_000;
        const ENTRY_SIZE: usize = 16;

        let sb = Arc::new(StagingBuffer::new(4096));
        let producer = {
            let sb = sb.clone();
            thread::spawn(move || {
                for i in 0..ENTRIES {
                    let mut bytes = [0u8; ENTRY_SIZE];
                    bytes[..4].copy_from_slice(&i.to_le_bytes());
                    bytes[4..8].copy_from_slice(&(!i).to_le_bytes());
                    write_entry(&sb, &bytes);
                }
            })
        };

        let mut next = 0u32;
        while next < ENTRIES {
            let (ptr, available) = sb.peek();
            let mut offset = 0;
            while offset + ENTRY_SIZE <= available {
                let bytes =
                    unsafe { std::slice::from_raw_parts(ptr.add(offset), ENTRY_SIZE) };
                let seq = u32::from_le_bytes(bytes[..4].try_into().unwrap());
                let check = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
                assert_eq!(seq, next);
                assert_eq!(check, !next);
                next += 1;
                offset += ENTRY_SIZE;
            }
            if offset > 0 {
                sb.consume(offset);
            }
        }

        producer.join().unwrap();
    }
}
