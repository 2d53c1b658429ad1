//! Concurrency tests for the SPSC staging ring.

use std::sync::Arc;
use std::thread;

use flashlog::StagingBuffer;

fn write_entry(sb: &StagingBuffer, bytes: &[u8]) {
    let dst = sb.reserve(bytes.len());
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    sb.commit(bytes.len());
}

/// Every committed byte comes back out in commit order, across a real
/// producer/consumer thread pair, with runs that never straddle the wrap.
#[test]
fn bytes_come_back_in_commit_order() {
    const ENTRIES: u32 = 100_000;
    const ENTRY_SIZE: usize = 24;

    let sb = Arc::new(StagingBuffer::new(4096));

    let producer = {
        let sb = sb.clone();
        thread::spawn(move || {
            let mut entry = [0u8; ENTRY_SIZE];
            for i in 0..ENTRIES {
                entry[..4].copy_from_slice(&i.to_le_bytes());
                for (j, byte) in entry[4..].iter_mut().enumerate() {
                    *byte = (i as u8).wrapping_add(j as u8);
                }
                write_entry(&sb, &entry);
            }
        })
    };

    let mut next = 0u32;
    while next < ENTRIES {
        let (ptr, available) = sb.peek();
        assert_eq!(
            available % ENTRY_SIZE,
            0,
            "a peek run split an entry across the wrap"
        );
        let mut consumed = 0;
        while consumed + ENTRY_SIZE <= available {
            let entry = unsafe { std::slice::from_raw_parts(ptr.add(consumed), ENTRY_SIZE) };
            let seq = u32::from_le_bytes(entry[..4].try_into().unwrap());
            assert_eq!(seq, next, "entries reordered or lost");
            for (j, &byte) in entry[4..].iter().enumerate() {
                assert_eq!(byte, (seq as u8).wrapping_add(j as u8), "payload corrupted");
            }
            next += 1;
            consumed += ENTRY_SIZE;
        }
        if consumed > 0 {
            sb.consume(consumed);
        }
    }

    producer.join().unwrap();
    let (_, available) = sb.peek();
    assert_eq!(available, 0);
}

/// Variable entry sizes across many wraps: sizes that do not divide the
/// capacity force the skipped-tail path constantly.
#[test]
fn mixed_sizes_survive_wrapping() {
    let sizes = [33usize, 100, 7, 250, 64, 11];
    const ROUNDS: usize = 20_000;

    let sb = Arc::new(StagingBuffer::new(4096));

    let producer = {
        let sb = sb.clone();
        thread::spawn(move || {
            for round in 0..ROUNDS {
                let len = sizes[round % sizes.len()];
                let mut entry = vec![(round % 251) as u8; len];
                entry[0] = len as u8;
                write_entry(&sb, &entry);
            }
        })
    };

    let mut seen = 0;
    while seen < ROUNDS {
        let expected_len = sizes[seen % sizes.len()];
        let (ptr, available) = sb.peek();
        if available == 0 {
            std::hint::spin_loop();
            continue;
        }
        assert!(
            available >= expected_len,
            "peek run shorter than the next entry"
        );
        let entry = unsafe { std::slice::from_raw_parts(ptr, expected_len) };
        assert_eq!(entry[0], expected_len as u8);
        assert!(entry[1..].iter().all(|&b| b == (seen % 251) as u8));
        sb.consume(expected_len);
        seen += 1;
    }

    producer.join().unwrap();
}

/// The non-blocking reserve reports a full ring instead of spinning, and
/// recovers once the consumer frees space.
#[test]
fn try_reserve_reports_backpressure() {
    let sb = StagingBuffer::new(4096);

    let mut written = 0;
    while sb.try_reserve(600).is_some() {
        sb.commit(600);
        written += 1;
    }
    assert!(written > 0);
    assert!(sb.try_reserve(600).is_none());

    // Free everything and the same reservation succeeds.
    loop {
        let (_, available) = sb.peek();
        if available == 0 {
            break;
        }
        sb.consume(available);
    }
    assert!(sb.try_reserve(600).is_some());
}

/// Deallocation is gated on both the exit flag and an empty ring.
#[test]
fn delete_waits_for_drain() {
    let sb = StagingBuffer::new(4096);
    write_entry(&sb, &[1u8; 100]);

    assert!(!sb.check_can_delete());
    sb.mark_deallocatable();
    assert!(!sb.check_can_delete(), "ring still holds an entry");

    let (_, available) = sb.peek();
    assert_eq!(available, 100);
    sb.consume(available);
    assert!(sb.check_can_delete());
}
