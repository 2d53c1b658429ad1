//! The drainer loop: scan staging buffers, compress, emit batches.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::clock;
use crate::codec::{self, EntryView};
use crate::runtime::Inner;
use crate::staging::EntryHeader;

use super::output::OutputFile;

/// Body of the `flashlog-drain` thread.
///
/// Each outer iteration scans every staging buffer for committed entries,
/// compresses as much as fits into the scratch buffer, and emits the
/// batch. The registry mutex is held only while picking the next buffer;
/// compression runs unlocked. When a full pass finds no work the loop
/// services the sync protocol and naps briefly on `work_added`.
pub(crate) fn drain_loop(inner: Arc<Inner>, mut output: OutputFile) {
    let counters = &inner.counters;
    let table = inner.config.table;

    // Delta baselines persist across drainer restarts on the same file;
    // set_log_file resets them when it swaps files.
    let (mut last_timestamp, mut last_fmt_id) = *inner.baselines.lock();
    let mut last_checked: usize = 0;

    let mut out = output.take_compress_buffer();

    let mut awake_since = clock::rdtsc();
    counters
        .cycle_at_thread_start
        .store(awake_since, Ordering::Relaxed);

    while !inner.should_exit.load(Ordering::Acquire) {
        let scan_start = clock::rdtsc();
        {
            let mut buffers = inner.registry.lock();
            if last_checked >= buffers.len() {
                last_checked = 0;
            }
            let mut i = last_checked;
            let mut output_full = false;
            let mut work_found = false;

            while !inner.should_exit.load(Ordering::Relaxed)
                && !output_full
                && !buffers.is_empty()
            {
                let sb = buffers[i].clone();
                let (mut peek_ptr, mut readable) = sb.peek();

                if readable > 0 {
                    work_found = true;
                    drop(buffers);

                    let compress_start = clock::rdtsc();
                    let readable_at_start = readable;
                    while readable > 0 {
                        debug_assert!(readable >= EntryHeader::SIZE);
                        let header = unsafe { EntryHeader::read(peek_ptr) };
                        let entry_size = header.entry_size as usize;
                        debug_assert!(entry_size <= readable);

                        // Worst-case bound: compressed output is never
                        // larger than the entry plus its descriptor slack.
                        if entry_size + header.arg_meta_bytes as usize > out.remaining() {
                            last_checked = i;
                            output_full = true;
                            break;
                        }

                        let n = codec::compress_metadata(
                            &header,
                            out.spare_mut(),
                            last_timestamp,
                            last_fmt_id,
                        );
                        out.advance(n);
                        last_fmt_id = header.fmt_id;
                        last_timestamp = header.timestamp;

                        let entry = EntryView {
                            header,
                            args: unsafe {
                                std::slice::from_raw_parts(
                                    peek_ptr.add(EntryHeader::SIZE),
                                    entry_size - EntryHeader::SIZE,
                                )
                            },
                        };
                        let n = (table[header.fmt_id as usize])(&entry, out.spare_mut());
                        out.advance(n);

                        counters.events_processed.fetch_add(1, Ordering::Relaxed);
                        readable -= entry_size;
                        peek_ptr = unsafe { peek_ptr.add(entry_size) };
                        sb.consume(entry_size);
                    }
                    counters
                        .total_bytes_read
                        .fetch_add((readable_at_start - readable) as u64, Ordering::Relaxed);
                    counters
                        .cycles_compressing
                        .fetch_add(clock::rdtsc().wrapping_sub(compress_start), Ordering::Relaxed);

                    buffers = inner.registry.lock();
                } else if sb.check_can_delete() {
                    // Owning thread is gone and the ring is drained; the
                    // registry's reference was the drainer-visible one.
                    buffers.remove(i);
                    if last_checked >= buffers.len() {
                        last_checked = 0;
                    }
                    if i >= buffers.len() {
                        i = 0;
                    }
                    continue;
                }

                if buffers.is_empty() {
                    break;
                }
                i = (i + 1) % buffers.len();

                // Completed a pass over every buffer.
                if i == last_checked {
                    if !work_found {
                        break;
                    }
                    work_found = false;
                }
            }
        }
        counters
            .cycles_scanning
            .fetch_add(clock::rdtsc().wrapping_sub(scan_start), Ordering::Relaxed);

        if out.is_empty() {
            // Nothing new was compressed. Collect any batch still in
            // flight first: a sync waiter must not be told the queue is
            // empty while bytes have yet to reach the kernel.
            let io_start = clock::rdtsc();
            output.finish(counters);
            counters
                .cycles_output
                .fetch_add(clock::rdtsc().wrapping_sub(io_start), Ordering::Relaxed);

            let mut state = inner.cond.lock();
            if state.sync_requested {
                // One more full pass so everything staged before the sync
                // call is picked up.
                state.sync_requested = false;
                continue;
            }

            counters
                .cycles_awake
                .fetch_add(clock::rdtsc().wrapping_sub(awake_since), Ordering::Relaxed);
            inner.queue_emptied.notify_all();
            let _ = inner
                .work_added
                .wait_for(&mut state, inner.config.poll_interval);
            drop(state);
            awake_since = clock::rdtsc();
            continue;
        }

        if output.direct_io() {
            let pad = out.pad_to_block();
            counters
                .pad_bytes_written
                .fetch_add(pad as u64, Ordering::Relaxed);
        }

        let io_start = clock::rdtsc();
        out = output.submit(out, counters);
        counters
            .cycles_output
            .fetch_add(clock::rdtsc().wrapping_sub(io_start), Ordering::Relaxed);
    }

    // Exit path: collect any in-flight write before the buffers go back.
    let io_start = clock::rdtsc();
    output.finish(counters);
    counters
        .cycles_output
        .fetch_add(clock::rdtsc().wrapping_sub(io_start), Ordering::Relaxed);
    counters
        .cycles_awake
        .fetch_add(clock::rdtsc().wrapping_sub(awake_since), Ordering::Relaxed);

    *inner.baselines.lock() = (last_timestamp, last_fmt_id);
    output.park_compress_buffer(out);
    *inner.output.lock() = Some(output);
}
