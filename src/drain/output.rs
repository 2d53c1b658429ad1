//! Double-buffered, block-aligned log output.
//!
//! The drainer compresses into one aligned scratch buffer while the
//! previous batch is being written. In asynchronous mode the write is
//! performed by a dedicated writer thread; the drainer submits a full
//! buffer, and before reusing one it reaps the previous completion,
//! mirroring an AIO submit/suspend/collect cycle. In synchronous mode the
//! drainer blocks on the write syscall itself and a single buffer
//! suffices.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::Counters;

/// Block size direct I/O requires buffers, offsets, and write lengths to
/// be aligned to.
pub(crate) const BLOCK_SIZE: usize = 512;

/// Open the log file with the runtime's file parameters: create or
/// append, writable, optionally with `O_DIRECT`.
pub(crate) fn open_log_file(path: &Path, direct_io: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true).write(true);
    #[cfg(unix)]
    if direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        opts.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(unix))]
    let _ = direct_io;
    opts.open(path)
}

/// Heap buffer aligned for direct I/O.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    cap: usize,
    len: usize,
}

// Moved between the drainer and the writer thread; never shared.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0 && cap % BLOCK_SIZE == 0);
        let layout = Layout::from_size_align(cap, BLOCK_SIZE)
            .expect("invalid output buffer layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => std::alloc::handle_alloc_error(layout),
        };
        Self { ptr, cap, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The writable tail after the bytes written so far.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.len), self.cap - self.len)
        }
    }

    /// Account `n` bytes just written into the spare region.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.len += n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Zero the tail out to the next block boundary; returns the number
    /// of pad bytes added.
    pub fn pad_to_block(&mut self) -> usize {
        let over = self.len % BLOCK_SIZE;
        if over == 0 {
            return 0;
        }
        let pad = BLOCK_SIZE - over;
        self.spare_mut()[..pad].fill(0);
        self.len += pad;
        pad
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.cap, BLOCK_SIZE),
            );
        }
    }
}

/// The asynchronous write worker: one buffer in flight at a time, handed
/// back with its result when reaped.
struct Writer {
    submit_tx: Option<Sender<AlignedBuf>>,
    done_rx: Receiver<(AlignedBuf, io::Result<()>)>,
    handle: Option<JoinHandle<()>>,
}

impl Writer {
    fn spawn(file: Arc<File>) -> Self {
        let (submit_tx, submit_rx) = channel::<AlignedBuf>();
        let (done_tx, done_rx) = channel();
        let handle = thread::Builder::new()
            .name("flashlog-writer".into())
            .spawn(move || {
                for buf in submit_rx.iter() {
                    let result = (&*file).write_all(buf.as_slice());
                    if done_tx.send((buf, result)).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn flashlog writer thread");
        Self {
            submit_tx: Some(submit_tx),
            done_rx,
            handle: Some(handle),
        }
    }

    /// Hand a buffer to the writer thread; hands it back if the thread is
    /// gone.
    fn submit(&self, buf: AlignedBuf) -> Result<(), AlignedBuf> {
        match self.submit_tx.as_ref().expect("writer channel closed").send(buf) {
            Ok(()) => Ok(()),
            Err(returned) => {
                eprintln!("flashlog: log writer thread is gone; dropping batch");
                Err(returned.0)
            }
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // Closing the channel stops the thread once its queue drains.
        self.submit_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The drainer's file plus its scratch buffers.
pub(crate) struct OutputFile {
    file: Arc<File>,
    buffer_size: usize,
    direct_io: bool,
    writer: Option<Writer>,
    /// The buffer the drainer compresses into, parked here between runs.
    compress: Option<AlignedBuf>,
    /// The second buffer in asynchronous mode; `None` exactly while it is
    /// in flight.
    spare: Option<AlignedBuf>,
    outstanding: bool,
}

impl OutputFile {
    pub fn new(file: Arc<File>, buffer_size: usize, use_aio: bool, direct_io: bool) -> Self {
        let (writer, spare) = if use_aio {
            (
                Some(Writer::spawn(file.clone())),
                Some(AlignedBuf::new(buffer_size)),
            )
        } else {
            (None, None)
        };
        Self {
            file,
            buffer_size,
            direct_io,
            writer,
            compress: Some(AlignedBuf::new(buffer_size)),
            spare,
            outstanding: false,
        }
    }

    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    /// Borrow the compress buffer for a drainer run.
    pub fn take_compress_buffer(&mut self) -> AlignedBuf {
        self.compress.take().expect("compress buffer already taken")
    }

    /// Return the compress buffer when a drainer run ends.
    pub fn park_compress_buffer(&mut self, buf: AlignedBuf) {
        self.compress = Some(buf);
    }

    /// Emit one batch. Returns the (empty) buffer to compress the next
    /// batch into; in asynchronous mode that is the other buffer of the
    /// pair, reaped from its previous flight if necessary.
    pub fn submit(&mut self, mut buf: AlignedBuf, counters: &Counters) -> AlignedBuf {
        counters
            .total_bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);

        if self.writer.is_none() {
            if let Err(e) = (&*self.file).write_all(buf.as_slice()) {
                eprintln!("flashlog: error dumping log: {}", e);
            }
            counters.writes_completed.fetch_add(1, Ordering::Relaxed);
            buf.clear();
            return buf;
        }

        let mut next = if self.outstanding {
            self.reap(counters)
        } else {
            self.spare.take().expect("double buffer missing")
        };
        match self.writer.as_ref().expect("writer missing").submit(buf) {
            Ok(()) => self.outstanding = true,
            Err(mut lost) => {
                lost.clear();
                self.spare = Some(lost);
            }
        }
        next.clear();
        next
    }

    /// Wait for the in-flight write and get its buffer back.
    fn reap(&mut self, counters: &Counters) -> AlignedBuf {
        self.outstanding = false;
        let writer = self.writer.as_ref().expect("reap without writer");
        match writer.done_rx.recv() {
            Ok((buf, result)) => {
                if let Err(e) = result {
                    eprintln!("flashlog: asynchronous log write failed: {}", e);
                }
                counters.writes_completed.fetch_add(1, Ordering::Relaxed);
                buf
            }
            Err(_) => {
                eprintln!("flashlog: log writer thread died with a batch in flight");
                AlignedBuf::new(self.buffer_size)
            }
        }
    }

    /// Collect any outstanding asynchronous write; called before a
    /// drainer run ends so no batch is left in flight.
    pub fn finish(&mut self, counters: &Counters) {
        if self.outstanding {
            let mut buf = self.reap(counters);
            buf.clear();
            self.spare = Some(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn pad_to_block_zeroes_the_tail() {
        let mut buf = AlignedBuf::new(BLOCK_SIZE * 2);
        buf.spare_mut()[..10].fill(0xEE);
        buf.advance(10);
        let pad = buf.pad_to_block();
        assert_eq!(pad, BLOCK_SIZE - 10);
        assert_eq!(buf.len() % BLOCK_SIZE, 0);
        assert!(buf.as_slice()[10..].iter().all(|&b| b == 0));

        // Already aligned: nothing to pad.
        assert_eq!(buf.pad_to_block(), 0);
    }

    #[test]
    fn buffer_is_block_aligned() {
        let buf = AlignedBuf::new(BLOCK_SIZE * 4);
        assert_eq!(buf.as_slice().as_ptr() as usize % BLOCK_SIZE, 0);
    }

    #[test]
    fn async_submit_round_trips_buffers() {
        let dir = tempdir().unwrap();
        let file = Arc::new(open_log_file(&dir.path().join("out.clog"), false).unwrap());
        let counters = Counters::default();

        let mut output = OutputFile::new(file.clone(), BLOCK_SIZE * 2, true, false);
        let mut buf = output.take_compress_buffer();

        for batch in [b"batch one\n".as_slice(), b"batch two\n".as_slice()] {
            buf.spare_mut()[..batch.len()].copy_from_slice(batch);
            buf.advance(batch.len());
            buf = output.submit(buf, &counters);
            assert!(buf.is_empty());
        }
        output.finish(&counters);
        output.park_compress_buffer(buf);

        assert_eq!(counters.writes_completed.load(Ordering::Relaxed), 2);
        let mut contents = String::new();
        File::open(dir.path().join("out.clog"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "batch one\nbatch two\n");
    }

    #[test]
    fn sync_submit_reuses_the_buffer() {
        let dir = tempdir().unwrap();
        let file = Arc::new(open_log_file(&dir.path().join("out.clog"), false).unwrap());
        let counters = Counters::default();

        let mut output = OutputFile::new(file, BLOCK_SIZE, false, false);
        let mut buf = output.take_compress_buffer();
        buf.spare_mut()[..5].copy_from_slice(b"hello");
        buf.advance(5);
        buf = output.submit(buf, &counters);
        assert!(buf.is_empty());
        assert_eq!(counters.total_bytes_written.load(Ordering::Relaxed), 5);
    }
}
