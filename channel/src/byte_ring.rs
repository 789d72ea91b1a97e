//! SPSC circular byte buffer with contiguous-arc introspection.
//!
//! one producer appends raw bytes, one consumer drains them. instead of
//! copying out, the consumer borrows the largest contiguous readable
//! region (an *arc*, bounded by the wrap point) via
//! [`introspective_read`] and releases it after use - the I/O thread
//! hands that region straight to `send()` without an intermediate copy.
//!
//! # cursor protocol
//!
//! `write_cursor` and `read_cursor` are monotonically increasing byte
//! counts; the slot index is `cursor & mask` (capacity is a power of
//! two). the producer publishes with a release store after copying in,
//! the consumer acquires before reading out, and `write_cursor -
//! read_cursor <= capacity` always holds. the mutex/condvar pair exists
//! only for sleeping; all data coordination is on the cursors.
//!
//! # safety
//!
//! the ring does not enforce the SPSC discipline at compile time: at
//! most one thread may write and at most one may read at any moment.
//! the sender that owns a ring serializes its callers with a producer
//! lock and runs a single drain thread.
//!
//! [`introspective_read`]: ByteRing::introspective_read

use crate::error::RingClosed;
use plexus_cpu::CachePadded;
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

pub struct ByteRing {
    /// raw byte storage; slots are plain bytes, never uninitialized reads
    /// because consumers only see `[read_cursor, write_cursor)`.
    storage: UnsafeCell<Box<[u8]>>,
    mask: usize,
    capacity: usize,

    /// total bytes ever written (producer-owned).
    write_cursor: CachePadded<AtomicUsize>,
    /// total bytes ever consumed (consumer-owned).
    read_cursor: CachePadded<AtomicUsize>,

    /// terminal state: reader is shutting down.
    stopped: AtomicBool,

    /// parking lot for both sides; protects nothing, serializes wakeups.
    sleep: Mutex<()>,
    data_ready: Condvar,
    space_ready: Condvar,
}

// safety: shared between exactly one producer and one consumer thread;
// all index exchange goes through the atomic cursors
unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// create a ring with `capacity` bytes of storage.
    ///
    /// # panics
    ///
    /// panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of 2, got {}",
            capacity
        );
        Self {
            storage: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            mask: capacity - 1,
            capacity,
            write_cursor: CachePadded::new(AtomicUsize::new(0)),
            read_cursor: CachePadded::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            sleep: Mutex::new(()),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// bytes currently buffered.
    #[inline]
    pub fn size(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire) - self.read_cursor.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// append up to `buf.len()` bytes without blocking; returns the
    /// number actually written (0 when full or stopped).
    pub fn write(&self, buf: &[u8]) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }

        let w = self.write_cursor.load(Ordering::Relaxed);
        // acquire: the consumer must have finished reading any bytes we
        // are about to overwrite
        let r = self.read_cursor.load(Ordering::Acquire);
        let free = self.capacity - (w - r);
        let n = free.min(buf.len());
        if n == 0 {
            return 0;
        }

        let idx = w & self.mask;
        let first = n.min(self.capacity - idx);
        // safety: we are the only writer, and [w, w + n) is unpublished
        // and unreadable until the release store below
        unsafe {
            let storage = (*self.storage.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(buf.as_ptr(), storage.add(idx), first);
            if n > first {
                std::ptr::copy_nonoverlapping(buf.as_ptr().add(first), storage, n - first);
            }
        }
        self.write_cursor.store(w + n, Ordering::Release);

        // lock-then-notify so a consumer mid-check cannot miss the wakeup
        drop(self.sleep.lock().unwrap());
        self.data_ready.notify_all();
        n
    }

    /// append all of `buf`, blocking while the ring is full.
    ///
    /// fails with [`RingClosed`] if the reader stops before every byte
    /// is accepted.
    pub fn write_blocking(&self, buf: &[u8]) -> Result<(), RingClosed> {
        let mut written = 0;
        loop {
            written += self.write(&buf[written..]);
            if written == buf.len() {
                return Ok(());
            }
            if self.stopped.load(Ordering::Acquire) {
                return Err(RingClosed);
            }

            let w = self.write_cursor.load(Ordering::Relaxed);
            let mut guard = self.sleep.lock().unwrap();
            loop {
                let r = self.read_cursor.load(Ordering::Acquire);
                if w - r < self.capacity || self.stopped.load(Ordering::Acquire) {
                    break;
                }
                guard = self.space_ready.wait(guard).unwrap();
            }
        }
    }

    /// borrow the largest contiguous readable arc, blocking while the
    /// ring is empty.
    ///
    /// returns `None` only when the ring is stopped *and* empty, so a
    /// draining consumer still sees every byte written before the stop.
    pub fn introspective_read(&self) -> Option<ReadArc<'_>> {
        loop {
            if let Some(arc) = self.try_introspective_read() {
                return Some(arc);
            }

            let mut guard = self.sleep.lock().unwrap();
            loop {
                if self.write_cursor.load(Ordering::Acquire)
                    != self.read_cursor.load(Ordering::Relaxed)
                {
                    break;
                }
                if self.stopped.load(Ordering::Acquire) {
                    return None;
                }
                guard = self.data_ready.wait(guard).unwrap();
            }
        }
    }

    /// non-blocking variant of [`introspective_read`](Self::introspective_read).
    pub fn try_introspective_read(&self) -> Option<ReadArc<'_>> {
        let r = self.read_cursor.load(Ordering::Relaxed);
        let w = self.write_cursor.load(Ordering::Acquire);
        let avail = w - r;
        if avail == 0 {
            return None;
        }

        let idx = r & self.mask;
        let len = avail.min(self.capacity - idx);
        Some(ReadArc {
            ring: self,
            offset: idx,
            len,
        })
    }

    /// enter the terminal state and wake both sides. idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        drop(self.sleep.lock().unwrap());
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    fn release(&self, consumed: usize) {
        let r = self.read_cursor.load(Ordering::Relaxed);
        self.read_cursor.store(r + consumed, Ordering::Release);
        drop(self.sleep.lock().unwrap());
        self.space_ready.notify_all();
    }
}

/// borrowed contiguous readable region of a [`ByteRing`].
///
/// dereferences to the readable bytes. call [`advance`](Self::advance)
/// with the number of bytes actually consumed; dropping the arc without
/// advancing releases nothing, so the bytes stay readable.
pub struct ReadArc<'a> {
    ring: &'a ByteRing,
    offset: usize,
    len: usize,
}

impl ReadArc<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// mark `consumed` bytes as drained and wake a blocked producer.
    ///
    /// # panics
    ///
    /// panics if `consumed` exceeds the arc length.
    pub fn advance(self, consumed: usize) {
        assert!(consumed <= self.len, "advanced past readable arc");
        self.ring.release(consumed);
    }
}

impl Deref for ReadArc<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // safety: [offset, offset + len) is published by the producer
        // (acquire-paired) and cannot be overwritten until we advance
        // the read cursor
        unsafe {
            let storage = (*self.ring.storage.get()).as_ptr();
            std::slice::from_raw_parts(storage.add(self.offset), self.len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "power of 2")]
    fn test_non_power_of_two() {
        let _ = ByteRing::new(1000);
    }

    #[test]
    fn test_write_then_read() {
        let ring = ByteRing::new(64);
        assert_eq!(ring.write(b"hello"), 5);
        assert_eq!(ring.size(), 5);

        let arc = ring.try_introspective_read().unwrap();
        assert_eq!(&*arc, b"hello");
        arc.advance(5);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_partial_write_when_full() {
        let ring = ByteRing::new(8);
        assert_eq!(ring.write(&[1; 6]), 6);
        assert_eq!(ring.write(&[2; 6]), 2);
        assert_eq!(ring.write(&[3; 1]), 0);
    }

    #[test]
    fn test_wrap_produces_two_arcs() {
        let ring = ByteRing::new(8);

        // advance the cursors past the wrap point
        assert_eq!(ring.write(&[0; 6]), 6);
        ring.try_introspective_read().unwrap().advance(6);

        // 4 bytes: 2 before the wrap, 2 after
        assert_eq!(ring.write(&[7; 4]), 4);
        let arc = ring.try_introspective_read().unwrap();
        assert_eq!(arc.len(), 2);
        assert_eq!(&*arc, &[7, 7]);
        arc.advance(2);

        let arc = ring.try_introspective_read().unwrap();
        assert_eq!(arc.len(), 2);
        assert_eq!(&*arc, &[7, 7]);
        arc.advance(2);

        assert!(ring.is_empty());
    }

    #[test]
    fn test_drop_without_advance_keeps_bytes() {
        let ring = ByteRing::new(16);
        ring.write(b"abc");

        let arc = ring.try_introspective_read().unwrap();
        drop(arc);

        let arc = ring.try_introspective_read().unwrap();
        assert_eq!(&*arc, b"abc");
    }

    #[test]
    fn test_introspective_read_blocks_until_write() {
        let ring = Arc::new(ByteRing::new(64));

        let ring2 = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ring2.write(b"x");
        });

        let arc = ring.introspective_read().unwrap();
        assert_eq!(&*arc, b"x");
        arc.advance(1);
        producer.join().unwrap();
    }

    #[test]
    fn test_stop_drains_then_none() {
        let ring = ByteRing::new(64);
        ring.write(b"tail");
        ring.stop();

        // bytes written before the stop are still readable
        let arc = ring.introspective_read().unwrap();
        assert_eq!(&*arc, b"tail");
        arc.advance(4);

        assert!(ring.introspective_read().is_none());
    }

    #[test]
    fn test_write_refused_after_stop() {
        let ring = ByteRing::new(64);
        ring.stop();
        assert_eq!(ring.write(b"x"), 0);
        assert_eq!(ring.write_blocking(b"x"), Err(RingClosed));
    }

    #[test]
    fn test_write_blocking_waits_for_space() {
        let ring = Arc::new(ByteRing::new(8));
        assert_eq!(ring.write(&[1; 8]), 8);

        let ring2 = Arc::clone(&ring);
        let producer = thread::spawn(move || ring2.write_blocking(&[2; 4]));

        thread::sleep(Duration::from_millis(50));
        ring.try_introspective_read().unwrap().advance(8);

        producer.join().unwrap().unwrap();
        let arc = ring.try_introspective_read().unwrap();
        assert_eq!(&*arc, &[2, 2, 2, 2]);
    }

    #[test]
    fn test_spsc_stream_integrity() {
        // push 1 MiB through a small ring and verify the byte stream
        let ring = Arc::new(ByteRing::new(1024));
        const TOTAL: usize = 1 << 20;

        let ring2 = Arc::clone(&ring);
        let producer = thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let n = (TOTAL - next).min(251);
                let buf: Vec<u8> = (next..next + n).map(|i| (i % 251) as u8).collect();
                ring2.write_blocking(&buf).unwrap();
                next += n;
            }
            ring2.stop();
        });

        let mut seen = 0usize;
        while let Some(arc) = ring.introspective_read() {
            for (i, &b) in arc.iter().enumerate() {
                assert_eq!(b, ((seen + i) % 251) as u8);
            }
            let n = arc.len();
            arc.advance(n);
            seen += n;
        }

        assert_eq!(seen, TOTAL);
        producer.join().unwrap();
    }
}
