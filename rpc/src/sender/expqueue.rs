//! queue-backed sender with write-combining.
//!
//! `send_data` copies the payload into an owned entry and enqueues it;
//! callers never block. the I/O thread dequeues one entry at a time,
//! and when the entry is small it drains up to [`MAX_COMBINE_ENTRIES`]
//! more inside the queue's critical section, then packs them end to
//! end into a combining buffer so many small packets cost one socket
//! write. large entries bypass the buffer entirely and go out as one
//! gather write of header and payload.
//!
//! entry ownership transfers from producer to consumer at dequeue; the
//! I/O thread drops each entry once its bytes are on the wire or in
//! the combining buffer.

use crate::comm::CommLayer;
use crate::dc::DcShared;
use crate::error::{Result, RpcError};
use crate::packet::HEADER_LEN;
use crate::sender::{frame_header, SendChannel};
use crate::ProcId;
use log::warn;
use plexus_channel::{BlockingQueue, CriticalSection};
use plexus_cpu::AtomicCounter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// most entries drained per critical section.
const MAX_COMBINE_ENTRIES: usize = 128;

/// one framed packet, staged for the I/O thread.
struct SendEntry {
    header: [u8; HEADER_LEN],
    payload: Vec<u8>,
}

impl SendEntry {
    #[inline]
    fn framed_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

pub struct ExpQueueSender {
    target: ProcId,
    shared: Arc<DcShared>,
    comm: Arc<dyn CommLayer>,
    queue: Arc<BlockingQueue<SendEntry>>,
    bytes_sent: AtomicCounter,
    stopping: AtomicBool,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExpQueueSender {
    pub(crate) fn new(
        target: ProcId,
        shared: Arc<DcShared>,
        comm: Arc<dyn CommLayer>,
        combine_lower_threshold: usize,
        combine_upper_threshold: usize,
    ) -> ExpQueueSender {
        let queue = Arc::new(BlockingQueue::new());

        let mut io = SendLoop {
            queue: Arc::clone(&queue),
            comm: Arc::clone(&comm),
            target,
            combine_lower_threshold,
            combine_upper_threshold,
            combining: Vec::with_capacity(combine_upper_threshold),
            lost: false,
        };
        let handle = thread::Builder::new()
            .name(format!("dc-send-{}", target))
            .spawn(move || io.run())
            .expect("failed to spawn sender thread");

        ExpQueueSender {
            target,
            shared,
            comm,
            queue,
            bytes_sent: AtomicCounter::new(),
            stopping: AtomicBool::new(false),
            io_thread: Mutex::new(Some(handle)),
        }
    }
}

impl SendChannel for ExpQueueSender {
    fn send_data(&self, packet_type_mask: u8, payload: &[u8]) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        if !self.comm.channel_active(self.target) {
            return Err(RpcError::ConnectionLost(self.target));
        }

        let header = frame_header(
            &self.shared,
            self.target,
            packet_type_mask,
            payload.len(),
            &self.bytes_sent,
        );
        self.queue.enqueue(SendEntry {
            header,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.value()
    }

    fn channel_active(&self) -> bool {
        self.comm.channel_active(self.target)
    }

    /// stop the queue and join the I/O thread; entries enqueued before
    /// the stop are still flushed. idempotent.
    fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.queue.stop_blocking();
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// state owned by the I/O thread.
struct SendLoop {
    queue: Arc<BlockingQueue<SendEntry>>,
    comm: Arc<dyn CommLayer>,
    target: ProcId,
    combine_lower_threshold: usize,
    combine_upper_threshold: usize,
    /// reused packing buffer, at most `combine_upper_threshold` bytes.
    combining: Vec<u8>,
    /// channel already reported dead; keep draining quietly.
    lost: bool,
}

impl SendLoop {
    fn run(&mut self) {
        let queue = Arc::clone(&self.queue);
        while let Some((entry, section)) = queue.dequeue_and_begin_critical_section() {
            if entry.framed_len() <= self.combine_lower_threshold {
                self.write_combining_send(entry, section);
            } else {
                drop(section);
                self.send_direct(entry);
            }
        }
    }

    /// drain a batch inside the critical section, then pack entries end
    /// to end, flushing whenever the next entry would overflow the
    /// combining buffer. entries that cannot fit even in an empty
    /// buffer are shipped on their own.
    fn write_combining_send(&mut self, first: SendEntry, mut section: CriticalSection<'_, SendEntry>) {
        let mut entries = Vec::with_capacity(MAX_COMBINE_ENTRIES);
        entries.push(first);
        while entries.len() < MAX_COMBINE_ENTRIES {
            match section.try_dequeue() {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        drop(section);

        for entry in entries {
            let framed_len = entry.framed_len();
            if self.combining.len() + framed_len > self.combine_upper_threshold {
                self.flush_combining();
            }
            if self.combining.len() + framed_len <= self.combine_upper_threshold {
                self.combining.extend_from_slice(&entry.header);
                self.combining.extend_from_slice(&entry.payload);
            } else {
                // combining buffer is empty here; the entry alone is too big
                self.send_direct(entry);
            }
        }

        if !self.combining.is_empty() {
            self.flush_combining();
        }
    }

    fn flush_combining(&mut self) {
        if let Err(e) = self.comm.send(self.target, &self.combining) {
            self.report_lost(&e);
        }
        self.combining.clear();
    }

    fn send_direct(&mut self, entry: SendEntry) {
        if let Err(e) = self.comm.send2(self.target, &entry.header, &entry.payload) {
            self.report_lost(&e);
        }
    }

    fn report_lost(&mut self, e: &RpcError) {
        if !self.lost {
            warn!("sender to {} dropping staged packets: {}", self.target, e);
            self.lost = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CONTROL_PACKET, FAST_CALL, STANDARD_CALL};
    use crate::sender::testing::{parse_frames, test_shared, MockComm};

    fn sender_with(comm: Arc<MockComm>, lower: usize, upper: usize) -> ExpQueueSender {
        ExpQueueSender::new(1, test_shared(0, 2), comm, lower, upper)
    }

    #[test]
    fn test_single_packet() {
        let comm = MockComm::new();
        let sender = sender_with(Arc::clone(&comm), 1024, 64 * 1024);

        sender.send_data(STANDARD_CALL, b"hello").unwrap();
        sender.shutdown();

        let packets = parse_frames(&comm.concat());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, STANDARD_CALL);
        assert_eq!(packets[0].1, b"hello");
        assert_eq!(sender.bytes_sent(), 5);
    }

    #[test]
    fn test_write_combining_reduces_syscalls() {
        // stall the I/O thread while 1000 small packets pile up
        let comm = MockComm::gated();
        let sender = sender_with(Arc::clone(&comm), 1024, 64 * 1024);

        for i in 0..1000u64 {
            let mut payload = [0u8; 16];
            payload[..8].copy_from_slice(&i.to_ne_bytes());
            sender.send_data(STANDARD_CALL, &payload).unwrap();
        }
        comm.open_gate();
        sender.shutdown();

        let framed = HEADER_LEN + 16;
        let upper_bound = (1000 * framed) / (64 * 1024) + 1000 / MAX_COMBINE_ENTRIES + 3;
        let calls = comm.total_calls();
        assert!(
            calls <= upper_bound,
            "{} socket writes for 1000 packets (bound {})",
            calls,
            upper_bound
        );

        // every payload arrives exactly once, in submission order
        let packets = parse_frames(&comm.concat());
        assert_eq!(packets.len(), 1000);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(&packet.1[..8], &(i as u64).to_ne_bytes());
        }
    }

    #[test]
    fn test_combined_stream_equals_submissions() {
        let comm = MockComm::gated();
        let sender = sender_with(Arc::clone(&comm), 256, 1024);

        let mut expected = Vec::new();
        for i in 0..300usize {
            let payload = vec![(i % 251) as u8; i % 100];
            sender.send_data(STANDARD_CALL, &payload).unwrap();
            expected.push(payload);
        }
        comm.open_gate();
        sender.shutdown();

        let packets = parse_frames(&comm.concat());
        assert_eq!(packets.len(), expected.len());
        for (packet, want) in packets.iter().zip(&expected) {
            assert_eq!(&packet.1, want);
        }
    }

    #[test]
    fn test_large_message_bypasses_combining() {
        let upper = 64 * 1024;
        let comm = MockComm::new();
        let sender = sender_with(Arc::clone(&comm), 1024, upper);

        let large = vec![0xabu8; 2 * upper];
        sender.send_data(STANDARD_CALL, &large).unwrap();
        sender.shutdown();

        // one gather write carries the whole packet
        assert_eq!(comm.send2_calls.load(Ordering::SeqCst), 1);
        assert_eq!(comm.send_calls.load(Ordering::SeqCst), 0);
        let packets = parse_frames(&comm.concat());
        assert_eq!(packets[0].1.len(), 2 * upper);
    }

    #[test]
    fn test_small_packets_still_combine_after_large() {
        let comm = MockComm::gated();
        let sender = sender_with(Arc::clone(&comm), 1024, 64 * 1024);

        sender.send_data(STANDARD_CALL, b"before").unwrap();
        sender
            .send_data(STANDARD_CALL, &vec![1u8; 128 * 1024])
            .unwrap();
        sender.send_data(STANDARD_CALL, b"after-1").unwrap();
        sender.send_data(STANDARD_CALL, b"after-2").unwrap();
        comm.open_gate();
        sender.shutdown();

        let packets = parse_frames(&comm.concat());
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].1, b"before");
        assert_eq!(packets[1].1.len(), 128 * 1024);
        assert_eq!(packets[2].1, b"after-1");
        assert_eq!(packets[3].1, b"after-2");
    }

    #[test]
    fn test_oversize_entry_in_combining_batch_goes_direct() {
        // a large entry drained into the combining batch behind a small
        // one is flushed around, preserving order
        let comm = MockComm::gated();
        let sender = sender_with(Arc::clone(&comm), 64, 256);

        sender.send_data(STANDARD_CALL, b"tiny-1").unwrap();
        sender.send_data(STANDARD_CALL, &vec![7u8; 512]).unwrap();
        sender.send_data(STANDARD_CALL, b"tiny-2").unwrap();
        comm.open_gate();
        sender.shutdown();

        let packets = parse_frames(&comm.concat());
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].1, b"tiny-1");
        assert_eq!(packets[1].1.len(), 512);
        assert_eq!(packets[2].1, b"tiny-2");
        // the oversize entry went out as its own gather write
        assert_eq!(comm.send2_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_data_never_blocks() {
        // gate never opens while we enqueue
        let comm = MockComm::gated();
        let sender = sender_with(Arc::clone(&comm), 1024, 64 * 1024);

        for _ in 0..10_000 {
            sender.send_data(STANDARD_CALL, &[0u8; 64]).unwrap();
        }
        comm.open_gate();
        sender.shutdown();
        assert_eq!(parse_frames(&comm.concat()).len(), 10_000);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let comm = MockComm::gated();
        let sender = sender_with(Arc::clone(&comm), 1024, 64 * 1024);

        for i in 0..100u8 {
            sender.send_data(STANDARD_CALL, &[i]).unwrap();
        }
        comm.open_gate();
        sender.shutdown();

        let packets = parse_frames(&comm.concat());
        assert_eq!(packets.len(), 100);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.1, vec![i as u8]);
        }
    }

    #[test]
    fn test_accounting() {
        let comm = MockComm::new();
        let sender = sender_with(Arc::clone(&comm), 1024, 64 * 1024);
        let shared = Arc::clone(&sender.shared);

        sender.send_data(STANDARD_CALL, b"abc").unwrap();
        sender.send_data(FAST_CALL, b"de").unwrap();
        sender.send_data(CONTROL_PACKET, b"fgh").unwrap();
        sender.shutdown();

        assert_eq!(sender.bytes_sent(), 5);
        assert_eq!(shared.calls_sent[1].value(), 2);
        assert_eq!(parse_frames(&comm.concat()).len(), 3);
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let comm = MockComm::new();
        let sender = sender_with(comm, 1024, 64 * 1024);
        sender.shutdown();

        assert!(matches!(
            sender.send_data(STANDARD_CALL, b"late"),
            Err(RpcError::Shutdown)
        ));
    }
}
