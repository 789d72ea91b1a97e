//! ring-backed buffered sender.
//!
//! `send_data` frames the packet straight into a circular byte buffer;
//! a dedicated I/O thread drains contiguous arcs of the ring into
//! socket writes. per-message allocation is zero, and a full ring
//! blocks the caller inside the write until the drain thread frees
//! space.
//!
//! the ring is SPSC, so a producer-side lock serializes concurrent
//! `send_data` callers; the header and payload of one packet enter the
//! ring back to back under that lock.

use crate::comm::CommLayer;
use crate::dc::DcShared;
use crate::error::{Result, RpcError};
use crate::sender::{frame_header, SendChannel};
use crate::ProcId;
use log::warn;
use plexus_channel::ByteRing;
use plexus_cpu::AtomicCounter;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub struct StreamSender {
    target: ProcId,
    shared: Arc<DcShared>,
    comm: Arc<dyn CommLayer>,
    ring: Arc<ByteRing>,
    /// serializes callers into the SPSC ring.
    producer_lock: Mutex<()>,
    bytes_sent: AtomicCounter,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSender {
    /// create the sender and spawn its drain thread.
    ///
    /// `ring_capacity` must strictly exceed the largest framed packet;
    /// the config layer validates this before construction.
    pub(crate) fn new(
        target: ProcId,
        shared: Arc<DcShared>,
        comm: Arc<dyn CommLayer>,
        ring_capacity: usize,
    ) -> StreamSender {
        let ring = Arc::new(ByteRing::new(ring_capacity));

        let loop_ring = Arc::clone(&ring);
        let loop_comm = Arc::clone(&comm);
        let handle = thread::Builder::new()
            .name(format!("dc-send-{}", target))
            .spawn(move || send_loop(loop_ring, loop_comm, target))
            .expect("failed to spawn sender thread");

        StreamSender {
            target,
            shared,
            comm,
            ring,
            producer_lock: Mutex::new(()),
            bytes_sent: AtomicCounter::new(),
            io_thread: Mutex::new(Some(handle)),
        }
    }
}

impl SendChannel for StreamSender {
    fn send_data(&self, packet_type_mask: u8, payload: &[u8]) -> Result<()> {
        if self.ring.is_stopped() {
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

        let _guard = self.producer_lock.lock().unwrap();
        self.ring
            .write_blocking(&header)
            .map_err(|_| RpcError::Shutdown)?;
        self.ring
            .write_blocking(payload)
            .map_err(|_| RpcError::Shutdown)?;
        Ok(())
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent.value()
    }

    fn channel_active(&self) -> bool {
        self.comm.channel_active(self.target)
    }

    /// stop the ring, drain whatever it still holds, and join the I/O
    /// thread. idempotent.
    fn shutdown(&self) {
        self.ring.stop();
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// drain loop: block for a readable arc, ship it in one socket write,
/// release it. after `stop` the remaining bytes still drain; the loop
/// exits once the ring is stopped and empty, or on the first write
/// error.
fn send_loop(ring: Arc<ByteRing>, comm: Arc<dyn CommLayer>, target: ProcId) {
    while let Some(arc) = ring.introspective_read() {
        let len = arc.len();
        match comm.send(target, &arc) {
            Ok(()) => arc.advance(len),
            Err(e) => {
                warn!("sender to {} exiting: {}", target, e);
                // unblock any producer stuck waiting for ring space
                ring.stop();
                break;
            }
        }
    }
}
