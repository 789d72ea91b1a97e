//! per-peer senders.
//!
//! each remote peer gets exactly one sender, selected at init time by
//! the `buffered_send` option:
//!
//! - [`stream::StreamSender`] stages framed packets in a circular byte
//!   buffer; its I/O thread ships contiguous arcs of the ring. a full
//!   ring blocks the caller, which is the only backpressure the
//!   transport applies beyond TCP itself.
//! - [`expqueue::ExpQueueSender`] stages owned entries in an unbounded
//!   queue and write-combines small packets into one socket write;
//!   callers never block.
//!
//! both variants frame one payload per call, stamp the header, and feed
//! the communication layer from a dedicated I/O thread.

pub mod expqueue;
pub mod stream;

use crate::dc::DcShared;
use crate::error::Result;
use crate::packet::{is_call, is_control, PacketHeader, HEADER_LEN};
use crate::ProcId;
use plexus_cpu::AtomicCounter;

pub use expqueue::ExpQueueSender;
pub use stream::StreamSender;

/// contract every sender variant satisfies.
///
/// `send_data` copies the payload before returning; the caller keeps
/// ownership of its buffer. `shutdown` drains staged packets, joins the
/// I/O thread, and is idempotent.
pub trait SendChannel: Send + Sync {
    fn send_data(&self, packet_type_mask: u8, payload: &[u8]) -> Result<()>;

    /// payload bytes accepted so far, control packets excluded. never
    /// rolled back when a send later fails on the wire.
    fn bytes_sent(&self) -> u64;

    fn channel_active(&self) -> bool;

    fn shutdown(&self);
}

/// build the wire header for one outgoing packet and apply call/byte
/// accounting: non-control packets add to `bytes_sent`, and call
/// packets bump the control's per-target counter.
pub(crate) fn frame_header(
    shared: &DcShared,
    target: ProcId,
    packet_type_mask: u8,
    payload_len: usize,
    bytes_sent: &AtomicCounter,
) -> [u8; HEADER_LEN] {
    if !is_control(packet_type_mask) {
        if is_call(packet_type_mask) {
            shared.calls_sent[target as usize].inc();
        }
        bytes_sent.add(payload_len as u64);
    }

    PacketHeader {
        len: payload_len as u32,
        src: shared.procid,
        sequentialization_key: shared.seq_key.fetch_inc(),
        packet_type_mask,
    }
    .to_bytes()
}
