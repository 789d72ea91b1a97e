//! per-source packet reassembly and dispatch.
//!
//! the comm layer's receive thread reads raw bytes off one inbound
//! socket and feeds them to that source's [`PacketAssembler`], which
//! accumulates until a whole `header ∥ payload` frame is available and
//! then invokes the control's receive callback. packets from one source
//! are dispatched in arrival order; callbacks for different sources run
//! concurrently on their own receive threads, so the callback must be
//! thread-safe.

use crate::error::{Result, RpcError};
use crate::packet::{PacketHeader, FAST_CALL, HEADER_LEN, STANDARD_CALL};
use crate::ProcId;
use plexus_cpu::AtomicCounter;
use std::sync::Arc;

/// receive callback: `(source, packet_type_mask, payload, sequentialization_key)`.
pub type ReceiveCallback = Arc<dyn Fn(ProcId, u8, &[u8], u64) + Send + Sync>;

pub struct PacketAssembler {
    source: ProcId,
    callback: ReceiveCallback,
    network_bytes_received: Arc<AtomicCounter>,
    max_packet_size: usize,
    buf: Vec<u8>,
}

impl PacketAssembler {
    pub fn new(
        source: ProcId,
        callback: ReceiveCallback,
        network_bytes_received: Arc<AtomicCounter>,
        max_packet_size: usize,
    ) -> Self {
        Self {
            source,
            callback,
            network_bytes_received,
            max_packet_size,
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn source(&self) -> ProcId {
        self.source
    }

    /// feed raw socket bytes; dispatches every completed packet.
    ///
    /// a framing violation (implausible length, header claiming a
    /// different source, conflicting kind bits) is fatal for the
    /// connection: the caller closes the socket and exits.
    pub fn incoming_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);

        let mut offset = 0;
        while self.buf.len() - offset >= HEADER_LEN {
            let header = PacketHeader::read_from(&self.buf[offset..]);
            self.check_header(&header)?;

            let total = HEADER_LEN + header.len as usize;
            if self.buf.len() - offset < total {
                break;
            }

            let payload = &self.buf[offset + HEADER_LEN..offset + total];
            (self.callback)(
                header.src,
                header.packet_type_mask,
                payload,
                header.sequentialization_key,
            );
            self.network_bytes_received.add(total as u64);
            offset += total;
        }

        if offset > 0 {
            self.buf.drain(..offset);
        }
        Ok(())
    }

    fn check_header(&self, header: &PacketHeader) -> Result<()> {
        if header.len as usize > self.max_packet_size {
            return Err(RpcError::Protocol(format!(
                "packet from {} claims {} bytes, limit is {}",
                self.source, header.len, self.max_packet_size
            )));
        }
        if header.src != self.source {
            return Err(RpcError::Protocol(format!(
                "packet on channel from {} claims src {}",
                self.source, header.src
            )));
        }
        if header.packet_type_mask & (STANDARD_CALL | FAST_CALL) == STANDARD_CALL | FAST_CALL {
            return Err(RpcError::Protocol(format!(
                "packet from {} is both a standard and a fast call",
                self.source
            )));
        }
        Ok(())
    }
}
