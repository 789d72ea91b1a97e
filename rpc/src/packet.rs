//! packet framing.
//!
//! every payload on the wire is preceded by a fixed-layout header; the
//! stream on a socket is a plain concatenation of `header ∥ payload`
//! with no delimiters or trailers. the header is written in native byte
//! order - the membership set is assumed endian-homogeneous.

use crate::ProcId;

/// ordinary RPC; counts toward per-peer call accounting.
pub const STANDARD_CALL: u8 = 1 << 0;
/// call routed for low-latency handling; same accounting as standard.
pub const FAST_CALL: u8 = 1 << 1;
/// internal framing or liveness; exempt from call accounting and
/// `bytes_sent`, still counted in `network_bytes_sent`.
pub const CONTROL_PACKET: u8 = 1 << 2;

/// wire size of the header: 4 len + 4 src + 8 key + 1 mask + 7 reserved.
pub const HEADER_LEN: usize = 24;

/// fixed-size record preceding every payload.
///
/// `len` is the payload byte count, excluding the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub len: u32,
    pub src: ProcId,
    pub sequentialization_key: u64,
    pub packet_type_mask: u8,
}

impl PacketHeader {
    /// serialize into a wire buffer; reserved bytes are zeroed.
    pub fn write_to(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..4].copy_from_slice(&self.len.to_ne_bytes());
        out[4..8].copy_from_slice(&self.src.to_ne_bytes());
        out[8..16].copy_from_slice(&self.sequentialization_key.to_ne_bytes());
        out[16] = self.packet_type_mask;
        out[17..HEADER_LEN].fill(0);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.write_to(&mut out);
        out
    }

    /// decode from the front of `buf`.
    ///
    /// # panics
    ///
    /// panics if `buf` holds fewer than [`HEADER_LEN`] bytes.
    pub fn read_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= HEADER_LEN, "short header");
        Self {
            len: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            src: ProcId::from_ne_bytes(buf[4..8].try_into().unwrap()),
            sequentialization_key: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
            packet_type_mask: buf[16],
        }
    }

    /// packet participates in call accounting.
    #[inline]
    pub fn is_call(&self) -> bool {
        is_call(self.packet_type_mask)
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        is_control(self.packet_type_mask)
    }
}

#[inline]
pub fn is_call(packet_type_mask: u8) -> bool {
    packet_type_mask & (STANDARD_CALL | FAST_CALL) != 0
}

#[inline]
pub fn is_control(packet_type_mask: u8) -> bool {
    packet_type_mask & CONTROL_PACKET != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let header = PacketHeader {
            len: 1234,
            src: 7,
            sequentialization_key: u64::MAX - 1,
            packet_type_mask: STANDARD_CALL,
        };

        let bytes = header.to_bytes();
        assert_eq!(PacketHeader::read_from(&bytes), header);
    }

    #[test]
    fn test_reserved_bytes_zeroed() {
        let header = PacketHeader {
            len: 0,
            src: 0,
            sequentialization_key: 0,
            packet_type_mask: CONTROL_PACKET,
        };
        let bytes = header.to_bytes();
        assert!(bytes[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_ignores_trailing_payload() {
        let header = PacketHeader {
            len: 5,
            src: 1,
            sequentialization_key: 42,
            packet_type_mask: FAST_CALL,
        };
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(b"hello");
        assert_eq!(PacketHeader::read_from(&wire), header);
    }

    #[test]
    #[should_panic(expected = "short header")]
    fn test_short_buffer_panics() {
        let _ = PacketHeader::read_from(&[0u8; HEADER_LEN - 1]);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(is_call(STANDARD_CALL));
        assert!(is_call(FAST_CALL));
        assert!(!is_call(CONTROL_PACKET));
        assert!(is_control(CONTROL_PACKET));
        // reserved bits ride along without changing the kind
        assert!(is_call(STANDARD_CALL | 0x80));
        assert!(!is_call(0x80));
    }
}
