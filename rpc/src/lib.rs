//! distributed-control RPC transport.
//!
//! a peer-to-peer message plane for a fixed set of processes: every
//! process connects to every other over persistent TCP, and callers
//! push opaque payloads at a peer with [`DistributedControl::send_data`]
//! while a registered callback receives whatever the peers push back.
//! per-destination buffering and write-combining keep call latency and
//! throughput decoupled from per-syscall costs.
//!
//! the membership set is fixed at [`DistributedControl::init`] and the
//! transport never reconnects; reliability and flow control are
//! whatever TCP provides. delivery is FIFO per ordered source/target
//! pair, with no cross-peer ordering.
//!
//! # example
//!
//! ```no_run
//! use plexus_rpc::{DistributedControl, RpcConfig, STANDARD_CALL};
//! use std::sync::Arc;
//!
//! let machines = vec![
//!     "10.0.0.1:7000".to_string(),
//!     "10.0.0.2:7000".to_string(),
//! ];
//! let callback = Arc::new(|src, _mask, payload: &[u8], _key| {
//!     println!("{} sent {} bytes", src, payload.len());
//! });
//!
//! let dc = DistributedControl::init(&machines, 0, RpcConfig::default(), callback).unwrap();
//! dc.send_data(1, STANDARD_CALL, b"hello").unwrap();
//! dc.shutdown();
//! ```

#![warn(rust_2018_idioms)]

pub mod comm;
pub mod config;
pub mod dc;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;

/// a process's index within the fixed membership set.
pub type ProcId = u32;

pub use comm::{CommLayer, TcpComm, COMM_STREAM};
pub use config::RpcConfig;
pub use dc::DistributedControl;
pub use error::{Result, RpcError};
pub use packet::{PacketHeader, CONTROL_PACKET, FAST_CALL, HEADER_LEN, STANDARD_CALL};
pub use receiver::ReceiveCallback;
pub use sender::SendChannel;

// compact integer framing for collaborators building payloads
pub use plexus_codec as codec;
