//! inter-thread staging structures for per-peer sender loops.
//!
//! two primitives, matching the two sender disciplines:
//!
//! - [`BlockingQueue`]: unbounded MPMC queue of owned entries with a
//!   `stop_blocking` terminal state and a critical-section drain API
//!   that lets one consumer pull several entries under a single lock
//!   acquisition.
//! - [`ByteRing`]: bounded SPSC circular byte buffer whose consumer
//!   borrows contiguous readable arcs without copying.
//!
//! both are shutdown-aware: once stopped they reject new blocking waits
//! but still hand out everything enqueued before the stop, so shutdown
//! can drain in-flight packets.

#![warn(rust_2018_idioms)]

pub mod blocking_queue;
pub mod byte_ring;
pub mod error;

pub use blocking_queue::{BlockingQueue, CriticalSection};
pub use byte_ring::{ByteRing, ReadArc};
pub use error::RingClosed;
