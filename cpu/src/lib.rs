// plexus-cpu

mod affinity;
mod cache_padded;
mod counter;
mod error;
mod thread_group;

pub use {
    affinity::{cpu_count, set_cpu_affinity},
    cache_padded::{CachePadded, CACHE_LINE_SIZE},
    counter::AtomicCounter,
    error::CpuError,
    thread_group::ThreadGroup,
};
