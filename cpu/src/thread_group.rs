// thread group: spawn named worker threads, join them collectively
//
// each long-running I/O loop (per-peer sender, per-socket receiver,
// accept loop) runs on its own OS thread. the group owns the join
// handles so shutdown can wait for every loop to exit

use crate::affinity::set_cpu_affinity;
use log::warn;
use std::thread::{self, JoinHandle};

#[derive(Default)]
pub struct ThreadGroup {
    handles: Vec<JoinHandle<()>>,
}

impl ThreadGroup {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// spawn a named thread running `f`; the closure is owned by the
    /// thread and dropped when it returns.
    pub fn launch<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("failed to spawn thread");
        self.handles.push(handle);
    }

    /// spawn a named thread pinned to `cpu`. a failed pin is logged and
    /// the thread runs unpinned.
    pub fn launch_on_core<F>(&mut self, name: &str, cpu: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_name = name.to_string();
        self.launch(name, move || {
            if let Err(e) = set_cpu_affinity(cpu) {
                warn!("{}: failed to pin to CPU {}: {}", thread_name, cpu, e);
            }
            f();
        });
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// wait for every thread in the group to finish. panicked threads are
    /// logged, not propagated; the remaining joins still run.
    pub fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle
                .thread()
                .name()
                .unwrap_or("<unnamed>")
                .to_string();
            if handle.join().is_err() {
                warn!("thread {} panicked", name);
            }
        }
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        self.join_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_launch_and_join() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = ThreadGroup::new();

        for i in 0..4 {
            let counter = Arc::clone(&counter);
            group.launch(&format!("worker-{}", i), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(group.len(), 4);
        group.join_all();
        assert!(group.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_launch_on_core() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut group = ThreadGroup::new();

        let flag = Arc::clone(&ran);
        group.launch_on_core("pinned", 0, move || {
            flag.store(1, Ordering::SeqCst);
        });

        group.join_all();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_all_idempotent() {
        let mut group = ThreadGroup::new();
        group.launch("noop", || {});
        group.join_all();
        group.join_all();
    }
}
