//! unbounded blocking MPMC queue with a terminal state.
//!
//! producers enqueue owned entries; consumers block in [`dequeue`] until
//! an entry arrives or [`stop_blocking`] is called. entries enqueued
//! before the stop are still drained: `dequeue` returns `None` only once
//! the queue is both stopped and empty.
//!
//! the critical-section API exists for consumers that want to pull a
//! batch of entries without releasing and re-acquiring the lock between
//! them. [`dequeue_and_begin_critical_section`] returns the first entry
//! together with a [`CriticalSection`] guard; further entries come from
//! [`CriticalSection::try_dequeue`], and dropping the guard ends the
//! section. producers are never excluded - they briefly contend on the
//! same mutex, exactly as they do for a plain enqueue.
//!
//! [`dequeue`]: BlockingQueue::dequeue
//! [`stop_blocking`]: BlockingQueue::stop_blocking
//! [`dequeue_and_begin_critical_section`]: BlockingQueue::dequeue_and_begin_critical_section

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

struct Inner<T> {
    queue: VecDeque<T>,
    alive: bool,
}

pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    /// signaled on enqueue and on stop_blocking.
    not_empty: Condvar,
    /// signaled whenever the queue transitions to empty.
    emptied: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                alive: true,
            }),
            not_empty: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    /// push an entry and wake one blocked consumer.
    ///
    /// enqueueing after [`stop_blocking`](Self::stop_blocking) is
    /// allowed but pointless: the entry will be drained or dropped with
    /// the queue.
    pub fn enqueue(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// pop the oldest entry, blocking while the queue is empty and alive.
    ///
    /// returns `None` only when the queue is stopped *and* empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.is_empty() && inner.alive {
            inner = self.not_empty.wait(inner).unwrap();
        }
        let item = inner.queue.pop_front();
        if inner.queue.is_empty() {
            self.emptied.notify_all();
        }
        item
    }

    /// non-blocking pop.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.queue.pop_front();
        if item.is_some() && inner.queue.is_empty() {
            self.emptied.notify_all();
        }
        item
    }

    /// blocking pop that keeps the queue locked on success.
    ///
    /// the returned [`CriticalSection`] lets the consumer drain more
    /// entries without re-locking; dropping it ends the section. returns
    /// `None` under the same condition as [`dequeue`](Self::dequeue).
    pub fn dequeue_and_begin_critical_section(&self) -> Option<(T, CriticalSection<'_, T>)> {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.is_empty() && inner.alive {
            inner = self.not_empty.wait(inner).unwrap();
        }
        let item = inner.queue.pop_front()?;
        Some((
            item,
            CriticalSection {
                guard: inner,
                emptied: &self.emptied,
            },
        ))
    }

    /// wake every blocked consumer; all subsequent waits return
    /// immediately. idempotent.
    pub fn stop_blocking(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.alive = false;
        drop(inner);
        self.not_empty.notify_all();
        self.emptied.notify_all();
    }

    /// block until the queue is empty or stopped.
    pub fn wait_until_empty(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.queue.is_empty() && inner.alive {
            inner = self.emptied.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle over the locked queue, produced by
/// [`BlockingQueue::dequeue_and_begin_critical_section`].
pub struct CriticalSection<'a, T> {
    guard: MutexGuard<'a, Inner<T>>,
    emptied: &'a Condvar,
}

impl<T> CriticalSection<'_, T> {
    /// non-blocking pop under the already-held lock.
    pub fn try_dequeue(&mut self) -> Option<T> {
        self.guard.queue.pop_front()
    }
}

impl<T> Drop for CriticalSection<'_, T> {
    fn drop(&mut self) {
        if self.guard.queue.is_empty() {
            self.emptied.notify_all();
        }
    }
}
