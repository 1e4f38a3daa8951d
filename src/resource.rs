//! Blocking-acquire resource pool. Generalizes the worktree/user-token
//! pool from the teacher's sibling fork (`cip999-limmat/src/resource.rs`)
//! to a single resource kind: worker slots. `crate::worker_pool::WorkerPool`
//! uses this to cap the number of concurrently running workers at `P`
//! without under- or over-subscribing.

use std::mem::ManuallyDrop;

use async_condvar_fair::Condvar;
use parking_lot::Mutex;

/// A pool of `capacity` interchangeable slots. Acquiring blocks until a
/// slot is free; the slot is returned to the pool when the guard drops.
#[derive(Debug)]
pub struct SlotPool {
    cond: Condvar,
    available: Mutex<usize>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            cond: Condvar::new(),
            available: Mutex::new(capacity),
        }
    }

    /// Blocks until a slot is free, then takes it.
    #[expect(clippy::await_holding_lock)]
    pub async fn acquire(&self) -> Slot<'_> {
        let mut guard = self.available.lock();
        loop {
            if *guard > 0 {
                *guard -= 1;
                return Slot { pool: self };
            }
            guard = self.cond.wait(guard).await;
        }
    }

    /// Non-blocking acquire, used when the caller needs to know up front
    /// whether dispatching another worker would exceed the cap.
    pub fn try_acquire(&self) -> Option<Slot<'_>> {
        let mut guard = self.available.lock();
        if *guard > 0 {
            *guard -= 1;
            Some(Slot { pool: self })
        } else {
            None
        }
    }

    fn release(&self) {
        let mut guard = self.available.lock();
        *guard += 1;
        self.cond.notify_all();
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }
}

/// A held slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct Slot<'a> {
    pool: &'a SlotPool,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// Tokens taken together from more than one pool, used when a worker
/// needs both a worker slot and (say) a host API rate-limit token. Not
/// currently exercised by more than one pool at once, but kept general
/// the way the teacher's own `Resources` wraps an arbitrary key set.
#[derive(Debug)]
pub struct MultiSlot<'a> {
    slots: ManuallyDrop<Vec<Slot<'a>>>,
}

impl<'a> MultiSlot<'a> {
    pub fn new(slots: Vec<Slot<'a>>) -> Self {
        Self {
            slots: ManuallyDrop::new(slots),
        }
    }
}

impl Drop for MultiSlot<'_> {
    fn drop(&mut self) {
        // SAFETY: fields are never accessed again after this.
        unsafe { ManuallyDrop::drop(&mut self.slots) }
    }
}

#[cfg(test)]
mod tests {
    use std::task::{Context, Poll};

    use futures::{pin_mut, task::noop_waker, Future};

    use super::*;

    fn is_pending<F: Future>(fut: F) -> bool
    where
        F::Output: std::fmt::Debug,
    {
        pin_mut!(fut);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        matches!(fut.as_mut().poll(&mut cx), Poll::Pending)
    }

    #[test]
    fn try_acquire_respects_capacity() {
        let pool = SlotPool::new(1);
        let slot = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(slot);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn acquire_blocks_when_exhausted() {
        let pool = SlotPool::new(1);
        let _slot = pool.try_acquire().unwrap();
        assert!(is_pending(pool.acquire()));
    }

    #[tokio::test]
    async fn acquire_unblocks_after_release() {
        let pool = SlotPool::new(1);
        let slot = pool.acquire().await;
        drop(slot);
        let _slot2 = pool.acquire().await;
        assert_eq!(pool.available(), 0);
    }
}
