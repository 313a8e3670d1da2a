//! Fixed-capacity, reference-counted slab allocator.
//!
//! Every slot is pre-allocated at construction (`Pool::new` fills the backing storage
//! once) and never resized afterward. Allocation hands back a `PoolRef<T>`, an RAII
//! handle whose `Clone` retains (bumps the refcount) and whose `Drop` frees (decrements
//! the refcount, running the destructor and returning the slot to the free list on the
//! 1 -> 0 transition). This replaces the original's manual retain/free pairing and
//! header/trailer sanity magic with a handle the compiler accounts for — the corruption
//! class those magic numbers guarded against (use of a freed slot) can't happen once the
//! only way to reach `T` is through a live `PoolRef<T>`.
//!
//! Destructors are per-allocation, not per-pool: each live allocation carries its own
//! optional destructor, installed at `alloc_with_destructor` or later via
//! `PoolRef::set_destructor`, exactly as the original's `pool_set_destructor(p, fn, ctx)`
//! targets one live pointer rather than every slot in the pool.

use crate::error::{ FluxError, Result };
use crate::queue::BoundedQueue;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::Arc;
use std::time::Duration;

type Destructor<T> = Box<dyn FnMut(&mut T) + Send>;

struct Slot<T> {
    value: UnsafeCell<T>,
    refcount: AtomicUsize,
    destructor: Mutex<Option<Destructor<T>>>,
}

// SAFETY: access to `value` is only ever granted through a `PoolRef`, which is the sole
// path to a live slot; the free list (`BoundedQueue<usize>`) only hands out an index
// once its refcount has dropped to zero, so there is never more than one writer's worth
// of interior-mutable access live concurrently with readers of a different generation.
unsafe impl<T: Send> Sync for Slot<T> {}

struct Inner<T> {
    slots: Box<[Slot<T>]>,
    free: BoundedQueue<usize>,
    allocated: AtomicUsize,
}

/// A fixed-capacity pool of `T`, pre-filled at construction.
#[derive(Clone)]
pub struct Pool<T>(Arc<Inner<T>>);

impl<T> Pool<T> {
    /// Build a pool of `capacity` slots, each initialized via `init`.
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Result<Self> {
        if capacity == 0 {
            return Err(FluxError::config("pool capacity must be non-zero"));
        }
        let free_capacity = capacity.next_power_of_two();
        let free = BoundedQueue::new(free_capacity)?;
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                value: UnsafeCell::new(init()),
                refcount: AtomicUsize::new(0),
                destructor: Mutex::new(None),
            });
            free.try_enqueue(i).expect("freshly sized free list has room for every slot");
        }
        Ok(Self(Arc::new(Inner { slots: slots.into_boxed_slice(), free, allocated: AtomicUsize::new(0) })))
    }

    pub fn capacity(&self) -> usize {
        self.0.slots.len()
    }

    pub fn allocated(&self) -> usize {
        self.0.allocated.load(Ordering::Relaxed)
    }

    /// Acquire a slot, blocking up to `timeout` while the pool is exhausted.
    pub fn alloc(&self, timeout: Option<Duration>) -> Option<PoolRef<T>> {
        self.alloc_with_destructor(timeout, None)
    }

    /// Acquire a slot with a destructor that runs exactly once, on this allocation's
    /// refcount reaching zero, before the slot becomes available for reuse.
    pub fn alloc_with_destructor(
        &self,
        timeout: Option<Duration>,
        destructor: Option<Destructor<T>>
    ) -> Option<PoolRef<T>> {
        let index = self.0.free.dequeue(timeout)?;
        let slot = &self.0.slots[index];
        slot.refcount.store(1, Ordering::Release);
        *slot.destructor.lock() = destructor;
        self.0.allocated.fetch_add(1, Ordering::Relaxed);
        Some(PoolRef { pool: self.0.clone(), index })
    }

    /// Acquire a slot without blocking.
    pub fn try_alloc(&self) -> Result<PoolRef<T>> {
        self.alloc(Some(Duration::ZERO)).ok_or(FluxError::PoolExhausted { capacity: self.capacity() })
    }
}

/// An RAII handle to a live pool slot. Cloning retains; dropping frees.
pub struct PoolRef<T> {
    pool: Arc<Inner<T>>,
    index: usize,
}

impl<T> PoolRef<T> {
    fn slot(&self) -> &Slot<T> {
        &self.pool.slots[self.index]
    }

    /// Install (or replace) this allocation's destructor. Takes effect for whichever
    /// clone of this `PoolRef` happens to trigger the 1 -> 0 transition.
    pub fn set_destructor(&self, destructor: impl FnMut(&mut T) + Send + 'static) {
        *self.slot().destructor.lock() = Some(Box::new(destructor));
    }

    /// Remove this allocation's destructor, if any.
    pub fn clear_destructor(&self) {
        *self.slot().destructor.lock() = None;
    }
}

impl<T> std::ops::Deref for PoolRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: a live PoolRef guarantees refcount >= 1, so the slot is not on the
        // free list and no other code path can obtain a &mut to it concurrently except
        // through `Pool::alloc`'s re-initialization after refcount has reached zero,
        // which cannot happen while this PoolRef exists.
        unsafe { &*self.slot().value.get() }
    }
}

impl<T> std::ops::DerefMut for PoolRef<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.slot().value.get() }
    }
}

impl<T> Clone for PoolRef<T> {
    fn clone(&self) -> Self {
        self.slot().refcount.fetch_add(1, Ordering::Relaxed);
        Self { pool: self.pool.clone(), index: self.index }
    }
}

impl<T> Drop for PoolRef<T> {
    fn drop(&mut self) {
        if self.slot().refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(mut destructor) = self.slot().destructor.lock().take() {
                destructor(unsafe { &mut *self.slot().value.get() });
            }
            self.pool.allocated.fetch_sub(1, Ordering::Relaxed);
            let _ = self.pool.free.enqueue(self.index, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn alloc_and_free_round_trips_capacity() {
        let pool = Pool::new(2, || 0u32).unwrap();
        assert_eq!(pool.allocated(), 0);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert_eq!(pool.allocated(), 2);
        assert!(pool.try_alloc().is_err());
        drop(a);
        assert_eq!(pool.allocated(), 1);
        let c = pool.try_alloc().unwrap();
        assert_eq!(pool.allocated(), 2);
        drop(b);
        drop(c);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn clone_retains_and_destructor_runs_once() {
        static DROPS: AtomicU32 = AtomicU32::new(0);
        let pool = Pool::new(1, || 0u32).unwrap();
        let a = pool.try_alloc().unwrap();
        a.set_destructor(|_| {
            DROPS.fetch_add(1, Ordering::Relaxed);
        });
        let b = a.clone();
        drop(a);
        assert_eq!(DROPS.load(Ordering::Relaxed), 0);
        drop(b);
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn destructor_is_per_allocation_not_per_pool() {
        static DROPS: AtomicU32 = AtomicU32::new(0);
        let pool = Pool::new(1, || 0u32).unwrap();
        let a = pool.try_alloc().unwrap();
        a.set_destructor(|_| {
            DROPS.fetch_add(1, Ordering::Relaxed);
        });
        drop(a);
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        // A fresh allocation of the same (now-reused) slot must not inherit the
        // previous allocation's destructor.
        let b = pool.try_alloc().unwrap();
        drop(b);
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn deref_mut_writes_are_visible_through_clone() {
        let pool = Pool::new(1, || 0u32).unwrap();
        let mut a = pool.try_alloc().unwrap();
        *a = 42;
        let b = a.clone();
        assert_eq!(*b, 42);
    }
}
