//! Bounded, blocking pool of reusable workers.
//!
//! At most `capacity` items exist at once. [`BoundedPool::acquire`] blocks
//! while all of them are checked out, which caps how many expensive helper
//! processes run concurrently. Items go back to the pool when their
//! [`Pooled`] guard drops, after the factory has validated them; invalid
//! items are destroyed and their slot is freed for a fresh one.

use crate::{IndexerError, Result};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};

pub trait PoolFactory<T>: Send + Sync {
    fn create(&self) -> Result<T>;

    /// Called on every return. `false` destroys the item instead of
    /// keeping it.
    fn validate(&self, item: &mut T) -> bool;

    fn destroy(&self, item: T) {
        drop(item);
    }
}

pub struct BoundedPool<T> {
    capacity: usize,
    factory: Box<dyn PoolFactory<T>>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

struct PoolState<T> {
    idle: Vec<T>,
    /// Items alive, idle or checked out.
    live: usize,
    closed: bool,
}

/// Scoped checkout; returns the item to its pool on drop.
pub struct Pooled<'a, T> {
    pool: &'a BoundedPool<T>,
    item: Option<T>,
}

impl<T> BoundedPool<T> {
    pub fn new(capacity: usize, factory: impl PoolFactory<T> + 'static) -> Self {
        Self {
            capacity: capacity.max(1),
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live
    }

    /// Block until an item is available.
    pub fn acquire(&self) -> Result<Pooled<'_, T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(IndexerError::PoolClosed);
            }
            if let Some(item) = state.idle.pop() {
                return Ok(self.guard(item));
            }
            if state.live < self.capacity {
                state.live += 1;
                // Creating may spawn a process; do not hold the lock for it.
                drop(state);
                return match self.factory.create() {
                    Ok(item) => Ok(self.guard(item)),
                    Err(err) => {
                        self.state.lock().live -= 1;
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }
            self.available.wait(&mut state);
        }
    }

    /// Destroy idle items and refuse further checkouts. Items still checked
    /// out are destroyed when they come back.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            idle
        };
        for item in idle {
            self.factory.destroy(item);
        }
        self.available.notify_all();
    }

    fn guard(&self, item: T) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            item: Some(item),
        }
    }

    fn release(&self, mut item: T) {
        let keep = self.factory.validate(&mut item);
        let mut state = self.state.lock();
        if keep && !state.closed {
            state.idle.push(item);
            drop(state);
        } else {
            state.live -= 1;
            drop(state);
            self.factory.destroy(item);
        }
        self.available.notify_one();
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
