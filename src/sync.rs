//! Reentrant locking primitive shared by every component.
//!
//! Each of the five core components (DeviceRegistry, MemoryManager,
//! MonitorEngine, ActionRegistry, RuleEngine) guards its state with a
//! mutual-exclusion primitive that a single thread may re-acquire without
//! deadlocking: user callbacks dispatched through the
//! facade commonly re-enter the component that issued them (an action
//! callback that writes memory re-enters `MemoryManager`, which re-enters
//! `MonitorEngine`).
//!
//! [`ReentrantLock<T>`] wraps `parking_lot::ReentrantMutex<RefCell<T>>`,
//! which gives same-thread recursive locking for free. The two-phase
//! dispatch discipline used everywhere in this crate — snapshot state under
//! a short `RefCell` borrow, drop the borrow, *then* invoke user code —
//! means a reentrant call from within a callback never finds an
//! outstanding `RefCell` borrow, so the combination never panics on
//! `borrow_mut`.

use std::cell::RefCell;

use parking_lot::ReentrantMutex;

/// A same-thread-reentrant lock around `T`.
pub struct ReentrantLock<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

impl<T> ReentrantLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Runs `f` with a shared borrow of the guarded value.
    ///
    /// `f` must not itself try to reentrantly borrow `self` mutably while
    /// holding the result of this call — in practice this means: snapshot
    /// what you need, return, and only then call out to user code.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock();
        let value = guard.borrow();
        f(&value)
    }

    /// Runs `f` with a mutable borrow of the guarded value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.inner.lock();
        let mut value = guard.borrow_mut();
        f(&mut value)
    }
}

impl<T: Default> Default for ReentrantLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// SAFETY: `ReentrantMutex` is `Sync` when `T: Send`, and `RefCell<T>` is
// `Send` whenever `T: Send`. We never hand out a reference that outlives
// the lock held by `with`/`with_mut`, so no `RefCell` borrow crosses a
// thread boundary.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_access_from_same_thread_works() {
        let lock = ReentrantLock::new(0u32);
        lock.with_mut(|v| *v += 1);
        let doubled = lock.with(|v| {
            // Reentrant read while a (already-released) borrow happened above.
            lock.with(|v2| v + *v2)
        });
        assert_eq!(doubled, 2);
    }
}
