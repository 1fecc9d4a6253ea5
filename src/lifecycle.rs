//! Device lifecycle management with atomic state machine and access tracking.
//!
//! Adapted from the hot-unplug discipline device wrapper crates use for MMIO
//! devices: a single `AtomicU32` packs state and an in-flight access count so
//! that "is this device still usable" and "record one more access" happen as
//! one atomic step, closing the TOCTOU window a pair of separate atomics
//! would leave open.
//!
//! Layout: `[state(8 bits) | access_count(24 bits)]`

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Device lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Device is active and can handle requests.
    Active = 0,
    /// Device is being destroyed; new accesses and cascaded children are rejected.
    Removing = 1,
    /// Device has been destroyed and removed from its registry.
    Removed = 2,
}

/// Combined state and access count in a single atomic value.
#[derive(Default)]
pub struct StateAndCount(AtomicU32);

impl StateAndCount {
    const STATE_SHIFT: u32 = 24;
    const COUNT_MASK: u32 = (1 << Self::STATE_SHIFT) - 1;
    const STATE_ACTIVE: u32 = 0;
    const STATE_REMOVING: u32 = 1;
    const STATE_REMOVED: u32 = 2;

    pub fn new() -> Self {
        Self(AtomicU32::new(Self::STATE_ACTIVE << Self::STATE_SHIFT))
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        match self.0.load(Ordering::Acquire) >> Self::STATE_SHIFT {
            0 => DeviceState::Active,
            1 => DeviceState::Removing,
            _ => DeviceState::Removed,
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire) & Self::COUNT_MASK
    }

    /// Atomically try to increment access count (only if state is Active).
    #[inline]
    pub fn try_acquire(&self) -> Result<(), DeviceState> {
        loop {
            let current = self.0.load(Ordering::Acquire);
            let state = current >> Self::STATE_SHIFT;

            if state != Self::STATE_ACTIVE {
                return Err(match state {
                    1 => DeviceState::Removing,
                    _ => DeviceState::Removed,
                });
            }

            let count = current & Self::COUNT_MASK;
            if count == Self::COUNT_MASK {
                return Err(DeviceState::Active);
            }

            let new_value = (state << Self::STATE_SHIFT) | (count + 1);

            match self.0.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }

    /// Set state to Removing (returns the access count observed at the transition).
    pub fn set_removing(&self) -> u32 {
        loop {
            let current = self.0.load(Ordering::Acquire);
            let count = current & Self::COUNT_MASK;
            let new_value = (Self::STATE_REMOVING << Self::STATE_SHIFT) | count;

            match self.0.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return count,
                Err(_) => continue,
            }
        }
    }

    pub fn set_removed(&self) {
        self.0.store(Self::STATE_REMOVED << Self::STATE_SHIFT, Ordering::Release);
    }
}

/// Wait queue avoiding a pure busy spin in `wait_idle`.
pub struct WaitQueue {
    waiters: AtomicUsize,
    notified: AtomicBool,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            notified: AtomicBool::new(false),
        }
    }

    /// Waits until `condition` is satisfied, or `max_spins` spin rounds elapse
    /// (`0` means wait indefinitely). Returns whether the condition was met.
    pub fn wait_until<F>(&self, mut condition: F, max_spins: usize) -> bool
    where
        F: FnMut() -> bool,
    {
        if condition() {
            return true;
        }

        self.waiters.fetch_add(1, Ordering::AcqRel);
        let mut spins = 0;

        loop {
            if condition() {
                self.waiters.fetch_sub(1, Ordering::AcqRel);
                return true;
            }

            if spins >= max_spins && max_spins > 0 {
                self.waiters.fetch_sub(1, Ordering::AcqRel);
                return false;
            }

            if self.notified.swap(false, Ordering::AcqRel) {
                continue;
            }

            for _ in 0..100 {
                std::hint::spin_loop();
            }
            spins += 100;
        }
    }

    pub fn notify_all(&self) {
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.notified.store(true, Ordering::Release);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks a single device's Active/Removing/Removed state and in-flight
/// access count, so `destroy_device` can wait for outstanding
/// read/write/ioctl calls to finish before tearing the device down.
///
/// ```text
/// ┌─────────┐  begin_removal()   ┌──────────┐  wait_idle()   ┌─────────┐
/// │ Active  │ ──────────────────> │ Removing │ ─────────────> │ Removed │
/// └─────────┘                     └──────────┘                └─────────┘
/// ```
pub struct DeviceLifecycle {
    state_count: StateAndCount,
    idle_waiters: WaitQueue,
}

impl DeviceLifecycle {
    pub fn new() -> Self {
        Self {
            state_count: StateAndCount::new(),
            idle_waiters: WaitQueue::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> DeviceState {
        self.state_count.state()
    }

    #[inline]
    pub fn active_accesses(&self) -> usize {
        self.state_count.count() as usize
    }

    #[inline]
    pub fn try_begin_access(&self) -> bool {
        self.state_count.try_acquire().is_ok()
    }

    #[inline]
    pub fn end_access(&self) {
        self.state_count.release();
        if self.state_count.count() == 0 {
            self.idle_waiters.notify_all();
        }
    }

    /// Transitions Active -> Removing. Returns `false` if already Removing/Removed.
    pub fn begin_removal(&self) -> bool {
        if self.state() == DeviceState::Active {
            self.state_count.set_removing();
            true
        } else {
            false
        }
    }

    /// Blocks until no accesses are in flight. Call after `begin_removal`.
    pub fn wait_idle(&self) {
        self.idle_waiters.wait_until(|| self.state_count.count() == 0, 0);
    }

    pub fn wait_idle_timeout(&self, max_spins: usize) -> bool {
        self.idle_waiters.wait_until(|| self.state_count.count() == 0, max_spins)
    }

    /// Transitions Removing -> Removed. Call only after `wait_idle` returns.
    pub fn complete_removal(&self) {
        self.state_count.set_removed();
    }
}

impl Default for DeviceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLifecycle")
            .field("state", &self.state())
            .field("active_accesses", &self.active_accesses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_and_count_acquire_release() {
        let sc = StateAndCount::new();
        assert!(sc.try_acquire().is_ok());
        assert_eq!(sc.count(), 1);
        sc.release();
        assert_eq!(sc.count(), 0);
    }

    #[test]
    fn state_and_count_removing_rejects_new_acquires() {
        let sc = StateAndCount::new();
        assert!(sc.try_acquire().is_ok());
        let count = sc.set_removing();
        assert_eq!(count, 1);
        assert_eq!(sc.state(), DeviceState::Removing);
        assert!(sc.try_acquire().is_err());
    }

    #[test]
    fn lifecycle_full_removal_cycle() {
        let lifecycle = DeviceLifecycle::new();
        assert!(lifecycle.try_begin_access());
        assert!(lifecycle.begin_removal());
        assert!(!lifecycle.try_begin_access());
        lifecycle.end_access();
        lifecycle.wait_idle();
        lifecycle.complete_removal();
        assert_eq!(lifecycle.state(), DeviceState::Removed);
    }

    #[test]
    fn lifecycle_double_removal_fails() {
        let lifecycle = DeviceLifecycle::new();
        assert!(lifecycle.begin_removal());
        assert!(!lifecycle.begin_removal());
    }
}
