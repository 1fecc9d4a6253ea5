//! Watchpoint registry and the address-range/mode/value matching engine.
//!
//! `notify` is the hot path every successful memory access runs through: a
//! snapshot of matching `(action, context)` pairs is computed under lock,
//! the lock is released, and only then are the bound actions executed. The
//! snapshot-then-dispatch split is mandatory — an action may itself write
//! memory and re-enter `notify` on the same thread, and holding the lock
//! across that reentrant call would deadlock even a reentrant mutex once the
//! inner `RefCell` borrow was still outstanding.

use std::collections::HashMap;
use std::sync::OnceLock;

use arrayvec::ArrayVec;
use log::{trace, warn};

use crate::action::{ActionId, ActionRegistry};
use crate::error::{CoreError, CoreResult, EntityKind};
use crate::memory::{AccessType, RegionId};
use crate::sync::ReentrantLock;

/// Hard compile-time ceiling on matches dispatched per `notify` call. A
/// [`crate::config::SystemConfig`] may lower the effective bound but never
/// raise it past this.
const HARD_MATCH_CEILING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchpointId(u32);

impl std::fmt::Display for WatchpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watchpoint#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointKind {
    Read,
    Write,
    Access,
    ValueWrite,
}

impl WatchpointKind {
    fn matches_mode(self, access: AccessType, value: u64, wpvalue: u64) -> bool {
        match self {
            WatchpointKind::Read => access == AccessType::Read,
            WatchpointKind::Write => access == AccessType::Write,
            WatchpointKind::Access => access == AccessType::Read || access == AccessType::Write,
            WatchpointKind::ValueWrite => access == AccessType::Write && value == wpvalue,
        }
    }
}

/// One memory access, passed by reference to predicates and actions. Never
/// retained past the call that produced it.
#[derive(Debug, Clone, Copy)]
pub struct MonitorContext {
    pub region: RegionId,
    pub addr: u64,
    pub size: u8,
    pub value: u64,
    pub access_type: AccessType,
}

struct Watchpoint {
    id: WatchpointId,
    region: RegionId,
    addr: u64,
    size: u8,
    kind: WatchpointKind,
    enabled: bool,
    wpvalue: u64,
    actions: Vec<ActionId>,
}

impl Watchpoint {
    fn overlaps(&self, addr: u64, size: u8) -> bool {
        let wp_end = self.addr + self.size as u64;
        let acc_end = addr + size as u64;
        acc_end > self.addr && addr < wp_end
    }
}

struct State {
    watchpoints: HashMap<WatchpointId, Watchpoint>,
    // Insertion order, independent of the hash map's iteration order, so
    // dispatch and `get_info` honor insertion-order, not hash order.
    order: Vec<WatchpointId>,
    next_id: u32,
    max_matches: usize,
}

/// Registry of watchpoints and the dispatcher that fans out matching
/// accesses to bound actions.
pub struct MonitorEngine {
    state: ReentrantLock<State>,
    actions: OnceLock<std::sync::Arc<ActionRegistry>>,
}

impl MonitorEngine {
    pub(crate) fn new(configured_max_matches: usize) -> Self {
        Self {
            state: ReentrantLock::new(State {
                watchpoints: HashMap::new(),
                order: Vec::new(),
                next_id: 1,
                max_matches: configured_max_matches.min(HARD_MATCH_CEILING).max(1),
            }),
            actions: OnceLock::new(),
        }
    }

    /// Binds the `ActionRegistry` that `notify` dispatches into. Called
    /// exactly once by `System::init`, after both components exist.
    pub(crate) fn bind_action_registry(&self, registry: std::sync::Arc<ActionRegistry>) {
        let _ = self.actions.set(registry);
    }

    pub fn add_watchpoint(
        &self,
        region: RegionId,
        addr: u64,
        size: u8,
        kind: WatchpointKind,
        wpvalue: u64,
    ) -> CoreResult<WatchpointId> {
        if size == 0 || size > 8 {
            return Err(CoreError::InvalidArgument("watchpoint size must be 1..=8".into()));
        }
        self.state.with_mut(|s| {
            let id = WatchpointId(s.next_id);
            s.next_id += 1;
            s.watchpoints.insert(
                id,
                Watchpoint { id, region, addr, size, kind, enabled: true, wpvalue, actions: Vec::new() },
            );
            s.order.push(id);
            trace!("added {id} over {region:?} {addr:#x}+{size}");
            Ok(id)
        })
    }

    pub fn remove_watchpoint(&self, id: WatchpointId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            s.watchpoints
                .remove(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Watchpoint, id.0.to_string()))?;
            s.order.retain(|&x| x != id);
            Ok(())
        })
    }

    pub fn enable(&self, id: WatchpointId) -> CoreResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: WatchpointId) -> CoreResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: WatchpointId, enabled: bool) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let wp = s
                .watchpoints
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Watchpoint, id.0.to_string()))?;
            wp.enabled = enabled;
            Ok(())
        })
    }

    pub fn bind_action(&self, id: WatchpointId, action: ActionId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let wp = s
                .watchpoints
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Watchpoint, id.0.to_string()))?;
            if !wp.actions.contains(&action) {
                wp.actions.push(action);
            }
            Ok(())
        })
    }

    pub fn unbind_action(&self, id: WatchpointId, action: ActionId) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let wp = s
                .watchpoints
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Watchpoint, id.0.to_string()))?;
            let before = wp.actions.len();
            wp.actions.retain(|&a| a != action);
            if wp.actions.len() == before {
                return Err(CoreError::not_found(EntityKind::Action, action.to_string()));
            }
            Ok(())
        })
    }

    pub fn get_info(&self, id: WatchpointId) -> CoreResult<(RegionId, u64, u8, WatchpointKind)> {
        self.state.with(|s| {
            let wp = s
                .watchpoints
                .get(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Watchpoint, id.0.to_string()))?;
            Ok((wp.region, wp.addr, wp.size, wp.kind))
        })
    }

    /// Drops every watchpoint referencing `region`. Called by
    /// `MemoryManager::destroy_region` to keep the watchpoint set free of
    /// dangling region references.
    pub(crate) fn drop_region(&self, region: RegionId) {
        self.state.with_mut(|s| {
            let dead: Vec<WatchpointId> =
                s.watchpoints.values().filter(|w| w.region == region).map(|w| w.id).collect();
            for id in dead {
                s.watchpoints.remove(&id);
                s.order.retain(|&x| x != id);
            }
        });
    }

    /// Unbinds `action` from every watchpoint that references it. Called by
    /// `ActionRegistry::destroy` so a destroyed action stops firing instead
    /// of surfacing `NotFound` on its next match.
    pub(crate) fn unbind_action_everywhere(&self, action: ActionId) {
        self.state.with_mut(|s| {
            for wp in s.watchpoints.values_mut() {
                wp.actions.retain(|&a| a != action);
            }
        });
    }

    /// Computes the matching set for one access and dispatches bound
    /// actions in insertion order. See the module docs for why this is
    /// split into a locked snapshot phase and an unlocked dispatch phase.
    pub fn notify(&self, region: RegionId, addr: u64, size: u8, value: u64, access_type: AccessType) -> CoreResult<()> {
        let matches: ArrayVec<(ActionId, MonitorContext), HARD_MATCH_CEILING> = self.state.with(|s| {
            let mut buf: ArrayVec<(ActionId, MonitorContext), HARD_MATCH_CEILING> = ArrayVec::new();
            let mut dropped = 0usize;
            for id in &s.order {
                if buf.len() >= s.max_matches {
                    break;
                }
                let wp = match s.watchpoints.get(id) {
                    Some(wp) => wp,
                    None => continue,
                };
                if !wp.enabled || wp.region != region {
                    continue;
                }
                if !wp.overlaps(addr, size) {
                    continue;
                }
                if !wp.kind.matches_mode(access_type, value, wp.wpvalue) {
                    continue;
                }
                let ctx = MonitorContext { region, addr, size, value, access_type };
                for action in &wp.actions {
                    if buf.len() >= s.max_matches {
                        dropped += 1;
                        continue;
                    }
                    buf.push((*action, ctx));
                }
            }
            if dropped > 0 {
                warn!("dropped {dropped} watchpoint matches over the {}-match cap", s.max_matches);
            }
            buf
        });

        let registry = self.actions.get().expect("ActionRegistry not bound before first notify");
        for (action, ctx) in &matches {
            // Monitor dispatch continues past individual action failures;
            // they are observational noise here, unlike rule evaluation.
            if let Err(err) = registry.execute(*action, ctx) {
                warn!("action {action} failed during notify: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn region(n: u64) -> RegionId {
        crate::memory::test_support::fake_region_id(n)
    }

    fn wired() -> (Arc<MonitorEngine>, Arc<ActionRegistry>) {
        let monitor = Arc::new(MonitorEngine::new(32));
        let actions = Arc::new(ActionRegistry::new());
        monitor.bind_action_registry(actions.clone());
        (monitor, actions)
    }

    #[test]
    fn write_watchpoint_fires_on_matching_write() {
        let (monitor, actions) = wired();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let action = actions
            .create_callback(move |_ctx| {
                counter2.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
        let r = region(1);
        let wp = monitor.add_watchpoint(r, 0x1000, 4, WatchpointKind::Write, 0).unwrap();
        monitor.bind_action(wp, action).unwrap();
        monitor.notify(r, 0x1000, 4, 0x12345678, AccessType::Write).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn value_write_gates_on_exact_value() {
        let (monitor, actions) = wired();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let action = actions.create_callback(move |_ctx| {
            counter2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }).unwrap();
        let r = region(1);
        let wp = monitor.add_watchpoint(r, 0x1000, 2, WatchpointKind::ValueWrite, 30).unwrap();
        monitor.bind_action(wp, action).unwrap();
        monitor.notify(r, 0x1000, 2, 20, AccessType::Write).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        monitor.notify(r, 0x1000, 2, 30, AccessType::Write).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disabled_watchpoint_does_not_fire() {
        let (monitor, actions) = wired();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let action = actions.create_callback(move |_ctx| {
            counter2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }).unwrap();
        let r = region(1);
        let wp = monitor.add_watchpoint(r, 0, 4, WatchpointKind::Write, 0).unwrap();
        monitor.bind_action(wp, action).unwrap();
        monitor.notify(r, 0, 4, 1, AccessType::Write).unwrap();
        monitor.disable(wp).unwrap();
        monitor.notify(r, 0, 4, 2, AccessType::Write).unwrap();
        monitor.enable(wp).unwrap();
        monitor.notify(r, 0, 4, 3, AccessType::Write).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn non_overlapping_access_does_not_match() {
        let (monitor, actions) = wired();
        let action = actions.create_callback(|_| Ok(())).unwrap();
        let r = region(1);
        let wp = monitor.add_watchpoint(r, 0x1000, 4, WatchpointKind::Write, 0).unwrap();
        monitor.bind_action(wp, action).unwrap();
        // Access at 0x1004..0x1008 does not overlap watchpoint 0x1000..0x1004.
        monitor.notify(r, 0x1004, 4, 1, AccessType::Write).unwrap();
        let (_, _, _, kind) = monitor.get_info(wp).unwrap();
        assert_eq!(kind, WatchpointKind::Write);
    }

    #[test]
    fn unbind_action_everywhere_stops_future_dispatch() {
        let (monitor, actions) = wired();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let action = actions.create_callback(move |_ctx| {
            counter2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }).unwrap();
        let r = region(1);
        let wp = monitor.add_watchpoint(r, 0, 4, WatchpointKind::Write, 0).unwrap();
        monitor.bind_action(wp, action).unwrap();
        monitor.unbind_action_everywhere(action);
        monitor.notify(r, 0, 4, 1, AccessType::Write).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
