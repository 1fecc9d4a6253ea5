//! # devicesim
//!
//! An instrumented memory subsystem: a host-side simulation framework for a
//! collection of interacting hardware devices, each exposing named memory
//! regions that client code reads and writes through, with watchpoints,
//! actions, and rules layered on top to observe and react to those accesses.
//!
//! ## Architecture
//!
//! Five components, each owning one catalog behind a reentrant lock, wired
//! together by [`System`]:
//!
//! - `DeviceRegistry`: device types (behavioral vtables) and instances.
//! - `MemoryManager`: named, permission-checked memory regions owned by a
//!   device, and the width-specific read/write primitives over them.
//! - `MonitorEngine`: watchpoints over a region's address range, and the
//!   bounded-match dispatch that fires on a matching access.
//! - `ActionRegistry`: callback/script/shell-command effects a watchpoint
//!   or rule triggers.
//! - `RuleEngine`: named, predicate-gated groupings of actions, evaluated
//!   explicitly (never auto-triggered by a watchpoint match).
//!
//! Every component accepts reentrant calls from within a dispatched action
//! or rule predicate — the common case of an action itself writing memory
//! and re-triggering a watchpoint on the same thread — and never holds its
//! lock while running user code.
//!
//! ## Example
//!
//! ```
//! use devicesim::{DeviceConfig, DeviceId, DeviceOps, DevicePayload, RegionFlags, System, SystemConfig, WatchpointKind};
//!
//! struct Led;
//! impl DeviceOps for Led {
//!     fn create(&self, _id: DeviceId, _name: &str, _config: &DeviceConfig) -> Result<DevicePayload, devicesim::CoreError> {
//!         Ok(Box::new(()))
//!     }
//! }
//!
//! let system = System::init(SystemConfig::default());
//! system.register_device_type("led", Led, None).unwrap();
//! let device = system.create_device("led", "led0", &DeviceConfig::new()).unwrap();
//! let region = system
//!     .create_region(device, "regs", 0x1000, 4, RegionFlags::READ | RegionFlags::WRITE)
//!     .unwrap();
//! let action = system
//!     .create_callback_action(|ctx| {
//!         println!("write of {:#x} at {:#x}", ctx.value, ctx.addr);
//!         Ok(())
//!     })
//!     .unwrap();
//! let watchpoint = system
//!     .add_watchpoint(region, 0x1000, 4, WatchpointKind::Write, 0)
//!     .unwrap();
//! system.bind_watchpoint_action(watchpoint, action).unwrap();
//! system.write_u32(region, 0x1000, 0xdead_beef).unwrap();
//! system.cleanup().unwrap();
//! ```

mod action;
mod config;
mod device;
mod device_registry;
mod error;
mod facade;
mod lifecycle;
mod memory;
mod monitor;
mod rule;
mod sync;

pub use action::{ActionCallback, ActionId, ActionKind};
pub use config::{DeviceConfig, SystemConfig};
pub use device::{Device, DeviceId, DeviceOps, DevicePayload, DeviceType};
pub use error::{CoreError, CoreResult, EntityKind};
pub use facade::System;
pub use lifecycle::DeviceState;
pub use memory::{AccessType, MemoryRegion, RegionFlags, RegionId};
pub use monitor::{MonitorContext, WatchpointId, WatchpointKind};
pub use rule::{RuleId, RulePredicate};
