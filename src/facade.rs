//! `System`: the facade wiring the five components in dependency order and
//! exposing the crate's stable entry surface.

use std::any::Any;
use std::sync::Arc;

use log::info;

use crate::action::{ActionId, ActionKind, ActionRegistry};
use crate::config::{DeviceConfig, SystemConfig};
use crate::device::{DeviceId, DeviceOps};
use crate::device_registry::DeviceRegistry;
use crate::error::CoreResult;
use crate::memory::{MemoryManager, RegionFlags, RegionId};
use crate::monitor::{MonitorContext, MonitorEngine, WatchpointId, WatchpointKind};
use crate::rule::{RuleEngine, RuleId};

/// The top-level facade: constructs, wires, and tears down the five
/// components, and forwards their operations.
///
/// Construction order mirrors the components' dependency order:
/// `DeviceRegistry`, then `MonitorEngine`, then `MemoryManager` wired
/// to it, then `ActionRegistry`, then `RuleEngine`. Two back-references
/// (`DeviceRegistry` → `MemoryManager` for cascading destroy,
/// `MonitorEngine`/`ActionRegistry` → their respective later-constructed
/// peers) are bound once all five exist, via each component's own
/// `OnceLock`.
pub struct System {
    devices: Arc<DeviceRegistry>,
    memory: Arc<MemoryManager>,
    monitor: Arc<MonitorEngine>,
    actions: Arc<ActionRegistry>,
    rules: Arc<RuleEngine>,
}

impl System {
    /// Constructs the five components in dependency order and wires their
    /// cross-references.
    pub fn init(config: SystemConfig) -> System {
        let devices = Arc::new(DeviceRegistry::new());
        let monitor = Arc::new(MonitorEngine::new(config.max_matches_per_notification));
        let memory = Arc::new(MemoryManager::new(monitor.clone()));
        let actions = Arc::new(ActionRegistry::new());
        monitor.bind_action_registry(actions.clone());
        let rules = Arc::new(RuleEngine::new(actions.clone(), config.max_actions_per_rule_eval));
        actions.bind_dependents(monitor.clone(), rules.clone());
        devices.bind_memory_manager(memory.clone());

        info!("system initialized");
        System { devices, memory, monitor, actions, rules }
    }

    /// Tears everything down in reverse dependency order: rules, actions,
    /// watchpoints are dropped implicitly with their owning registries (no
    /// explicit per-entry enumeration is required since every component is
    /// dropped wholesale), then every device is destroyed (cascading its
    /// regions), then every device type is unregistered.
    ///
    /// Consumes `self`, so calling it twice is a compile error — the
    /// "safe to call once per init" contract is enforced by the type
    /// system rather than at runtime.
    pub fn cleanup(self) -> CoreResult<()> {
        for id in self.devices.all_device_ids() {
            self.devices.destroy_device(id)?;
        }
        for type_name in self.devices.all_type_names() {
            self.devices.unregister_type(&type_name)?;
        }
        info!("system cleaned up");
        Ok(())
    }

    /// Returns this crate's own `(major, minor, patch)` version.
    pub fn get_version() -> (u32, u32, u32) {
        const VERSION: &str = env!("CARGO_PKG_VERSION");
        let mut parts = VERSION.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        (parts.next().unwrap_or(0), parts.next().unwrap_or(0), parts.next().unwrap_or(0))
    }

    /// Placeholder: all dispatch is currently synchronous within the
    /// originating access. Reserved for a future asynchronous dispatch mode.
    pub fn process_events(&self) -> CoreResult<()> {
        Ok(())
    }

    // ---- DeviceRegistry forwarding ----

    pub fn register_device_type<O: DeviceOps + 'static>(
        &self,
        name: &str,
        ops: O,
        user_data: Option<Box<dyn Any + Send + Sync>>,
    ) -> CoreResult<()> {
        self.devices.register_type(name, ops, user_data)
    }

    pub fn unregister_device_type(&self, name: &str) -> CoreResult<()> {
        self.devices.unregister_type(name)
    }

    pub fn create_device(&self, type_name: &str, instance_name: &str, config: &DeviceConfig) -> CoreResult<DeviceId> {
        self.devices.create_device(type_name, instance_name, config)
    }

    pub fn destroy_device(&self, id: DeviceId) -> CoreResult<()> {
        self.devices.destroy_device(id)
    }

    pub fn find_device_by_name(&self, name: &str) -> Option<DeviceId> {
        self.devices.find_by_name(name)
    }

    pub fn reset_device(&self, id: DeviceId) -> CoreResult<()> {
        self.devices.reset(id)
    }

    pub fn save_device_state(&self, id: DeviceId) -> CoreResult<Vec<u8>> {
        self.devices.save_state(id)
    }

    pub fn load_device_state(&self, id: DeviceId, bytes: &[u8]) -> CoreResult<()> {
        self.devices.load_state(id, bytes)
    }

    pub fn device_ioctl(&self, id: DeviceId, cmd: u32, arg: u64) -> CoreResult<u64> {
        self.devices.ioctl(id, cmd, arg)
    }

    // ---- MemoryManager forwarding ----

    pub fn create_region(&self, device: DeviceId, name: &str, base_addr: u64, size: u64, flags: RegionFlags) -> CoreResult<RegionId> {
        self.memory.create_region(device, name, base_addr, size, flags)
    }

    pub fn destroy_region(&self, region: RegionId) -> CoreResult<()> {
        self.memory.destroy_region(region)
    }

    pub fn find_region(&self, device: DeviceId, name: &str) -> Option<RegionId> {
        self.memory.find_region(device, name)
    }

    pub fn read_u8(&self, region: RegionId, addr: u64) -> CoreResult<u8> {
        self.memory.read_u8(region, addr)
    }
    pub fn read_u16(&self, region: RegionId, addr: u64) -> CoreResult<u16> {
        self.memory.read_u16(region, addr)
    }
    pub fn read_u32(&self, region: RegionId, addr: u64) -> CoreResult<u32> {
        self.memory.read_u32(region, addr)
    }
    pub fn read_u64(&self, region: RegionId, addr: u64) -> CoreResult<u64> {
        self.memory.read_u64(region, addr)
    }
    pub fn write_u8(&self, region: RegionId, addr: u64, value: u8) -> CoreResult<()> {
        self.memory.write_u8(region, addr, value)
    }
    pub fn write_u16(&self, region: RegionId, addr: u64, value: u16) -> CoreResult<()> {
        self.memory.write_u16(region, addr, value)
    }
    pub fn write_u32(&self, region: RegionId, addr: u64, value: u32) -> CoreResult<()> {
        self.memory.write_u32(region, addr, value)
    }
    pub fn write_u64(&self, region: RegionId, addr: u64, value: u64) -> CoreResult<()> {
        self.memory.write_u64(region, addr, value)
    }
    pub fn read_buffer(&self, region: RegionId, addr: u64, out: &mut [u8]) -> CoreResult<()> {
        self.memory.read_buffer(region, addr, out)
    }
    pub fn write_buffer(&self, region: RegionId, addr: u64, bytes: &[u8]) -> CoreResult<()> {
        self.memory.write_buffer(region, addr, bytes)
    }

    // ---- MonitorEngine forwarding ----

    pub fn add_watchpoint(&self, region: RegionId, addr: u64, size: u8, kind: WatchpointKind, wpvalue: u64) -> CoreResult<WatchpointId> {
        self.monitor.add_watchpoint(region, addr, size, kind, wpvalue)
    }
    pub fn remove_watchpoint(&self, id: WatchpointId) -> CoreResult<()> {
        self.monitor.remove_watchpoint(id)
    }
    pub fn enable_watchpoint(&self, id: WatchpointId) -> CoreResult<()> {
        self.monitor.enable(id)
    }
    pub fn disable_watchpoint(&self, id: WatchpointId) -> CoreResult<()> {
        self.monitor.disable(id)
    }
    pub fn bind_watchpoint_action(&self, id: WatchpointId, action: ActionId) -> CoreResult<()> {
        self.monitor.bind_action(id, action)
    }
    pub fn unbind_watchpoint_action(&self, id: WatchpointId, action: ActionId) -> CoreResult<()> {
        self.monitor.unbind_action(id, action)
    }
    pub fn watchpoint_info(&self, id: WatchpointId) -> CoreResult<(RegionId, u64, u8, WatchpointKind)> {
        self.monitor.get_info(id)
    }

    // ---- ActionRegistry forwarding ----

    pub fn create_callback_action<F>(&self, f: F) -> CoreResult<ActionId>
    where
        F: Fn(&MonitorContext) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.actions.create_callback(f)
    }
    pub fn create_script_action(&self, path: impl Into<String>) -> CoreResult<ActionId> {
        self.actions.create_script(path)
    }
    pub fn create_command_action(&self, cmd: impl Into<String>) -> CoreResult<ActionId> {
        self.actions.create_command(cmd)
    }
    pub fn destroy_action(&self, id: ActionId) -> CoreResult<()> {
        self.actions.destroy(id)
    }
    pub fn action_type(&self, id: ActionId) -> CoreResult<ActionKind> {
        self.actions.get_type(id)
    }
    pub fn set_action_user_data(&self, id: ActionId, data: Box<dyn Any + Send + Sync>) -> CoreResult<()> {
        self.actions.set_user_data(id, data)
    }
    pub fn with_action_user_data<R>(&self, id: ActionId, f: impl FnOnce(Option<&dyn Any>) -> R) -> CoreResult<R> {
        self.actions.with_user_data(id, f)
    }

    // ---- RuleEngine forwarding ----

    pub fn create_rule(&self, name: &str) -> CoreResult<RuleId> {
        self.rules.create(name)
    }
    pub fn destroy_rule(&self, id: RuleId) -> CoreResult<()> {
        self.rules.destroy(id)
    }
    pub fn enable_rule(&self, id: RuleId) -> CoreResult<()> {
        self.rules.enable(id)
    }
    pub fn disable_rule(&self, id: RuleId) -> CoreResult<()> {
        self.rules.disable(id)
    }
    pub fn set_rule_condition<F>(&self, id: RuleId, predicate: F) -> CoreResult<()>
    where
        F: Fn(&MonitorContext) -> bool + Send + Sync + 'static,
    {
        self.rules.set_condition(id, predicate)
    }
    pub fn add_rule_action(&self, id: RuleId, action: ActionId) -> CoreResult<()> {
        self.rules.add_action(id, action)
    }
    pub fn remove_rule_action(&self, id: RuleId, action: ActionId) -> CoreResult<()> {
        self.rules.remove_action(id, action)
    }
    pub fn evaluate_rule(&self, id: RuleId, ctx: &MonitorContext) -> CoreResult<()> {
        self.rules.evaluate(id, ctx)
    }
    pub fn find_rule_by_name(&self, name: &str) -> Option<RuleId> {
        self.rules.find_by_name(name)
    }
    pub fn rule_name(&self, id: RuleId) -> CoreResult<String> {
        self.rules.get_name(id)
    }
    pub fn set_rule_user_data(&self, id: RuleId, data: Box<dyn Any + Send + Sync>) -> CoreResult<()> {
        self.rules.set_user_data(id, data)
    }
    pub fn with_rule_user_data<R>(&self, id: RuleId, f: impl FnOnce(Option<&dyn Any>) -> R) -> CoreResult<R> {
        self.rules.with_user_data(id, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DevicePayload;

    struct NullDevice;
    impl DeviceOps for NullDevice {
        fn create(&self, _id: DeviceId, _name: &str, _config: &DeviceConfig) -> CoreResult<DevicePayload> {
            Ok(Box::new(()))
        }
    }

    #[test]
    fn init_wires_all_components_and_cleanup_consumes_self() {
        let system = System::init(SystemConfig::default());
        system.register_device_type("null", NullDevice, None).unwrap();
        let device = system.create_device("null", "d0", &DeviceConfig::new()).unwrap();
        assert_eq!(system.find_device_by_name("d0"), Some(device));
        system.cleanup().unwrap();
    }

    #[test]
    fn version_is_well_formed() {
        let (_major, _minor, _patch) = System::get_version();
    }
}
