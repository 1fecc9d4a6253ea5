//! Catalog of device types and instances, and the cascading-destroy logic
//! that ties device lifetime to its owned memory regions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::{debug, info};

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceId, DeviceIdAllocator, DeviceOps, DevicePayload, DeviceType};
use crate::error::{CoreError, CoreResult, EntityKind};
use crate::lifecycle::{DeviceLifecycle, DeviceState};
use crate::memory::MemoryManager;
use crate::sync::ReentrantLock;

struct State {
    types: HashMap<String, DeviceType>,
    instance_counts: HashMap<String, usize>,
    devices: HashMap<DeviceId, Device>,
    by_name: HashMap<String, DeviceId>,
    ids: DeviceIdAllocator,
}

impl State {
    fn new() -> Self {
        Self {
            types: HashMap::new(),
            instance_counts: HashMap::new(),
            devices: HashMap::new(),
            by_name: HashMap::new(),
            ids: DeviceIdAllocator::new(),
        }
    }
}

/// An empty placeholder substituted into `Device::payload` while the real
/// payload is on loan to a vtable call outside the registry's lock.
fn empty_payload() -> DevicePayload {
    Box::new(())
}

/// Catalog of device types (behavioral vtables) and device instances.
pub struct DeviceRegistry {
    state: ReentrantLock<State>,
    memory: OnceLock<Arc<MemoryManager>>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        Self { state: ReentrantLock::new(State::new()), memory: OnceLock::new() }
    }

    /// Binds the `MemoryManager` used to cascade region teardown on device
    /// destruction. Called once by `System::init`.
    pub(crate) fn bind_memory_manager(&self, memory: Arc<MemoryManager>) {
        let _ = self.memory.set(memory);
    }

    pub fn register_type<O: DeviceOps + 'static>(
        &self,
        name: &str,
        ops: O,
        user_data: Option<Box<dyn Any + Send + Sync>>,
    ) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::InvalidArgument("device type name must not be empty".into()));
        }
        self.state.with_mut(|s| {
            if s.types.contains_key(name) {
                return Err(CoreError::already_exists(EntityKind::DeviceType, name));
            }
            s.types.insert(
                name.to_string(),
                DeviceType { name: name.to_string(), ops: Arc::new(ops), user_data },
            );
            s.instance_counts.insert(name.to_string(), 0);
            debug!("registered device type '{name}'");
            Ok(())
        })
    }

    pub fn unregister_type(&self, name: &str) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let count = *s
                .instance_counts
                .get(name)
                .ok_or_else(|| CoreError::not_found(EntityKind::DeviceType, name))?;
            if count > 0 {
                return Err(CoreError::busy(EntityKind::DeviceType, name));
            }
            s.types.remove(name);
            s.instance_counts.remove(name);
            debug!("unregistered device type '{name}'");
            Ok(())
        })
    }

    pub fn create_device(&self, type_name: &str, instance_name: &str, config: &DeviceConfig) -> CoreResult<DeviceId> {
        if instance_name.is_empty() {
            return Err(CoreError::InvalidArgument("device instance name must not be empty".into()));
        }

        // Reserve the id, name, and a clone of the type's vtable under
        // lock, so the (potentially reentrant) create callback below runs
        // with no registry lock held.
        let (id, ops) = self.state.with_mut(|s| {
            let ty = s
                .types
                .get(type_name)
                .ok_or_else(|| CoreError::not_found(EntityKind::DeviceType, type_name))?;
            if s.by_name.contains_key(instance_name) {
                return Err(CoreError::already_exists(EntityKind::Device, instance_name));
            }
            Ok((s.ids.next(), ty.ops.clone()))
        })?;

        let payload = ops.create(id, instance_name, config)?;

        self.state.with_mut(|s| {
            s.devices.insert(
                id,
                Device {
                    id,
                    name: instance_name.to_string(),
                    type_name: type_name.to_string(),
                    payload,
                    lifecycle: DeviceLifecycle::new(),
                },
            );
            s.by_name.insert(instance_name.to_string(), id);
            *s.instance_counts.entry(type_name.to_string()).or_insert(0) += 1;
        });
        info!("created device '{instance_name}' ({id}) of type '{type_name}'");
        Ok(id)
    }

    /// Destroys a device: cascades its owned regions, runs the type's
    /// `destroy` callback (best-effort — a `NotSupported` vtable slot is not
    /// an error), then removes the instance.
    pub fn destroy_device(&self, id: DeviceId) -> CoreResult<()> {
        let type_name = self.state.with_mut(|s| {
            let device = s
                .devices
                .get(&id)
                .ok_or_else(|| CoreError::not_found(EntityKind::Device, id.to_string()))?;
            if !device.lifecycle.begin_removal() {
                return Err(CoreError::busy(EntityKind::Device, device.name.clone()));
            }
            Ok(device.type_name.clone())
        })?;

        self.state.with(|s| s.devices[&id].lifecycle.wait_idle());

        if let Some(memory) = self.memory.get() {
            memory.destroy_regions_for_device(id)?;
        }

        let ops = self.state.with(|s| s.types.get(&type_name).map(|t| t.ops.clone()));
        if let Some(ops) = ops {
            let mut payload = self.state.with_mut(|s| {
                let device = s.devices.get_mut(&id).expect("device present, verified above");
                std::mem::replace(&mut device.payload, empty_payload())
            });
            let result = ops.destroy(&mut payload);
            self.state.with_mut(|s| {
                if let Some(device) = s.devices.get_mut(&id) {
                    device.payload = payload;
                }
            });
            if let Err(err) = result {
                if !matches!(err, CoreError::NotSupported) {
                    return Err(err);
                }
            }
        }

        self.state.with_mut(|s| {
            let device = s.devices.remove(&id).expect("device present, verified above");
            device.lifecycle.complete_removal();
            s.by_name.remove(&device.name);
            if let Some(count) = s.instance_counts.get_mut(&device.type_name) {
                *count = count.saturating_sub(1);
            }
        });
        info!("destroyed device {id}");
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<DeviceId> {
        self.state.with(|s| s.by_name.get(name).copied())
    }

    /// All currently-live device ids, in no particular order. Used by
    /// `System::cleanup` to tear every device down.
    pub(crate) fn all_device_ids(&self) -> Vec<DeviceId> {
        self.state.with(|s| s.devices.keys().copied().collect())
    }

    /// All registered device type names, in no particular order. Used by
    /// `System::cleanup` once every instance has been destroyed.
    pub(crate) fn all_type_names(&self) -> Vec<String> {
        self.state.with(|s| s.types.keys().cloned().collect())
    }

    pub fn reset(&self, id: DeviceId) -> CoreResult<()> {
        self.with_payload_mut(id, |ops, payload| ops.reset(payload))
    }

    pub fn save_state(&self, id: DeviceId) -> CoreResult<Vec<u8>> {
        self.with_payload_mut(id, |ops, payload| ops.save_state(&*payload))
    }

    pub fn load_state(&self, id: DeviceId, bytes: &[u8]) -> CoreResult<()> {
        self.with_payload_mut(id, |ops, payload| ops.load_state(payload, bytes))
    }

    pub fn ioctl(&self, id: DeviceId, cmd: u32, arg: u64) -> CoreResult<u64> {
        self.with_payload_mut(id, |ops, payload| ops.ioctl(payload, cmd, arg))
    }

    /// Begins an access, loans the device's vtable and payload to `f` with
    /// no registry lock held, then returns the payload and ends the access.
    fn with_payload_mut<R>(&self, id: DeviceId, f: impl FnOnce(&dyn DeviceOps, &mut DevicePayload) -> CoreResult<R>) -> CoreResult<R> {
        let (type_name, mut payload) = self.state.with_mut(|s| {
            let device = s.devices.get_mut(&id).ok_or_else(|| CoreError::not_found(EntityKind::Device, id.to_string()))?;
            if device.lifecycle.state() != DeviceState::Active || !device.lifecycle.try_begin_access() {
                return Err(CoreError::busy(EntityKind::Device, device.name.clone()));
            }
            let taken = std::mem::replace(&mut device.payload, empty_payload());
            Ok((device.type_name.clone(), taken))
        })?;

        let ops = self
            .state
            .with(|s| s.types.get(&type_name).map(|t| t.ops.clone()))
            .ok_or_else(|| CoreError::not_found(EntityKind::DeviceType, type_name.clone()))?;
        let result = f(ops.as_ref(), &mut payload);

        self.state.with_mut(|s| {
            if let Some(device) = s.devices.get_mut(&id) {
                device.payload = payload;
                device.lifecycle.end_access();
            }
        });
        result
    }
}
