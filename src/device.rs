//! Device types and instances: the behavioral vtable and the per-instance
//! opaque payload it owns.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::CoreError;
use crate::lifecycle::DeviceLifecycle;

/// A unique, never-reused handle to a created [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

pub(crate) struct DeviceIdAllocator(AtomicU64);

impl DeviceIdAllocator {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> DeviceId {
        DeviceId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque per-instance state returned by [`DeviceOps::create`] and threaded
/// back into every later vtable call for that device.
pub type DevicePayload = Box<dyn Any + Send + Sync>;

/// The behavioral vtable a registered device type supplies.
///
/// Every method has a default `NotSupported` body so implementors only
/// override the capabilities their device actually has, mirroring a
/// nullable-slot vtable without `Option<fn>` plumbing.
pub trait DeviceOps: Send + Sync {
    fn create(&self, id: DeviceId, name: &str, config: &DeviceConfig) -> Result<DevicePayload, CoreError> {
        let _ = (id, name, config);
        Err(CoreError::NotSupported)
    }

    fn destroy(&self, payload: &mut DevicePayload) -> Result<(), CoreError> {
        let _ = payload;
        Err(CoreError::NotSupported)
    }

    fn reset(&self, payload: &mut DevicePayload) -> Result<(), CoreError> {
        let _ = payload;
        Err(CoreError::NotSupported)
    }

    fn save_state(&self, payload: &DevicePayload) -> Result<Vec<u8>, CoreError> {
        let _ = payload;
        Err(CoreError::NotSupported)
    }

    fn load_state(&self, payload: &mut DevicePayload, bytes: &[u8]) -> Result<(), CoreError> {
        let _ = (payload, bytes);
        Err(CoreError::NotSupported)
    }

    fn ioctl(&self, payload: &mut DevicePayload, cmd: u32, arg: u64) -> Result<u64, CoreError> {
        let _ = (payload, cmd, arg);
        Err(CoreError::NotSupported)
    }
}

/// A registered device type: its name, behavioral vtable, and type-level
/// user payload set at registration.
pub struct DeviceType {
    pub(crate) name: String,
    pub(crate) ops: Arc<dyn DeviceOps>,
    pub(crate) user_data: Option<Box<dyn Any + Send + Sync>>,
}

/// A created device instance.
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) payload: DevicePayload,
    pub(crate) lifecycle: DeviceLifecycle,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// Test-only helpers for constructing [`DeviceId`] values without going
/// through a full `DeviceRegistry`, used by other modules' unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::DeviceId;

    pub(crate) fn fake_device_id(raw: u64) -> DeviceId {
        DeviceId(raw)
    }
}
