//! Named, device-owned memory regions and the width-specific access
//! primitives that read and write them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace};

use crate::device::DeviceId;
use crate::error::{CoreError, CoreResult, EntityKind};
use crate::monitor::MonitorEngine;
use crate::sync::ReentrantLock;

bitflags! {
    /// Access permissions attached to a [`MemoryRegion`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// The dimension along which watchpoints and permission checks discriminate
/// an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Exec,
}

/// A unique, never-reused handle to a created [`MemoryRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

struct RegionIdAllocator(AtomicU64);

impl RegionIdAllocator {
    const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    fn next(&self) -> RegionId {
        RegionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A named, contiguous byte buffer owned by one device, exposed at
/// `base_addr` with `flags` gating read/write/exec access.
pub struct MemoryRegion {
    pub id: RegionId,
    pub name: String,
    pub device: DeviceId,
    pub base_addr: u64,
    pub size: u64,
    pub flags: RegionFlags,
    data: Vec<u8>,
}

impl MemoryRegion {
    fn end(&self) -> u64 {
        self.base_addr + self.size
    }

    fn in_range(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base_addr && end <= self.end(),
            None => false,
        }
    }
}

struct State {
    regions: HashMap<RegionId, MemoryRegion>,
    by_device_name: HashMap<(DeviceId, String), RegionId>,
    ids: RegionIdAllocator,
}

impl State {
    fn new() -> Self {
        Self {
            regions: HashMap::new(),
            by_device_name: HashMap::new(),
            ids: RegionIdAllocator::new(),
        }
    }
}

/// Catalog of memory regions and the read/write primitives over them.
///
/// Every successful access, after mutating (for writes) or reading (for
/// reads) the buffer under lock, calls out to the bound [`MonitorEngine`]
/// with the lock released.
pub struct MemoryManager {
    state: ReentrantLock<State>,
    monitor: Arc<MonitorEngine>,
}

impl MemoryManager {
    pub(crate) fn new(monitor: Arc<MonitorEngine>) -> Self {
        Self { state: ReentrantLock::new(State::new()), monitor }
    }

    pub fn create_region(
        &self,
        device: DeviceId,
        name: &str,
        base_addr: u64,
        size: u64,
        flags: RegionFlags,
    ) -> CoreResult<RegionId> {
        if size == 0 {
            return Err(CoreError::InvalidArgument("region size must be nonzero".into()));
        }
        if name.is_empty() {
            return Err(CoreError::InvalidArgument("region name must not be empty".into()));
        }
        self.state.with_mut(|s| {
            let key = (device, name.to_string());
            if s.by_device_name.contains_key(&key) {
                return Err(CoreError::already_exists(EntityKind::Region, name));
            }
            let id = s.ids.next();
            s.regions.insert(
                id,
                MemoryRegion {
                    id,
                    name: name.to_string(),
                    device,
                    base_addr,
                    size,
                    flags,
                    data: vec![0u8; size as usize],
                },
            );
            s.by_device_name.insert(key, id);
            debug!("created region {name} for {device} at {base_addr:#x}..+{size:#x}");
            Ok(id)
        })
    }

    pub fn destroy_region(&self, region: RegionId) -> CoreResult<()> {
        let removed = self.state.with_mut(|s| {
            let r = s
                .regions
                .remove(&region)
                .ok_or_else(|| CoreError::not_found(EntityKind::Region, region.0.to_string()))?;
            s.by_device_name.remove(&(r.device, r.name.clone()));
            Ok::<_, CoreError>(r)
        })?;
        self.monitor.drop_region(region);
        debug!("destroyed region {}", removed.name);
        Ok(())
    }

    /// Destroys every region owned by `device`. Used by cascading device
    /// destruction; never fails on an already-empty device.
    pub(crate) fn destroy_regions_for_device(&self, device: DeviceId) -> CoreResult<()> {
        let ids: Vec<RegionId> = self
            .state
            .with(|s| s.regions.values().filter(|r| r.device == device).map(|r| r.id).collect());
        for id in ids {
            self.destroy_region(id)?;
        }
        Ok(())
    }

    pub fn find_region(&self, device: DeviceId, name: &str) -> Option<RegionId> {
        self.state.with(|s| s.by_device_name.get(&(device, name.to_string())).copied())
    }

    fn check(region: &MemoryRegion, addr: u64, len: u64, need: RegionFlags) -> CoreResult<()> {
        if !region.flags.contains(need) {
            return Err(CoreError::PermissionDenied);
        }
        if !region.in_range(addr, len) {
            return Err(CoreError::OutOfRange);
        }
        Ok(())
    }

    fn check_alignment(addr: u64, width: u64) -> CoreResult<()> {
        if addr % width != 0 {
            return Err(CoreError::Alignment);
        }
        Ok(())
    }

    fn read_bytes(&self, region: RegionId, addr: u64, width: u64) -> CoreResult<[u8; 8]> {
        self.state.with(|s| {
            let r = s
                .regions
                .get(&region)
                .ok_or_else(|| CoreError::not_found(EntityKind::Region, region.0.to_string()))?;
            Self::check(r, addr, width, RegionFlags::READ)?;
            let start = (addr - r.base_addr) as usize;
            let mut buf = [0u8; 8];
            buf[..width as usize].copy_from_slice(&r.data[start..start + width as usize]);
            Ok(buf)
        })
    }

    fn write_bytes(&self, region: RegionId, addr: u64, width: u64, bytes: &[u8]) -> CoreResult<()> {
        self.state.with_mut(|s| {
            let r = s
                .regions
                .get_mut(&region)
                .ok_or_else(|| CoreError::not_found(EntityKind::Region, region.0.to_string()))?;
            Self::check(r, addr, width, RegionFlags::WRITE)?;
            let start = (addr - r.base_addr) as usize;
            r.data[start..start + width as usize].copy_from_slice(bytes);
            Ok(())
        })
    }

    pub fn read_u8(&self, region: RegionId, addr: u64) -> CoreResult<u8> {
        let bytes = self.read_bytes(region, addr, 1)?;
        let value = bytes[0];
        self.monitor.notify(region, addr, 1, value as u64, AccessType::Read)?;
        Ok(value)
    }

    pub fn read_u16(&self, region: RegionId, addr: u64) -> CoreResult<u16> {
        Self::check_alignment(addr, 2)?;
        let bytes = self.read_bytes(region, addr, 2)?;
        let value = u16::from_le_bytes([bytes[0], bytes[1]]);
        self.monitor.notify(region, addr, 2, value as u64, AccessType::Read)?;
        Ok(value)
    }

    pub fn read_u32(&self, region: RegionId, addr: u64) -> CoreResult<u32> {
        Self::check_alignment(addr, 4)?;
        let bytes = self.read_bytes(region, addr, 4)?;
        let value = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        self.monitor.notify(region, addr, 4, value as u64, AccessType::Read)?;
        Ok(value)
    }

    pub fn read_u64(&self, region: RegionId, addr: u64) -> CoreResult<u64> {
        Self::check_alignment(addr, 8)?;
        let bytes = self.read_bytes(region, addr, 8)?;
        let value = u64::from_le_bytes(bytes);
        self.monitor.notify(region, addr, 8, value, AccessType::Read)?;
        Ok(value)
    }

    pub fn write_u8(&self, region: RegionId, addr: u64, value: u8) -> CoreResult<()> {
        self.write_bytes(region, addr, 1, &value.to_le_bytes())?;
        self.monitor.notify(region, addr, 1, value as u64, AccessType::Write)
    }

    pub fn write_u16(&self, region: RegionId, addr: u64, value: u16) -> CoreResult<()> {
        Self::check_alignment(addr, 2)?;
        self.write_bytes(region, addr, 2, &value.to_le_bytes())?;
        self.monitor.notify(region, addr, 2, value as u64, AccessType::Write)
    }

    pub fn write_u32(&self, region: RegionId, addr: u64, value: u32) -> CoreResult<()> {
        Self::check_alignment(addr, 4)?;
        self.write_bytes(region, addr, 4, &value.to_le_bytes())?;
        self.monitor.notify(region, addr, 4, value as u64, AccessType::Write)
    }

    pub fn write_u64(&self, region: RegionId, addr: u64, value: u64) -> CoreResult<()> {
        Self::check_alignment(addr, 8)?;
        self.write_bytes(region, addr, 8, &value.to_le_bytes())?;
        self.monitor.notify(region, addr, 8, value, AccessType::Write)
    }

    pub fn read_buffer(&self, region: RegionId, addr: u64, out: &mut [u8]) -> CoreResult<()> {
        let len = out.len() as u64;
        self.state.with(|s| {
            let r = s
                .regions
                .get(&region)
                .ok_or_else(|| CoreError::not_found(EntityKind::Region, region.0.to_string()))?;
            Self::check(r, addr, len, RegionFlags::READ)?;
            let start = (addr - r.base_addr) as usize;
            out.copy_from_slice(&r.data[start..start + out.len()]);
            Ok::<_, CoreError>(())
        })?;
        trace!("read_buffer {region:?} {addr:#x}+{len:#x}");
        self.monitor.notify(region, addr, 0, 0, AccessType::Read)
    }

    pub fn write_buffer(&self, region: RegionId, addr: u64, bytes: &[u8]) -> CoreResult<()> {
        let len = bytes.len() as u64;
        self.state.with_mut(|s| {
            let r = s
                .regions
                .get_mut(&region)
                .ok_or_else(|| CoreError::not_found(EntityKind::Region, region.0.to_string()))?;
            Self::check(r, addr, len, RegionFlags::WRITE)?;
            let start = (addr - r.base_addr) as usize;
            r.data[start..start + bytes.len()].copy_from_slice(bytes);
            Ok::<_, CoreError>(())
        })?;
        trace!("write_buffer {region:?} {addr:#x}+{len:#x}");
        self.monitor.notify(region, addr, 0, 0, AccessType::Write)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (MemoryManager, DeviceId, RegionId) {
        let monitor = Arc::new(MonitorEngine::new(32));
        let mm = MemoryManager::new(monitor);
        let device = crate::device::test_support::fake_device_id(1);
        let region = mm
            .create_region(device, "regs", 0x1000, 16, RegionFlags::READ | RegionFlags::WRITE)
            .unwrap();
        (mm, device, region)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mm, _device, region) = manager();
        mm.write_u32(region, 0x1000, 0x1234_5678).unwrap();
        assert_eq!(mm.read_u32(region, 0x1000).unwrap(), 0x1234_5678);
    }

    #[test]
    fn misaligned_u32_access_rejected() {
        let (mm, _device, region) = manager();
        assert!(matches!(mm.write_u32(region, 0x1001, 1), Err(CoreError::Alignment)));
    }

    #[test]
    fn read_only_region_rejects_write() {
        let monitor = Arc::new(MonitorEngine::new(32));
        let mm = MemoryManager::new(monitor);
        let device = crate::device::test_support::fake_device_id(1);
        let region = mm.create_region(device, "rom", 0, 4, RegionFlags::READ).unwrap();
        assert!(matches!(mm.write_u8(region, 0, 1), Err(CoreError::PermissionDenied)));
    }

    #[test]
    fn out_of_range_access_rejected() {
        let (mm, _device, region) = manager();
        assert!(matches!(mm.read_u8(region, 0x1000 + 16), Err(CoreError::OutOfRange)));
    }

    #[test]
    fn duplicate_region_name_rejected() {
        let (mm, device, _region) = manager();
        let err = mm.create_region(device, "regs", 0x2000, 4, RegionFlags::READ);
        assert!(matches!(err, Err(CoreError::AlreadyExists { .. })));
    }
}
