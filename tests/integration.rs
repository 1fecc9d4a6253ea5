//! End-to-end scenarios driving only the public `System` facade.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use devicesim::{
    CoreError, DeviceConfig, DeviceId, DeviceOps, DevicePayload, RegionFlags, System, SystemConfig,
    WatchpointKind,
};

struct NullDevice;

impl DeviceOps for NullDevice {
    fn create(&self, _id: DeviceId, _name: &str, _config: &DeviceConfig) -> Result<DevicePayload, CoreError> {
        Ok(Box::new(()))
    }
}

fn system_with_device(instance_name: &str) -> (System, DeviceId) {
    let system = System::init(SystemConfig::default());
    system.register_device_type("null", NullDevice, None).unwrap();
    let device = system.create_device("null", instance_name, &DeviceConfig::new()).unwrap();
    (system, device)
}

#[test]
fn write_value_fires_write_watchpoint() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "regs", 0x1000, 16, RegionFlags::READ | RegionFlags::WRITE).unwrap();

    let seen = Arc::new(AtomicU64::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let (seen2, hits2) = (seen.clone(), hits.clone());
    let action = system
        .create_callback_action(move |ctx| {
            seen2.store(ctx.value, Ordering::Relaxed);
            hits2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    let watchpoint = system.add_watchpoint(region, 0x1000, 4, WatchpointKind::Write, 0).unwrap();
    system.bind_watchpoint_action(watchpoint, action).unwrap();

    system.write_u32(region, 0x1000, 0x1234_5678).unwrap();

    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert_eq!(seen.load(Ordering::Relaxed), 0x1234_5678);
    assert_eq!(system.read_u32(region, 0x1000).unwrap(), 0x1234_5678);
}

#[test]
fn value_gated_watchpoint_fires_only_on_exact_value() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "regs", 0x1000, 16, RegionFlags::READ | RegionFlags::WRITE).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let action = system.create_callback_action(move |_ctx| {
        hits2.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }).unwrap();
    let watchpoint = system.add_watchpoint(region, 0x1000, 2, WatchpointKind::ValueWrite, 30).unwrap();
    system.bind_watchpoint_action(watchpoint, action).unwrap();

    system.write_u16(region, 0x1000, 20).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 0);
    system.write_u16(region, 0x1000, 30).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn disable_enable_cycle_gates_dispatch() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "regs", 0, 16, RegionFlags::READ | RegionFlags::WRITE).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let action = system.create_callback_action(move |_ctx| {
        hits2.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }).unwrap();
    let watchpoint = system.add_watchpoint(region, 0, 4, WatchpointKind::Write, 0).unwrap();
    system.bind_watchpoint_action(watchpoint, action).unwrap();

    system.write_u32(region, 0, 1).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    system.disable_watchpoint(watchpoint).unwrap();
    system.write_u32(region, 0, 2).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    system.enable_watchpoint(watchpoint).unwrap();
    system.write_u32(region, 0, 3).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 2);
}

#[test]
fn cross_device_copy_via_watchpoint_callback() {
    let system = Arc::new(System::init(SystemConfig::default()));
    system.register_device_type("null", NullDevice, None).unwrap();
    let d1 = system.create_device("null", "d1", &DeviceConfig::new()).unwrap();
    let d2 = system.create_device("null", "d2", &DeviceConfig::new()).unwrap();
    let r1 = system.create_region(d1, "regs", 0, 1024, RegionFlags::READ | RegionFlags::WRITE).unwrap();
    let r2 = system.create_region(d2, "regs", 0, 1024, RegionFlags::READ | RegionFlags::WRITE).unwrap();

    let copier = system.clone();
    let action = system
        .create_callback_action(move |ctx| copier.write_u32(r2, 4, ctx.value as u32))
        .unwrap();
    let watchpoint = system.add_watchpoint(r1, 0, 4, WatchpointKind::Write, 0).unwrap();
    system.bind_watchpoint_action(watchpoint, action).unwrap();

    system.write_u32(r1, 0, 0xDEAD_BEEF).unwrap();

    assert_eq!(system.read_u32(r2, 4).unwrap(), 0xDEAD_BEEF);

    // The bound action's closure holds its own `Arc<System>` clone; destroy
    // it to drop that reference before reclaiming the sole remaining one.
    system.destroy_action(action).unwrap();
    let system = Arc::try_unwrap(system).unwrap_or_else(|_| panic!("system still shared"));
    system.cleanup().unwrap();
}

#[test]
fn alignment_rejection_leaves_buffer_unchanged_and_does_not_notify() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "regs", 0x1000, 16, RegionFlags::READ | RegionFlags::WRITE).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let action = system.create_callback_action(move |_ctx| {
        hits2.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }).unwrap();
    let watchpoint = system.add_watchpoint(region, 0x1000, 4, WatchpointKind::Access, 0).unwrap();
    system.bind_watchpoint_action(watchpoint, action).unwrap();

    system.write_u32(region, 0x1000, 0xAAAA_AAAA).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    let err = system.write_u32(region, 0x1001, 1);
    assert!(matches!(err, Err(CoreError::Alignment)));
    assert_eq!(system.read_u32(region, 0x1000).unwrap(), 0xAAAA_AAAA);
    assert_eq!(hits.load(Ordering::Relaxed), 2); // the verifying read_u32 above also notifies
}

#[test]
fn permission_rejection_leaves_buffer_unchanged_and_does_not_notify() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "rom", 0, 4, RegionFlags::READ).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let action = system.create_callback_action(move |_ctx| {
        hits2.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }).unwrap();
    let watchpoint = system.add_watchpoint(region, 0, 4, WatchpointKind::Access, 0).unwrap();
    system.bind_watchpoint_action(watchpoint, action).unwrap();

    let err = system.write_u8(region, 0, 7);
    assert!(matches!(err, Err(CoreError::PermissionDenied)));
    assert_eq!(system.read_u8(region, 0).unwrap(), 0);
    assert_eq!(hits.load(Ordering::Relaxed), 1); // only the read above notified
}

#[test]
fn id_and_name_uniqueness_invariants_hold() {
    let (system, device) = system_with_device("d0");
    assert!(matches!(
        system.create_device("null", "d0", &DeviceConfig::new()),
        Err(CoreError::AlreadyExists { .. })
    ));

    let region = system.create_region(device, "regs", 0, 4, RegionFlags::READ).unwrap();
    assert!(matches!(
        system.create_region(device, "regs", 0x100, 4, RegionFlags::READ),
        Err(CoreError::AlreadyExists { .. })
    ));

    let a1 = system.create_callback_action(|_| Ok(())).unwrap();
    let a2 = system.create_callback_action(|_| Ok(())).unwrap();
    assert_ne!(a1, a2);

    let w1 = system.add_watchpoint(region, 0, 1, WatchpointKind::Read, 0).unwrap();
    let w2 = system.add_watchpoint(region, 0, 1, WatchpointKind::Read, 0).unwrap();
    assert_ne!(w1, w2);

    system.create_rule("r1").unwrap();
    assert!(matches!(system.create_rule("r1"), Err(CoreError::AlreadyExists { .. })));
}

#[test]
fn destroying_device_cascades_its_regions() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "regs", 0, 4, RegionFlags::READ | RegionFlags::WRITE).unwrap();
    system.destroy_device(device).unwrap();

    assert!(matches!(system.read_u8(region, 0), Err(CoreError::NotFound { .. })));
    assert_eq!(system.find_device_by_name("d0"), None);
}

#[test]
fn rule_runs_its_action_list_only_when_enabled_and_matching() {
    let (system, device) = system_with_device("d0");
    let region = system.create_region(device, "regs", 0, 4, RegionFlags::READ | RegionFlags::WRITE).unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let runs2 = runs.clone();
    let action = system.create_callback_action(move |_ctx| {
        runs2.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }).unwrap();

    let rule = system.create_rule("big-write").unwrap();
    system.add_rule_action(rule, action).unwrap();
    system.set_rule_condition(rule, |ctx| ctx.value > 100).unwrap();

    let ctx = devicesim::MonitorContext { region, addr: 0, size: 4, value: 5, access_type: devicesim::AccessType::Write };
    // Disabled by default: no-op even though the predicate would match.
    system.evaluate_rule(rule, &ctx).unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 0);

    system.enable_rule(rule).unwrap();
    system.evaluate_rule(rule, &ctx).unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 0);

    let ctx = devicesim::MonitorContext { value: 200, ..ctx };
    system.evaluate_rule(rule, &ctx).unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 1);
}
