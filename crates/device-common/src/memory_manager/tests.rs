use super::*;
use crate::{d_buffer::DeviceBuffer, registry::BackendRegistry};

fn manager(capacity: usize) -> MemoryManager {
    MemoryManager::new(Device::new("TEST".to_string(), 0), capacity)
}

#[test]
fn test_alloc_then_free_never_leaks() {
    let mut mm = manager(1 << 20);
    for size in [1, 255, 256, 257, 4096, 1 << 19] {
        let ptr = mm.d_malloc(size).unwrap();
        assert_eq!(ptr.addr() % ALLOC_ALIGNMENT, 0);
        assert!(mm.is_live(ptr));
        assert_eq!(mm.d_free(ptr).unwrap(), size);
    }
    assert_eq!(mm.num_allocations(), 0);
    assert_eq!(mm.snapshot().current, 0);
    assert_eq!(mm.snapshot().peak, 1 << 19);
}

#[test]
fn test_exhaustion_then_free_allows_same_size() {
    let mut mm = manager(4096);
    let ptrs: Vec<_> = (0..4).map(|_| mm.d_malloc(1024).unwrap()).collect();
    let err = mm.d_malloc(1024).unwrap_err();
    assert_eq!(
        err,
        MemoryError::OutOfMemory {
            device: Device::new("TEST".to_string(), 0),
            requested: 1024,
            available: 0,
        }
    );

    mm.d_free(ptrs[2]).unwrap();
    let again = mm.d_malloc(1024).unwrap();
    assert!(mm.is_live(again));
    assert_eq!(mm.snapshot().available(), 0);

    for ptr in [ptrs[0], ptrs[1], ptrs[3], again] {
        mm.d_free(ptr).unwrap();
    }
}

#[test]
fn test_free_untracked_pointer() {
    let mut mm = manager(1024);
    let ptr = mm.d_malloc(8).unwrap();
    mm.d_free(ptr).unwrap();
    assert_eq!(mm.d_free(ptr), Err(MemoryError::AlreadyFreed { ptr }));
}

#[test]
#[should_panic(expected = "non-zero")]
fn test_zero_size_panics() {
    let mut mm = manager(1024);
    let _ = mm.d_malloc(0);
}

#[test]
fn test_tracker_reports_region() {
    let registry = BackendRegistry::with_builtin_cpu(1 << 16);
    let device = registry.create_device("CPU", 0).unwrap();
    let ctx = registry.set_active_device(&device).unwrap();

    let tracker = MemTracker::start(&ctx, "region");
    let buf = DeviceBuffer::<u64>::with_capacity(&ctx, 64).unwrap();
    tracker.emit_metrics();
    tracker.tracing_info("allocated");
    assert_eq!(ctx.mem_snapshot().current, 512);
    drop(buf);
    assert_eq!(ctx.mem_snapshot().current, 0);
}
