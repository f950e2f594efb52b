use rayon::prelude::*;
use zkaccel_device_common::{
    copy::{copy_from_device, copy_to_device, MemCopyD2H, MemCopyH2D},
    d_buffer::{BufferState, DeviceBuffer},
    error::{MemoryError, StreamError},
    registry::BackendRegistry,
};

#[test]
fn test_round_trip_on_many_streams() {
    let registry = BackendRegistry::with_builtin_cpu(1 << 24);
    let device = registry.create_device("CPU", 0).unwrap();

    (0..8u64).into_par_iter().for_each(|seed| {
        let ctx = registry.set_active_device(&device).unwrap();
        let stream = ctx.create_stream().unwrap();
        let host: Vec<u64> = (0..1024).map(|i| i * seed + 17).collect();

        let dev = host.to_device_async(&ctx, &stream).unwrap().wait().unwrap();
        let mut back = vec![0u64; host.len()];
        copy_from_device(&dev, &mut back, Some(&stream)).unwrap();
        assert_eq!(back, host);
    });

    let ctx = registry.set_active_device(&device).unwrap();
    assert_eq!(ctx.mem_snapshot().current, 0);
}

#[test]
fn test_host_read_before_synchronize() {
    let registry = BackendRegistry::with_builtin_cpu(1 << 20);
    let ctx = registry
        .set_active_device(&registry.create_device("CPU", 0).unwrap())
        .unwrap();
    let stream = ctx.create_stream().unwrap();

    let (release, gate) = std::sync::mpsc::channel::<()>();
    stream
        .enqueue("stall", move |_| {
            gate.recv().ok();
            Ok(())
        })
        .unwrap();

    let mut dev = DeviceBuffer::<u32>::with_capacity(&ctx, 4).unwrap();
    copy_to_device(&[1, 2, 3, 4], &mut dev, Some(&stream)).unwrap();
    assert!(matches!(dev.state(), BufferState::Pending { .. }));
    assert!(matches!(
        dev.to_host(),
        Err(zkaccel_device_common::error::MemCopyError::Memory(
            MemoryError::AsyncNotReady { .. }
        ))
    ));

    release.send(()).unwrap();
    stream.synchronize().unwrap();
    assert_eq!(dev.to_host().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_stream_on_other_device_rejected() {
    let registry = BackendRegistry::with_builtin_cpu(1 << 20);
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("gpu.toml"),
        "name = \"GPU\"\nabi_version = 1\nkind = \"accelerator\"\ndevice_count = 1\nmemory_bytes = 65536\n",
    )
    .unwrap();
    registry.load_backends(Some(dir.path())).unwrap();

    let cpu = registry
        .set_active_device(&registry.create_device("CPU", 0).unwrap())
        .unwrap();
    let gpu = registry
        .set_active_device(&registry.create_device("GPU", 0).unwrap())
        .unwrap();
    let gpu_stream = gpu.create_stream().unwrap();
    let dev = DeviceBuffer::<u8>::with_capacity(&cpu, 8).unwrap();
    assert!(matches!(
        dev.view(&gpu_stream),
        Err(MemoryError::WrongDevice { .. })
    ));
    assert!(matches!(
        DeviceBuffer::<u8>::with_capacity_async(&cpu, 8, &gpu_stream),
        Err(StreamError::WrongDevice { .. })
    ));
}
