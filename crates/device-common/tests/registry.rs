use std::{fs, path::Path};

use tempfile::TempDir;
use test_case::test_case;
use zkaccel_device_common::{
    common::BackendKind,
    error::BackendLoadError,
    registry::{BackendRegistry, LoadOptions},
};

fn write_manifest(dir: &Path, file: &str, body: &str) {
    fs::write(dir.join(file), body).unwrap();
}

fn accelerator(name: &str, devices: usize) -> String {
    format!(
        "name = \"{name}\"\nabi_version = 1\nkind = \"accelerator\"\ndevice_count = {devices}\nmemory_bytes = 1048576\n"
    )
}

fn no_cpu() -> LoadOptions {
    LoadOptions {
        include_builtin_cpu: false,
        cpu_memory_bytes: 0,
    }
}

#[test]
fn test_load_lists_all_devices() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "cuda.toml", &accelerator("CUDA", 2));
    write_manifest(dir.path(), "README.md", "not a manifest");

    let registry = BackendRegistry::new();
    let names = registry
        .load_backends_with(
            Some(dir.path()),
            &LoadOptions {
                include_builtin_cpu: true,
                cpu_memory_bytes: 1 << 20,
            },
        )
        .unwrap();
    assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["CPU", "CUDA"]);

    let devices: Vec<String> = registry
        .list_devices()
        .iter()
        .map(|d| d.to_string())
        .collect();
    assert_eq!(devices, vec!["CPU:0", "CUDA:0", "CUDA:1"]);
    assert_eq!(registry.backend_kind("CUDA"), Some(BackendKind::Accelerator));
    assert_eq!(
        registry.backend_source("CUDA"),
        Some(dir.path().join("cuda.toml"))
    );
}

#[test]
fn test_repeated_load_is_idempotent() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "gpu.toml", &accelerator("GPU", 1));
    let registry = BackendRegistry::new();
    registry.load_backends_with(Some(dir.path()), &no_cpu()).unwrap();
    registry.load_backends_with(Some(dir.path()), &no_cpu()).unwrap();
    assert_eq!(registry.list_devices().len(), 1);
}

#[test]
fn test_missing_explicit_directory() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope");
    let err = BackendRegistry::new()
        .load_backends(Some(&missing))
        .unwrap_err();
    assert!(matches!(err, BackendLoadError::MissingDirectory { .. }));
}

#[test]
fn test_empty_directory_without_cpu() {
    let dir = TempDir::new().unwrap();
    let err = BackendRegistry::new()
        .load_backends_with(Some(dir.path()), &no_cpu())
        .unwrap_err();
    assert!(matches!(err, BackendLoadError::NoBackends));
}

#[test]
fn test_empty_directory_keeps_cpu() {
    let dir = TempDir::new().unwrap();
    let registry = BackendRegistry::new();
    let names = registry.load_backends(Some(dir.path())).unwrap();
    assert!(names.contains("CPU"));
    assert_eq!(registry.list_devices().len(), 1);
}

#[test_case("name = \"gpu\"\nabi_version = 1\nkind = \"accelerator\"\ndevice_count = 1\nmemory_bytes = 1" ; "lowercase name")]
#[test_case("name = \"GPU\"\nabi_version = 2\nkind = \"accelerator\"\ndevice_count = 1\nmemory_bytes = 1" ; "abi mismatch")]
#[test_case("name = \"GPU\"\nabi_version = 1\nkind = \"accelerator\"\ndevice_count = 0\nmemory_bytes = 1" ; "no devices")]
#[test_case("name = \"GPU\"\nabi_version = 1\nkind = \"accelerator\"\ndevice_count = 1\nmemory_bytes = 0" ; "no memory")]
fn test_integrity_failures(body: &str) {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "bad.toml", body);
    let err = BackendRegistry::new()
        .load_backends_with(Some(dir.path()), &no_cpu())
        .unwrap_err();
    assert!(matches!(err, BackendLoadError::Integrity { .. }), "{err}");
}

#[test_case("name = \"GPU\"\nkind = \"accelerator\"" ; "missing fields")]
#[test_case("name = \"GPU\"\nabi_version = 1\nkind = \"fpga\"\ndevice_count = 1\nmemory_bytes = 1" ; "unknown kind")]
#[test_case("not toml at all [" ; "garbage")]
fn test_parse_failures(body: &str) {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "bad.toml", body);
    let err = BackendRegistry::new()
        .load_backends_with(Some(dir.path()), &no_cpu())
        .unwrap_err();
    assert!(matches!(err, BackendLoadError::Manifest { .. }), "{err}");
}

#[test]
fn test_duplicate_backend_names() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "a.toml", &accelerator("GPU", 1));
    write_manifest(dir.path(), "b.toml", &accelerator("GPU", 2));
    let err = BackendRegistry::new()
        .load_backends_with(Some(dir.path()), &no_cpu())
        .unwrap_err();
    assert!(matches!(err, BackendLoadError::Duplicate { name } if name == "GPU"));
}

#[test]
fn test_unknown_device() {
    let registry = BackendRegistry::with_builtin_cpu(1024);
    assert!(registry.create_device("CPU", 0).is_ok());
    let err = registry.create_device("CPU", 1).unwrap_err();
    assert_eq!((err.backend.as_str(), err.index), ("CPU", 1));
    assert!(registry.create_device("CUDA", 0).is_err());
}

#[test]
fn test_concurrent_contexts_are_independent() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "gpu.toml", &accelerator("GPU", 2));
    let registry = BackendRegistry::new();
    registry.load_backends_with(Some(dir.path()), &no_cpu()).unwrap();

    std::thread::scope(|scope| {
        for index in 0..2 {
            let registry = &registry;
            scope.spawn(move || {
                let device = registry.create_device("GPU", index).unwrap();
                let ctx = registry.set_active_device(&device).unwrap();
                assert_eq!(ctx.device().index(), index);
                let stream = ctx.create_stream().unwrap();
                stream.synchronize().unwrap();
            });
        }
    });
}
