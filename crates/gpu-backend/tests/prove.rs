use std::{
    sync::{mpsc, Arc},
    time::Duration,
};

use ark_bn254::{Bn254, Fr};
use ark_std::rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use tempfile::TempDir;
use test_case::test_case;
use zkaccel_device_common::{
    common::DeviceContext,
    error::MemoryError,
    registry::{BackendRegistry, LoadOptions},
};
use zkaccel_gpu_backend::{GpuBackend, GpuDevice, GpuProverError};
use zkaccel_groth16::{
    compile,
    prover::{Coordinator, CpuBackend, CpuDevice, DeviceDataTransporter},
    setup,
    test_utils::CubicCircuit,
    verify, ConstraintSystem, ProvingKey, VerifyingKey, Witness,
};
use zkaccel_msm::MsmError;

struct Fixture {
    _dir: TempDir,
    registry: BackendRegistry,
    cs: ConstraintSystem<Fr>,
    pk: ProvingKey<Bn254>,
    vk: VerifyingKey<Bn254>,
}

impl Fixture {
    fn new(gpu_memory_bytes: usize, repetitions: usize) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("gpu.toml"),
            format!(
                "name = \"GPU\"\nabi_version = 1\nkind = \"accelerator\"\ndevice_count = 2\nmemory_bytes = {gpu_memory_bytes}\n"
            ),
        )
        .unwrap();
        let registry = BackendRegistry::new();
        registry
            .load_backends_with(Some(dir.path()), &LoadOptions::default())
            .unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let blank = CubicCircuit::<Fr>::new_blank(repetitions);
        let cs = compile(blank).unwrap();
        let (pk, vk) = setup::<Bn254, _, _>(blank, &mut rng).unwrap();
        Self {
            _dir: dir,
            registry,
            cs,
            pk,
            vk,
        }
    }

    fn context(&self, index: usize) -> DeviceContext {
        let device = self.registry.create_device("GPU", index).unwrap();
        self.registry.set_active_device(&device).unwrap()
    }

    fn witness(&self, x: u64) -> Witness<Fr> {
        let repetitions = self.cs.num_constraints() - 2;
        let y = x * x * x + x + 5;
        Witness::new(CubicCircuit::new(Fr::from(x), Fr::from(y), repetitions)).unwrap()
    }
}

fn gpu_prover(
    ctx: DeviceContext,
    factor: usize,
) -> Coordinator<GpuBackend<Bn254>, GpuDevice<Bn254>> {
    Coordinator::new(
        GpuBackend::default(),
        GpuDevice::with_precompute_factor(ctx, factor),
    )
}

#[test_case(1)]
#[test_case(2)]
#[test_case(4)]
fn test_gpu_proof_verifies(factor: usize) {
    let fx = Fixture::new(1 << 26, 16);
    let prover = gpu_prover(fx.context(0), factor);
    let witness = fx.witness(3);
    let mut rng = StdRng::seed_from_u64(1);
    let proof = prover.prove(&fx.cs, &fx.pk, &witness, &mut rng).unwrap();
    verify(&proof, &fx.vk, &witness.public()).unwrap();
}

#[test]
fn test_gpu_and_cpu_proofs_group_equal() {
    let fx = Fixture::new(1 << 26, 32);
    let witness = fx.witness(3);
    let (r, s) = (Fr::from(5u64), Fr::from(17u64));

    let gpu = gpu_prover(fx.context(0), 2);
    let dpk = gpu.device.transport_pk_to_device(&fx.pk).unwrap();
    let gpu_proof = gpu
        .prove_with_blinding(&fx.cs, &fx.pk, &dpk, &witness, r, s)
        .unwrap();

    let cpu = Coordinator::new(CpuBackend::<Bn254>::default(), CpuDevice);
    let cpu_proof = cpu
        .prove_with_blinding(&fx.cs, &fx.pk, &(), &witness, r, s)
        .unwrap();

    assert_eq!(gpu_proof, cpu_proof);
    verify(&gpu_proof, &fx.vk, &witness.public()).unwrap();
}

#[test]
fn test_proving_key_cached_per_key() {
    let fx = Fixture::new(1 << 26, 4);
    let device = GpuDevice::<Bn254>::with_precompute_factor(fx.context(0), 1);
    let first = device.transport_pk_to_device(&fx.pk).unwrap();
    let second = device.clone().transport_pk_to_device(&fx.pk).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(device.cached_keys(), 1);

    let in_use = fx.context(0).mem_snapshot().current;
    assert!(in_use > 0);
    device.clear_cache();
    drop((first, second));
    assert_eq!(fx.context(0).mem_snapshot().current, 0);
}

#[test]
fn test_keys_differing_in_bases_cached_separately() {
    let fx = Fixture::new(1 << 26, 4);
    let device = GpuDevice::<Bn254>::with_precompute_factor(fx.context(0), 1);
    let mut other = fx.pk.clone();
    other.l_query.swap(0, 1);
    assert_eq!(other.vk, fx.pk.vk);

    let first = device.transport_pk_to_device(&fx.pk).unwrap();
    let second = device.transport_pk_to_device(&other).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(device.cached_keys(), 2);
}

#[test]
fn test_out_of_device_memory_leaves_key_usable() {
    let fx = Fixture::new(4096, 64);
    let prover = gpu_prover(fx.context(0), 1);
    let witness = fx.witness(3);
    let mut rng = StdRng::seed_from_u64(2);

    let err = prover
        .prove(&fx.cs, &fx.pk, &witness, &mut rng)
        .unwrap_err()
        .to_string();
    assert!(err.contains("memory"), "{err}");
    assert!(matches!(
        prover.device.transport_pk_to_device(&fx.pk),
        Err(GpuProverError::Msm(MsmError::Memory(
            MemoryError::OutOfMemory { .. }
        )))
    ));
    assert_eq!(fx.context(0).mem_snapshot().current, 0);

    let cpu = Coordinator::new(CpuBackend::<Bn254>::default(), CpuDevice);
    let proof = cpu.prove(&fx.cs, &fx.pk, &witness, &mut rng).unwrap();
    verify(&proof, &fx.vk, &witness.public()).unwrap();
}

#[test]
fn test_concurrent_provers_on_separate_devices() {
    let fx = Fixture::new(1 << 26, 8);
    let proofs: Vec<_> = (1..=4u64)
        .into_par_iter()
        .map(|x| {
            let prover = gpu_prover(fx.context((x % 2) as usize), 1);
            let witness = fx.witness(x);
            let mut rng = StdRng::seed_from_u64(x);
            let proof = prover.prove(&fx.cs, &fx.pk, &witness, &mut rng).unwrap();
            (proof, witness.public())
        })
        .collect();
    for (proof, public) in &proofs {
        verify(proof, &fx.vk, public).unwrap();
    }
}

#[test]
fn test_proofs_from_every_rayon_worker() {
    let fx = Fixture::new(1 << 26, 8);
    let (done, finished) = mpsc::channel();
    std::thread::spawn(move || {
        let prover = gpu_prover(fx.context(0), 1);
        let verified = rayon::broadcast(|ctx| {
            let x = ctx.index() as u64 + 1;
            let witness = fx.witness(x);
            let mut rng = StdRng::seed_from_u64(x);
            let proof = prover.prove(&fx.cs, &fx.pk, &witness, &mut rng).unwrap();
            verify(&proof, &fx.vk, &witness.public()).is_ok()
        });
        done.send(verified).ok();
    });
    let verified = finished
        .recv_timeout(Duration::from_secs(120))
        .expect("proofs issued from rayon workers never completed");
    assert!(verified.into_iter().all(|ok| ok));
}

#[test]
fn test_shared_device_concurrent_proofs() {
    let fx = Fixture::new(1 << 26, 8);
    let prover = gpu_prover(fx.context(1), 2);
    (1..=3u64).into_par_iter().for_each(|x| {
        let witness = fx.witness(x);
        let mut rng = StdRng::seed_from_u64(100 + x);
        let proof = prover.prove(&fx.cs, &fx.pk, &witness, &mut rng).unwrap();
        verify(&proof, &fx.vk, &witness.public()).unwrap();
    });
    assert_eq!(prover.device.cached_keys(), 1);
}
