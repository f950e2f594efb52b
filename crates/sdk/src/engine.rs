//! Proving façade over every loaded backend.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use ark_bn254::Bn254;
use ark_ec::pairing::Pairing;
use ark_ff::UniformRand;
use itertools::Itertools;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tracing::{debug, info, info_span, instrument, warn};
use zkaccel_device_common::{
    common::{BackendKind, Device},
    registry::BackendRegistry,
};
use zkaccel_gpu_backend::{GpuBackend, GpuDevice};
use zkaccel_groth16::{
    prover::{Coordinator, CpuBackend, CpuDevice, DeviceDataTransporter},
    verify, ConstraintSystem, Proof, ProverError, ProvingKey, PublicWitness, VerifyingKey,
    Witness,
};
use zkaccel_msm::config::{route, DeviceType};

use crate::{config::EngineConfig, error::SdkError};

/// Where a proof is computed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendSelector {
    /// Host MSMs, no device allocation.
    Cpu,
    /// Device runtime on the given device.
    Accelerator(Device),
    /// Routed by the engine's `device_type` and `gpu_min_size`: the configured accelerator
    /// device for large enough proofs when one is loaded, otherwise the CPU.
    Auto,
}

impl fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSelector::Cpu => write!(f, "cpu"),
            BackendSelector::Accelerator(device) => write!(f, "{device}"),
            BackendSelector::Auto => write!(f, "auto"),
        }
    }
}

/// One proof of a backend comparison.
#[derive(Clone, Debug)]
pub struct BackendRun<E: Pairing> {
    pub selector: BackendSelector,
    pub proof: Proof<E>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct ComparisonReport<E: Pairing> {
    pub runs: Vec<BackendRun<E>>,
    /// All runs produced the same proof. They share blinding factors, so this holds whenever
    /// the backends agree on every MSM.
    pub group_equal: bool,
}

/// Proves and verifies Groth16 circuits on the CPU or on any loaded device.
///
/// Accelerator devices are bound on first use and keep their proving-key cache for the
/// lifetime of the engine.
pub struct Groth16Engine<E: Pairing = Bn254> {
    config: EngineConfig,
    registry: Arc<BackendRegistry>,
    devices: Mutex<HashMap<Device, GpuDevice<E>>>,
}

impl<E: Pairing> Groth16Engine<E> {
    /// Loads backends as configured.
    pub fn new(config: EngineConfig) -> Result<Self, SdkError> {
        let registry = BackendRegistry::new();
        let backends =
            registry.load_backends_with(config.backend_dir.as_deref(), &config.load_options())?;
        info!("loaded backends: {}", backends.iter().join(", "));
        Ok(Self::from_registry(Arc::new(registry), config))
    }

    /// Uses an already loaded registry.
    pub fn from_registry(registry: Arc<BackendRegistry>, config: EngineConfig) -> Self {
        Self {
            config,
            registry,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Device a selector runs on for a proof whose largest MSM has `msm_size` terms. `None` is
    /// the host path.
    pub fn resolve(
        &self,
        selector: &BackendSelector,
        msm_size: usize,
    ) -> Result<Option<Device>, SdkError> {
        match selector {
            BackendSelector::Cpu => Ok(None),
            BackendSelector::Accelerator(device) => {
                self.registry.create_device(device.backend(), device.index())?;
                Ok(Some(device.clone()))
            }
            BackendSelector::Auto => {
                let device_type = self.config.device_type;
                if !route(device_type, msm_size, self.config.gpu_min_size) {
                    debug!(%device_type, msm_size, "auto routing to cpu");
                    return Ok(None);
                }
                let backend = match &self.config.preferred_backend {
                    Some(name) => Some(name.clone()),
                    None => self.registry.loaded_backends().into_iter().find(|name| {
                        self.registry.backend_kind(name) == Some(BackendKind::Accelerator)
                    }),
                };
                match backend {
                    Some(name) => Ok(Some(
                        self.registry
                            .create_device(&name, self.config.device_index)?,
                    )),
                    None => {
                        if device_type == DeviceType::Gpu {
                            warn!(
                                "device type {device_type} requested but no accelerator is \
                                 loaded, using cpu"
                            );
                        }
                        Ok(None)
                    }
                }
            }
        }
    }

    fn gpu_device(&self, device: &Device) -> Result<GpuDevice<E>, SdkError> {
        let mut devices = self.devices.lock();
        if let Some(gpu) = devices.get(device) {
            return Ok(gpu.clone());
        }
        let ctx = self.registry.set_active_device(device)?;
        let gpu = GpuDevice::with_precompute_factor(ctx, self.config.precompute_factor);
        devices.insert(device.clone(), gpu.clone());
        Ok(gpu)
    }

    /// Proves with fresh blinding factors on the selected backend.
    pub fn prove(
        &self,
        cs: &ConstraintSystem<E::ScalarField>,
        pk: &ProvingKey<E>,
        witness: &Witness<E::ScalarField>,
        selector: &BackendSelector,
    ) -> Result<Proof<E>, SdkError> {
        let mut rng = OsRng;
        let r = E::ScalarField::rand(&mut rng);
        let s = E::ScalarField::rand(&mut rng);
        self.prove_with_blinding(cs, pk, witness, selector, r, s)
    }

    #[instrument(name = "engine_prove", level = "info", skip_all, fields(backend = %selector))]
    pub fn prove_with_blinding(
        &self,
        cs: &ConstraintSystem<E::ScalarField>,
        pk: &ProvingKey<E>,
        witness: &Witness<E::ScalarField>,
        selector: &BackendSelector,
        r: E::ScalarField,
        s: E::ScalarField,
    ) -> Result<Proof<E>, SdkError> {
        let start = Instant::now();
        let proof = match self.resolve(selector, largest_msm(pk))? {
            None => Coordinator::new(CpuBackend::<E>::default(), CpuDevice)
                .prove_with_blinding(cs, pk, &(), witness, r, s)?,
            Some(device) => {
                let prover =
                    Coordinator::new(GpuBackend::<E>::default(), self.gpu_device(&device)?);
                let dpk = prover
                    .device
                    .transport_pk_to_device(pk)
                    .map_err(ProverError::device)?;
                prover.prove_with_blinding(cs, pk, &dpk, witness, r, s)?
            }
        };
        let elapsed = start.elapsed();
        metrics::gauge!("prove_time_ms", "backend" => selector.to_string())
            .set(elapsed.as_millis() as f64);
        Ok(proof)
    }

    /// Verifies `proof`; a rejected proof is [VerifierError::VerificationFailed].
    ///
    /// [VerifierError::VerificationFailed]: zkaccel_groth16::VerifierError::VerificationFailed
    pub fn verify(
        &self,
        proof: &Proof<E>,
        vk: &VerifyingKey<E>,
        public: &PublicWitness<E::ScalarField>,
    ) -> Result<(), SdkError> {
        Ok(verify(proof, vk, public)?)
    }

    /// Proves the same witness on every selector with shared blinding factors, verifies each
    /// proof and records the time each backend took.
    pub fn compare_backends(
        &self,
        cs: &ConstraintSystem<E::ScalarField>,
        pk: &ProvingKey<E>,
        vk: &VerifyingKey<E>,
        witness: &Witness<E::ScalarField>,
        selectors: &[BackendSelector],
    ) -> Result<ComparisonReport<E>, SdkError> {
        let mut rng = OsRng;
        let r = E::ScalarField::rand(&mut rng);
        let s = E::ScalarField::rand(&mut rng);
        let public = witness.public();

        let runs = selectors
            .iter()
            .map(|selector| {
                info_span!("compare", backend = %selector).in_scope(|| {
                    let start = Instant::now();
                    let proof = self.prove_with_blinding(cs, pk, witness, selector, r, s)?;
                    let elapsed = start.elapsed();
                    info!("{selector} proof time: {elapsed:?}");
                    self.verify(&proof, vk, &public)?;
                    Ok(BackendRun {
                        selector: selector.clone(),
                        proof,
                        elapsed,
                    })
                })
            })
            .collect::<Result<Vec<_>, SdkError>>()?;
        let group_equal = runs.iter().map(|run| &run.proof).all_equal();
        info!(group_equal, "compared {} backends", runs.len());
        Ok(ComparisonReport { runs, group_equal })
    }
}

/// Terms in the largest MSM a proof with `pk` runs.
fn largest_msm<E: Pairing>(pk: &ProvingKey<E>) -> usize {
    pk.a_query
        .len()
        .max(pk.h_query.len())
        .max(pk.l_query.len())
}
