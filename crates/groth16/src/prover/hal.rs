//! Hardware abstraction for the MSM stage of the prover.

use ark_ec::pairing::Pairing;
use ark_groth16::ProvingKey;

use crate::proof::{MsmOutputs, MsmScalars};

/// Associated types of a specific hardware backend.
pub trait ProverBackend {
    type Engine: Pairing;
    /// Proving key bases resident on the device. Shared across proofs.
    type DeviceProvingKey: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;
}

pub trait ProverDevice<PB: ProverBackend>: DeviceDataTransporter<PB> + MsmProver<PB> {
    /// Name of the device, for logs and metrics.
    fn name(&self) -> String;
}

/// Moves proving key data to the device.
pub trait DeviceDataTransporter<PB: ProverBackend> {
    fn transport_pk_to_device(
        &self,
        pk: &ProvingKey<PB::Engine>,
    ) -> Result<PB::DeviceProvingKey, PB::Error>;
}

/// Computes the five proving-key MSMs. The host key is passed alongside its device copy for
/// backends that keep no device state.
pub trait MsmProver<PB: ProverBackend> {
    fn compute_msms(
        &self,
        pk: &ProvingKey<PB::Engine>,
        dpk: &PB::DeviceProvingKey,
        scalars: &MsmScalars<<PB::Engine as Pairing>::ScalarField>,
    ) -> Result<MsmOutputs<PB::Engine>, PB::Error>;
}
