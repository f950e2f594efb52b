//! Proves `x^3 + x + 5 == y` for `x = 3, y = 35` on the accelerator and on the CPU, verifying
//! both proofs and logging the time each backend took.
//!
//! ```text
//! cargo run --release --example cubic -- [repetitions] [engine.toml]
//! ```

use std::time::Instant;

use ark_bn254::{Bn254, Fr};
use zkaccel_groth16::{compile, setup, test_utils::CubicCircuit, Witness};
use zkaccel_sdk::{
    utils::{create_seeded_rng, setup_tracing},
    BackendSelector, EngineConfig, Groth16Engine, SdkError,
};

const DEFAULT_REPETITIONS: usize = 1 << 16;

fn main() -> Result<(), SdkError> {
    setup_tracing();
    let mut args = std::env::args().skip(1);
    let repetitions = args
        .next()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_REPETITIONS);
    let config = match args.next() {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = Groth16Engine::<Bn254>::new(config)?;

    let blank = CubicCircuit::<Fr>::new_blank(repetitions);
    let cs = compile(blank)?;
    let (pk, vk) = setup::<Bn254, _, _>(blank, &mut create_seeded_rng())?;
    let witness = Witness::new(CubicCircuit::new(Fr::from(3u64), Fr::from(35u64), repetitions))?;

    for selector in [BackendSelector::Auto, BackendSelector::Cpu] {
        let start = Instant::now();
        let proof = engine.prove(&cs, &pk, &witness, &selector)?;
        tracing::info!("{selector} proof time: {:?}", start.elapsed());
        engine.verify(&proof, &vk, &witness.public())?;
        tracing::info!("{selector} proof verified");
    }
    Ok(())
}
