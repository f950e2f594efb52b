use ark_bn254::{Bn254, Fr};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::{rngs::StdRng, SeedableRng};
use test_case::test_case;
use zkaccel_groth16::{
    compile,
    prover::{Coordinator, CpuBackend, CpuDevice},
    setup,
    test_utils::CubicCircuit,
    verify, Proof, ProverError, PublicWitness, VerifierError, Witness,
};

fn prover() -> Coordinator<CpuBackend<Bn254>, CpuDevice> {
    Coordinator::new(CpuBackend::default(), CpuDevice)
}

#[test_case(1)]
#[test_case(10)]
#[test_case(200)]
fn test_cubic_roundtrip(repetitions: usize) {
    let mut rng = StdRng::seed_from_u64(repetitions as u64);
    let blank = CubicCircuit::<Fr>::new_blank(repetitions);
    let cs = compile(blank).unwrap();
    let (pk, vk) = setup::<Bn254, _, _>(blank, &mut rng).unwrap();
    let witness =
        Witness::new(CubicCircuit::new(Fr::from(3u64), Fr::from(35u64), repetitions)).unwrap();

    let proof = prover().prove(&cs, &pk, &witness, &mut rng).unwrap();
    verify(&proof, &vk, &witness.public()).unwrap();

    let mut bytes = Vec::new();
    proof.serialize_compressed(&mut bytes).unwrap();
    let decoded = Proof::<Bn254>::deserialize_compressed(&bytes[..]).unwrap();
    verify(&decoded, &vk, &witness.public()).unwrap();
}

#[test]
fn test_wrong_public_input_rejected() {
    let mut rng = StdRng::seed_from_u64(7);
    let blank = CubicCircuit::<Fr>::new_blank(3);
    let cs = compile(blank).unwrap();
    let (pk, vk) = setup::<Bn254, _, _>(blank, &mut rng).unwrap();
    let witness = Witness::new(CubicCircuit::new(Fr::from(3u64), Fr::from(35u64), 3)).unwrap();
    let proof = prover().prove(&cs, &pk, &witness, &mut rng).unwrap();

    let wrong = PublicWitness(vec![Fr::from(36u64)]);
    assert!(matches!(
        verify(&proof, &vk, &wrong),
        Err(VerifierError::VerificationFailed)
    ));
    assert!(matches!(
        verify(&proof, &vk, &PublicWitness(vec![])),
        Err(VerifierError::PublicInputCount {
            expected: 1,
            actual: 0
        })
    ));
}

#[test]
fn test_unsatisfied_witness_rejected() {
    let mut rng = StdRng::seed_from_u64(8);
    let blank = CubicCircuit::<Fr>::new_blank(2);
    let cs = compile(blank).unwrap();
    let (pk, _) = setup::<Bn254, _, _>(blank, &mut rng).unwrap();
    let witness = Witness::new(CubicCircuit::new(Fr::from(3u64), Fr::from(36u64), 2)).unwrap();
    assert!(matches!(
        prover().prove(&cs, &pk, &witness, &mut rng),
        Err(ProverError::UnsatisfiedConstraints { index: 2 })
    ));
}

#[test]
fn test_same_blinding_same_proof() {
    let mut rng = StdRng::seed_from_u64(9);
    let blank = CubicCircuit::<Fr>::new_blank(5);
    let cs = compile(blank).unwrap();
    let (pk, _) = setup::<Bn254, _, _>(blank, &mut rng).unwrap();
    let witness = Witness::new(CubicCircuit::new(Fr::from(3u64), Fr::from(35u64), 5)).unwrap();
    let (r, s) = (Fr::from(11u64), Fr::from(13u64));
    let p1 = prover()
        .prove_with_blinding(&cs, &pk, &(), &witness, r, s)
        .unwrap();
    let p2 = prover()
        .prove_with_blinding(&cs, &pk, &(), &witness, r, s)
        .unwrap();
    assert_eq!(p1, p2);
}
