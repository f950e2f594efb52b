mod cubic_circuit;

pub use cubic_circuit::*;
