//! Envelopes and the bus that carries them.

pub mod bus;
pub mod envelope;
