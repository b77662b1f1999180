//! Signing computation: per-party round engine and the combiner
//!
//! [`engine::RoundEngine`] performs the local round-1 (commitment) and
//! round-2 (response share) computations over a secret key share;
//! [`combine::Combiner`] aggregates a quorum's round outputs into one
//! signature and validates signatures against the public key.

mod combine;
mod engine;

pub use combine::Combiner;
pub use engine::RoundEngine;
