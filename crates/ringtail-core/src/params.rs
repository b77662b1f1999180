//! Protocol parameters for the Ringtail threshold lattice scheme

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Coefficient range of secret key shares
pub const ETA: i64 = 2;

/// Fixed per-deployment protocol parameters.
///
/// Every party in a session must use identical parameters; a session
/// created with mismatched parameters is rejected at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingtailParams {
    /// Rows of the public matrix A
    pub m: usize,
    /// Columns of the public matrix A (response dimension)
    pub n: usize,
    /// Commitment width minus one: commitments are m x (dbar + 1)
    pub dbar: usize,
    /// Hamming weight of the challenge polynomial
    pub kappa: usize,
    /// Ring dimension (coefficients per polynomial)
    pub phi: usize,
    /// Coefficient modulus, an odd prime
    pub q: i64,
    /// Rounding shift applied to round-1 commitments
    pub xi: u32,
    /// Bound shift for the correction term delta
    pub nu: u32,
}

impl RingtailParams {
    /// Recommended deployment parameters.
    ///
    /// q is the ML-DSA prime 2^23 - 2^13 + 1; the remaining sizes follow
    /// the parameter roles of the Ringtail construction.
    pub fn recommended() -> Self {
        Self {
            m: 4,
            n: 4,
            dbar: 2,
            kappa: 39,
            phi: 256,
            q: 8_380_417,
            xi: 9,
            nu: 16,
        }
    }

    /// Small parameters for fast unit tests. Not secure.
    pub fn test_params() -> Self {
        Self {
            m: 2,
            n: 2,
            dbar: 1,
            kappa: 4,
            phi: 16,
            q: 8_380_417,
            xi: 9,
            nu: 14,
        }
    }

    /// Validate internal consistency of the parameter set
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.n == 0 || self.phi == 0 {
            return Err(Error::InvalidParams("zero dimension".into()));
        }
        if self.q < 3 || self.q % 2 == 0 {
            return Err(Error::InvalidParams("q must be an odd prime".into()));
        }
        if self.kappa == 0 || self.kappa > self.phi {
            return Err(Error::InvalidParams(format!(
                "kappa {} out of range for phi {}",
                self.kappa, self.phi
            )));
        }
        if (1i64 << self.xi) >= self.q {
            return Err(Error::InvalidParams("xi exceeds modulus width".into()));
        }
        if self.nu as usize >= self.q_bits() {
            return Err(Error::InvalidParams("nu exceeds modulus width".into()));
        }
        if self.gamma().checked_mul((self.dbar + 1) as i64).is_none() {
            return Err(Error::InvalidParams("mask range overflow".into()));
        }
        Ok(())
    }

    /// Validate that honest corrections stay within 2^nu for up to
    /// `max_quorum` contributing parties.
    pub fn validate_for_quorum(&self, max_quorum: usize) -> Result<()> {
        self.validate()?;
        let worst = (max_quorum as i64)
            * ((self.dbar + 1) as i64)
            * (1i64 << (self.xi - 1));
        if worst > self.delta_bound() {
            return Err(Error::InvalidParams(format!(
                "nu {} too small for quorum size {}",
                self.nu, max_quorum
            )));
        }
        Ok(())
    }

    /// Number of bits in q
    pub fn q_bits(&self) -> usize {
        64 - self.q.leading_zeros() as usize
    }

    /// Mask coefficient range: round-1 masks are sampled uniformly in
    /// (-gamma, gamma)
    pub fn gamma(&self) -> i64 {
        1i64 << (self.q_bits() - 4)
    }

    /// Infinity-norm bound an honest per-party response share satisfies
    pub fn response_bound(&self) -> i64 {
        (self.dbar + 1) as i64 * self.gamma() + self.kappa as i64 * ETA
    }

    /// Infinity-norm bound on the aggregated response of `quorum` parties
    pub fn aggregate_response_bound(&self, quorum: usize) -> i64 {
        let raw = (quorum as i64).saturating_mul(self.response_bound());
        raw.min((self.q - 1) / 2)
    }

    /// Infinity-norm bound on the correction term
    pub fn delta_bound(&self) -> i64 {
        1i64 << self.nu
    }
}
