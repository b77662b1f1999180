//! Key material: secret shares and the deployment public key
//!
//! Distributed key-share issuance is out of scope; shares are assumed to
//! pre-exist. [`generate_shares`] is a local trusted dealer used for tests
//! and single-operator provisioning.

use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::algebra::{PolyMatrix, PolyVector};
use crate::params::{RingtailParams, ETA};
use crate::types::PartyId;
use crate::{Error, Result};

/// Domain separator for public matrix expansion
const MATRIX_DOMAIN: &[u8] = b"ringtail/matrix";

/// One party's secret key share. Never transmitted; zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretShare {
    #[zeroize(skip)]
    pub party_id: PartyId,
    /// Small secret vector s_i (n ring elements, coefficients in [-eta, eta])
    pub s: PolyVector,
}

/// The deployment public key: the seed of the public matrix A plus every
/// party's key share b_i = A * s_i.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKey {
    /// Seed the public matrix A is expanded from
    pub matrix_seed: [u8; 32],
    /// Threshold t
    pub threshold: usize,
    /// Per-party public key shares, indexed by party id
    pub shares: Vec<PolyVector>,
}

impl PublicKey {
    /// Expand the public matrix A (m x n) from the seed
    pub fn matrix(&self, params: &RingtailParams) -> PolyMatrix {
        PolyMatrix::expand_uniform(
            &self.matrix_seed,
            MATRIX_DOMAIN,
            params.m,
            params.n,
            params.phi,
            params.q,
        )
    }

    /// Total number of parties holding shares
    pub fn total_parties(&self) -> usize {
        self.shares.len()
    }

    /// Aggregate key of a quorum: B_Q = sum of b_i over the signers
    pub fn quorum_key(&self, signers: &[PartyId], params: &RingtailParams) -> Result<PolyVector> {
        let mut acc = PolyVector::zero(params.m, params.phi);
        for &id in signers {
            let share = self
                .shares
                .get(id)
                .ok_or(Error::UnknownParty(id))?;
            acc = acc.add(share, params.q);
        }
        Ok(acc)
    }
}

/// Deal consistent key shares for `total` parties.
///
/// The aggregate secret is additive: any quorum's effective key is the sum
/// of its members' shares, matched by [`PublicKey::quorum_key`].
pub fn generate_shares<R: Rng>(
    params: &RingtailParams,
    total: usize,
    threshold: usize,
    rng: &mut R,
) -> Result<(PublicKey, Vec<SecretShare>)> {
    params.validate_for_quorum(total)?;
    if threshold == 0 || threshold > total {
        return Err(Error::InvalidParams(format!(
            "threshold {threshold} out of range for {total} parties"
        )));
    }

    let mut matrix_seed = [0u8; 32];
    rng.fill(&mut matrix_seed);
    let matrix = PolyMatrix::expand_uniform(
        &matrix_seed,
        MATRIX_DOMAIN,
        params.m,
        params.n,
        params.phi,
        params.q,
    );

    let mut shares = Vec::with_capacity(total);
    let mut public_shares = Vec::with_capacity(total);
    for party_id in 0..total {
        let s = PolyVector::sample_bounded(rng, params.n, params.phi, ETA + 1);
        public_shares.push(matrix.mul_vector(&s, params.q));
        shares.push(SecretShare { party_id, s });
    }

    Ok((
        PublicKey {
            matrix_seed,
            threshold,
            shares: public_shares,
        },
        shares,
    ))
}
