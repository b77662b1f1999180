//! Deterministic challenge derivation (Fiat-Shamir)
//!
//! The challenge binds the message, the session and exactly which parties'
//! round-1 commitments formed the quorum: any verifier recomputing from the
//! same inputs gets the same sparse polynomial.

use digest::{ExtendableOutput, Update, XofReader};
use serde::{Deserialize, Serialize};
use sha3::Shake256;
use subtle::ConstantTimeEq;

use crate::algebra::{Poly, PolyMatrix};
use crate::params::RingtailParams;
use crate::types::{PartyId, SessionId};

/// Domain separator for the challenge hash
const CHALLENGE_DOMAIN: &[u8] = b"ringtail/challenge";
/// Domain separator for the sample-in-ball expansion
const BALL_DOMAIN: &[u8] = b"ringtail/ball";
/// Domain separator for the commitment-folding vector
const FOLD_DOMAIN: &[u8] = b"ringtail/fold";

/// The derived challenge: a 32-byte transcript seed plus the sparse
/// polynomial c it expands to (exactly kappa coefficients in {-1, +1}).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub seed: [u8; 32],
    pub c: Poly,
}

impl Challenge {
    /// Seed equality in constant time
    pub fn ct_eq_seed(&self, other: &Challenge) -> bool {
        self.seed.ct_eq(&other.seed).into()
    }
}

/// Derive the challenge from the message, the session id and the quorum's
/// commitments. `quorum` must be sorted ascending by party id; the session
/// state machine hands it over that way.
pub fn derive(
    params: &RingtailParams,
    message: &[u8],
    session_id: &SessionId,
    quorum: &[(PartyId, &PolyMatrix)],
) -> Challenge {
    debug_assert!(quorum.windows(2).all(|w| w[0].0 < w[1].0));

    let mut hasher = blake3::Hasher::new();
    hasher.update(CHALLENGE_DOMAIN);
    hasher.update(&(message.len() as u64).to_le_bytes());
    hasher.update(message);
    hasher.update(session_id);
    hasher.update(&(quorum.len() as u64).to_le_bytes());
    for (party_id, commitment) in quorum {
        hasher.update(&(*party_id as u64).to_le_bytes());
        commitment.digest_into(&mut hasher);
    }
    let seed = *hasher.finalize().as_bytes();

    let c = sample_in_ball(&seed, params);
    Challenge { seed, c }
}

/// Expand a seed into a polynomial with exactly kappa nonzero (+-1)
/// coefficients, via an in-place Fisher-Yates shuffle driven by SHAKE256.
pub fn sample_in_ball(seed: &[u8; 32], params: &RingtailParams) -> Poly {
    let mut xof = Shake256::default();
    xof.update(BALL_DOMAIN);
    xof.update(seed);
    let mut reader = xof.finalize_xof();

    let mut c = Poly::zero(params.phi);
    for i in (params.phi - params.kappa)..params.phi {
        let j = sample_index(&mut reader, i + 1);
        let sign = if next_byte(&mut reader) & 1 == 0 { 1 } else { -1 };
        c.coeffs[i] = c.coeffs[j];
        c.coeffs[j] = sign;
    }
    c
}

/// Derive the folding vector g of length dbar + 1 from the challenge seed.
/// g[0] is the constant 1; the remaining entries are signed monomials, so
/// folding never grows coefficient magnitudes.
pub fn derive_folding(challenge: &Challenge, params: &RingtailParams) -> Vec<Poly> {
    let mut xof = Shake256::default();
    xof.update(FOLD_DOMAIN);
    xof.update(&challenge.seed);
    let mut reader = xof.finalize_xof();

    let mut g = Vec::with_capacity(params.dbar + 1);
    g.push(Poly::monomial(params.phi, 0, 1));
    for _ in 0..params.dbar {
        let degree = sample_index(&mut reader, params.phi);
        let sign = if next_byte(&mut reader) & 1 == 0 { 1 } else { -1 };
        g.push(Poly::monomial(params.phi, degree, sign));
    }
    g
}

fn next_byte(reader: &mut impl XofReader) -> u8 {
    let mut b = [0u8; 1];
    reader.read(&mut b);
    b[0]
}

/// Uniform index in [0, bound) by rejection sampling over 16-bit draws
fn sample_index(reader: &mut impl XofReader, bound: usize) -> usize {
    debug_assert!(bound > 0 && bound <= 1 << 16);
    let limit = (1usize << 16) / bound * bound;
    loop {
        let mut b = [0u8; 2];
        reader.read(&mut b);
        let v = u16::from_le_bytes(b) as usize;
        if v < limit {
            return v % bound;
        }
    }
}
