//! Signature combination and verification

use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use crate::algebra::{PolyMatrix, PolyVector};
use crate::challenge::{self, derive_folding, Challenge};
use crate::keys::PublicKey;
use crate::params::RingtailParams;
use crate::types::{short_id, PartyId, Round2Output, SessionId, ThresholdSignature};
use crate::{Error, Result};

/// Aggregates a quorum's round outputs into one signature and checks
/// signatures against the public key. Holds no secret material.
pub struct Combiner {
    params: RingtailParams,
    public_key: PublicKey,
}

impl Combiner {
    pub fn new(params: RingtailParams, public_key: PublicKey) -> Self {
        Self { params, public_key }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Combine round-2 response shares into a signature.
    ///
    /// `commitments` is the round-1 quorum recorded when the challenge was
    /// derived; `responses` must come from parties inside that quorum.
    /// Out-of-bound shares are excluded and combination is retried with the
    /// remaining parties if at least threshold of them survive.
    #[instrument(skip_all, fields(session_id = %short_id(&session_id)))]
    pub fn finalize(
        &self,
        session_id: SessionId,
        challenge: &Challenge,
        commitments: &BTreeMap<PartyId, PolyMatrix>,
        responses: &BTreeMap<PartyId, Round2Output>,
    ) -> Result<ThresholdSignature> {
        let threshold = self.public_key.threshold;
        if responses.len() < threshold {
            return Err(Error::InsufficientShares {
                required: threshold,
                actual: responses.len(),
            });
        }
        for (&party_id, out) in responses {
            if !commitments.contains_key(&party_id) {
                return Err(Error::UnknownParty(party_id));
            }
            if out.response.len() != self.params.n {
                return Err(Error::MalformedShare {
                    party_id,
                    detail: format!(
                        "response dimension {} != {}",
                        out.response.len(),
                        self.params.n
                    ),
                });
            }
        }

        // Exclude out-of-bound shares; an honest share always passes
        let bound = self.params.response_bound();
        let mut signers = Vec::new();
        let mut excluded = Vec::new();
        for (&party_id, out) in responses {
            if out.response.inf_norm() <= bound {
                signers.push(party_id);
            } else {
                warn!(party_id, "Excluding out-of-bound response share");
                excluded.push(party_id);
            }
        }
        if signers.len() < threshold {
            return Err(Error::SigningFailed(format!(
                "only {} valid shares remain after excluding {:?}",
                signers.len(),
                excluded
            )));
        }

        let q = self.params.q;
        let mut z = PolyVector::zero(self.params.n, self.params.phi);
        for &id in &signers {
            z = z.add(&responses[&id].response, q);
        }

        // Correction term: the folded rounded commitments minus the exact
        // value A*z - c*B_Q the verifier recomputes
        let g = derive_folding(challenge, &self.params);
        let mut folded = PolyVector::zero(self.params.m, self.params.phi);
        for &id in &signers {
            let exact = commitments[&id].decompress(self.params.xi, q).fold(&g, q);
            folded = folded.add(&exact, q);
        }
        let quorum_key = self.public_key.quorum_key(&signers, &self.params)?;
        let matrix = self.public_key.matrix(&self.params);
        let recomputed = matrix
            .mul_vector(&z, q)
            .sub(&quorum_key.mul_poly(&challenge.c, q), q);
        let delta = folded.sub(&recomputed, q);

        if delta.inf_norm() > self.params.delta_bound() {
            return Err(Error::SigningFailed(format!(
                "correction term out of bound: {} > {}",
                delta.inf_norm(),
                self.params.delta_bound()
            )));
        }

        debug!(signers = ?signers, excluded = ?excluded, "Signature combined");

        Ok(ThresholdSignature {
            session_id,
            challenge: challenge.clone(),
            z,
            delta,
            signers,
            commitments: commitments.clone(),
        })
    }

    /// Check a signature against the public key.
    ///
    /// Uses only public values; all coefficient comparisons run over the
    /// full vectors so timing does not depend on which coefficients are
    /// nonzero or which signers participated.
    pub fn verify(&self, message: &[u8], signature: &ThresholdSignature) -> bool {
        let params = &self.params;
        let q = params.q;

        // Structural checks on public layout
        let signers = &signature.signers;
        if signers.len() < self.public_key.threshold {
            return false;
        }
        if signers.windows(2).any(|w| w[0] >= w[1]) {
            return false;
        }
        if signers
            .iter()
            .any(|&id| id >= self.public_key.total_parties())
        {
            return false;
        }
        if signers
            .iter()
            .any(|id| !signature.commitments.contains_key(id))
        {
            return false;
        }
        if signature.z.len() != params.n
            || signature.delta.len() != params.m
            || signature.challenge.c.dim() != params.phi
        {
            return false;
        }
        if signature
            .commitments
            .values()
            .any(|c| c.rows != params.m || c.cols != params.dbar + 1)
        {
            return false;
        }

        // Re-derive the challenge from the embedded quorum commitments;
        // neither the seed nor the expanded polynomial is trusted.
        let quorum: Vec<(PartyId, &PolyMatrix)> = signature
            .commitments
            .iter()
            .map(|(id, c)| (*id, c))
            .collect();
        let derived = challenge::derive(params, message, &signature.session_id, &quorum);

        let mut ok = derived.ct_eq_seed(&signature.challenge);
        ok &= derived.c.ct_eq(&signature.challenge.c);
        ok &= derived.c.weight() == params.kappa;
        ok &= signature.z.inf_norm() <= params.aggregate_response_bound(signers.len());
        ok &= signature.delta.inf_norm() <= params.delta_bound();

        // Verification equation over the signers' subset of the quorum
        let quorum_key = match self.public_key.quorum_key(signers, params) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let g = derive_folding(&derived, params);
        let mut folded = PolyVector::zero(params.m, params.phi);
        for &id in signers {
            let exact = signature.commitments[&id].decompress(params.xi, q).fold(&g, q);
            folded = folded.add(&exact, q);
        }
        let matrix = self.public_key.matrix(params);
        let recomputed = matrix
            .mul_vector(&signature.z, q)
            .sub(&quorum_key.mul_poly(&derived.c, q), q);
        ok &= folded.sub(&signature.delta, q).ct_eq(&recomputed);

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_shares;
    use crate::mac::PairwiseKeys;
    use crate::sign::RoundEngine;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    struct Fixture {
        params: RingtailParams,
        combiner: Combiner,
        engines: Vec<RoundEngine>,
    }

    fn fixture(total: usize, threshold: usize) -> Fixture {
        let params = RingtailParams::test_params();
        let mut rng = ChaCha20Rng::from_seed([31u8; 32]);
        let (pk, shares) = generate_shares(&params, total, threshold, &mut rng).unwrap();
        let matrix = pk.matrix(&params);
        let master = [17u8; 32];
        let engines = shares
            .into_iter()
            .map(|share| {
                let pairwise = PairwiseKeys::derive_all(share.party_id, total, &master);
                RoundEngine::new(params, share, matrix.clone(), pairwise)
            })
            .collect();
        Fixture {
            params,
            combiner: Combiner::new(params, pk),
            engines,
        }
    }

    fn run_rounds(
        fx: &Fixture,
        session_id: SessionId,
        message: &[u8],
        quorum: &[PartyId],
    ) -> (Challenge, BTreeMap<PartyId, PolyMatrix>, BTreeMap<PartyId, Round2Output>) {
        let participants: Vec<PartyId> = (0..fx.engines.len()).collect();
        let mut commitments = BTreeMap::new();
        for &id in quorum {
            let out = fx.engines[id].sign_round1(session_id, &participants).unwrap();
            commitments.insert(id, out.commitment);
        }
        let sorted: Vec<(PartyId, &PolyMatrix)> =
            commitments.iter().map(|(id, c)| (*id, c)).collect();
        let challenge = challenge::derive(&fx.params, message, &session_id, &sorted);
        let mut responses = BTreeMap::new();
        for &id in quorum {
            let out = fx.engines[id].sign_round2(session_id, &challenge).unwrap();
            responses.insert(id, out);
        }
        (challenge, commitments, responses)
    }

    #[test]
    fn honest_quorum_signature_verifies() {
        let fx = fixture(4, 3);
        let sid = [41u8; 32];
        let msg = b"release v1.2.0";
        let (challenge, commitments, responses) = run_rounds(&fx, sid, msg, &[0, 1, 3]);

        let sig = fx
            .combiner
            .finalize(sid, &challenge, &commitments, &responses)
            .unwrap();
        assert_eq!(sig.signers, vec![0, 1, 3]);
        assert_eq!(sig.challenge.c.weight(), fx.params.kappa);
        assert!(fx.combiner.verify(msg, &sig));
    }

    #[test]
    fn wrong_message_fails_verification() {
        let fx = fixture(4, 3);
        let sid = [42u8; 32];
        let (challenge, commitments, responses) = run_rounds(&fx, sid, b"real", &[0, 1, 2]);
        let sig = fx
            .combiner
            .finalize(sid, &challenge, &commitments, &responses)
            .unwrap();
        assert!(!fx.combiner.verify(b"forged", &sig));
    }

    #[test]
    fn tampered_response_fails_verification() {
        let fx = fixture(4, 3);
        let sid = [43u8; 32];
        let msg = b"payload";
        let (challenge, commitments, responses) = run_rounds(&fx, sid, msg, &[0, 1, 2]);
        let mut sig = fx
            .combiner
            .finalize(sid, &challenge, &commitments, &responses)
            .unwrap();
        sig.z.polys[0].coeffs[0] += 1;
        assert!(!fx.combiner.verify(msg, &sig));
    }

    #[test]
    fn malformed_share_is_excluded_when_enough_remain() {
        let fx = fixture(5, 3);
        let sid = [44u8; 32];
        let msg = b"exclusion";
        let (challenge, commitments, mut responses) = run_rounds(&fx, sid, msg, &[0, 1, 2, 3]);

        // Party 3 turns malicious: push a coefficient far out of bound
        let bad = responses.get_mut(&3).unwrap();
        bad.response.polys[0].coeffs[0] = fx.params.response_bound() * 2;

        let sig = fx
            .combiner
            .finalize(sid, &challenge, &commitments, &responses)
            .unwrap();
        assert_eq!(sig.signers, vec![0, 1, 2]);
        assert!(fx.combiner.verify(msg, &sig));
    }

    #[test]
    fn too_many_malformed_shares_fail_signing() {
        let fx = fixture(4, 3);
        let sid = [45u8; 32];
        let (challenge, commitments, mut responses) = run_rounds(&fx, sid, b"m", &[0, 1, 2]);
        let bad = responses.get_mut(&2).unwrap();
        bad.response.polys[0].coeffs[0] = fx.params.response_bound() * 2;

        assert!(matches!(
            fx.combiner.finalize(sid, &challenge, &commitments, &responses),
            Err(Error::SigningFailed(_))
        ));
    }

    #[test]
    fn too_few_shares_is_insufficient() {
        let fx = fixture(4, 3);
        let sid = [46u8; 32];
        let (challenge, commitments, mut responses) = run_rounds(&fx, sid, b"m", &[0, 1, 2]);
        responses.remove(&2);

        assert!(matches!(
            fx.combiner.finalize(sid, &challenge, &commitments, &responses),
            Err(Error::InsufficientShares {
                required: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn response_outside_quorum_is_unknown_party() {
        let fx = fixture(5, 3);
        let sid = [47u8; 32];
        let (challenge, commitments, mut responses) = run_rounds(&fx, sid, b"m", &[0, 1, 2]);

        // Party 4 never committed in round 1 but smuggles in a response
        let stray = Round2Output {
            party_id: 4,
            session_id: sid,
            response: responses[&0].response.clone(),
            timestamp: chrono::Utc::now(),
        };
        responses.insert(4, stray);

        assert!(matches!(
            fx.combiner.finalize(sid, &challenge, &commitments, &responses),
            Err(Error::UnknownParty(4))
        ));
    }
}
