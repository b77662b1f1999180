//! Per-party round computations

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, instrument};
use zeroize::Zeroize;

use crate::algebra::PolyMatrix;
use crate::challenge::{derive_folding, Challenge};
use crate::keys::SecretShare;
use crate::mac::PairwiseKeys;
use crate::params::RingtailParams;
use crate::types::{short_id, PartyId, Round1Output, Round2Output, SessionId};
use crate::{Error, Result};

/// Per-session round-1 state retained for round 2. The mask is single-use:
/// it is taken exactly once, and a second take is a randomness-reuse fault.
struct MaskState {
    mask: Option<PolyMatrix>,
}

impl Drop for MaskState {
    fn drop(&mut self) {
        if let Some(mask) = &mut self.mask {
            mask.zeroize();
        }
    }
}

/// One party's signing engine.
///
/// Owns the secret key share; the share never crosses this boundary. Only
/// commitments and response shares leave the engine.
pub struct RoundEngine {
    params: RingtailParams,
    share: SecretShare,
    /// Public matrix A, expanded once at construction
    matrix: PolyMatrix,
    pairwise: PairwiseKeys,
    /// Nonces used across all sessions; a repeat is a protocol-safety fault
    used_nonces: Mutex<HashSet<[u8; 32]>>,
    /// Round-1 masks awaiting their round-2 use, keyed by session
    masks: Mutex<HashMap<SessionId, MaskState>>,
}

impl RoundEngine {
    pub fn new(
        params: RingtailParams,
        share: SecretShare,
        matrix: PolyMatrix,
        pairwise: PairwiseKeys,
    ) -> Self {
        Self {
            params,
            share,
            matrix,
            pairwise,
            used_nonces: Mutex::new(HashSet::new()),
            masks: Mutex::new(HashMap::new()),
        }
    }

    pub fn party_id(&self) -> PartyId {
        self.share.party_id
    }

    /// Round 1: sample fresh per-session randomness, publish the rounded
    /// masking commitment D_i, and MAC it to every other invited party.
    #[instrument(skip(self, participants), fields(party_id = self.party_id()))]
    pub fn sign_round1(
        &self,
        session_id: SessionId,
        participants: &[PartyId],
    ) -> Result<Round1Output> {
        let party_id = self.party_id();
        if !participants.contains(&party_id) {
            return Err(Error::UnknownParty(party_id));
        }

        let mut masks = self.masks.lock().expect("mask lock poisoned");
        if masks.contains_key(&session_id) {
            return Err(Error::RandomnessReuse(party_id));
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        {
            let mut used = self.used_nonces.lock().expect("nonce lock poisoned");
            if !used.insert(nonce) {
                return Err(Error::RandomnessReuse(party_id));
            }
        }

        // Expand the mask matrix Y_i from the nonce and commit to A * Y_i
        let mut rng = ChaCha20Rng::from_seed(nonce);
        let mask = PolyMatrix::sample_bounded(
            &mut rng,
            self.params.n,
            self.params.dbar + 1,
            self.params.phi,
            self.params.gamma(),
        );
        let commitment = self
            .matrix
            .mul_matrix(&mask, self.params.q)
            .compress(self.params.xi);

        let mut macs = BTreeMap::new();
        for &other in participants {
            if other == party_id {
                continue;
            }
            macs.insert(other, self.pairwise.tag(other, &session_id, &commitment)?);
        }

        masks.insert(session_id, MaskState { mask: Some(mask) });

        debug!(
            session_id = %short_id(&session_id),
            recipients = macs.len(),
            "Round 1 commitment produced"
        );

        Ok(Round1Output {
            party_id,
            session_id,
            commitment,
            macs,
            timestamp: Utc::now(),
        })
    }

    /// Round 2: fold the stored mask with the challenge-derived vector and
    /// bind in the secret share: z_i = Y_i * g + c * s_i.
    ///
    /// Consumes the round-1 mask; invoking this twice for one session is a
    /// randomness-reuse fault.
    #[instrument(skip(self, challenge), fields(party_id = self.party_id()))]
    pub fn sign_round2(
        &self,
        session_id: SessionId,
        challenge: &Challenge,
    ) -> Result<Round2Output> {
        let party_id = self.party_id();

        let mut masks = self.masks.lock().expect("mask lock poisoned");
        let state = masks
            .get_mut(&session_id)
            .ok_or_else(|| Error::SessionNotFound(short_id(&session_id)))?;
        let mut mask = state.mask.take().ok_or(Error::RandomnessReuse(party_id))?;
        drop(masks);

        let g = derive_folding(challenge, &self.params);
        let masked = mask.fold(&g, self.params.q);
        mask.zeroize();
        let response = masked.add(
            &self.share.s.mul_poly(&challenge.c, self.params.q),
            self.params.q,
        );

        debug!(session_id = %short_id(&session_id), "Round 2 response produced");

        Ok(Round2Output {
            party_id,
            session_id,
            response,
            timestamp: Utc::now(),
        })
    }

    /// Drop round-1 state for a session that aborted or timed out
    pub fn discard_session(&self, session_id: &SessionId) {
        let mut masks = self.masks.lock().expect("mask lock poisoned");
        masks.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge;
    use crate::keys::generate_shares;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn engine_fixture() -> (RingtailParams, RoundEngine) {
        let params = RingtailParams::test_params();
        let mut rng = ChaCha20Rng::from_seed([21u8; 32]);
        let (pk, mut shares) = generate_shares(&params, 3, 2, &mut rng).unwrap();
        let matrix = pk.matrix(&params);
        let pairwise = PairwiseKeys::derive_all(0, 3, &[9u8; 32]);
        (
            params,
            RoundEngine::new(params, shares.remove(0), matrix, pairwise),
        )
    }

    fn challenge_for(
        params: &RingtailParams,
        session_id: &SessionId,
        out: &Round1Output,
    ) -> Challenge {
        challenge::derive(params, b"m", session_id, &[(0, &out.commitment)])
    }

    #[test]
    fn round1_then_round2_produces_bounded_share() {
        let (params, engine) = engine_fixture();
        let sid = [1u8; 32];
        let r1 = engine.sign_round1(sid, &[0, 1, 2]).unwrap();
        assert_eq!(r1.commitment.rows, params.m);
        assert_eq!(r1.commitment.cols, params.dbar + 1);
        assert_eq!(r1.macs.len(), 2);

        let c = challenge_for(&params, &sid, &r1);
        let r2 = engine.sign_round2(sid, &c).unwrap();
        assert_eq!(r2.response.len(), params.n);
        assert!(r2.response.inf_norm() <= params.response_bound());
    }

    #[test]
    fn repeated_round1_is_randomness_reuse() {
        let (_, engine) = engine_fixture();
        let sid = [2u8; 32];
        engine.sign_round1(sid, &[0, 1, 2]).unwrap();
        assert!(matches!(
            engine.sign_round1(sid, &[0, 1, 2]),
            Err(Error::RandomnessReuse(0))
        ));
    }

    #[test]
    fn repeated_round2_is_randomness_reuse() {
        let (params, engine) = engine_fixture();
        let sid = [3u8; 32];
        let r1 = engine.sign_round1(sid, &[0, 1, 2]).unwrap();
        let c = challenge_for(&params, &sid, &r1);
        engine.sign_round2(sid, &c).unwrap();
        assert!(matches!(
            engine.sign_round2(sid, &c),
            Err(Error::RandomnessReuse(0))
        ));
    }

    #[test]
    fn round2_without_round1_is_unknown_session() {
        let (params, engine) = engine_fixture();
        let sid = [4u8; 32];
        let other = engine.sign_round1([5u8; 32], &[0, 1, 2]).unwrap();
        let c = challenge_for(&params, &sid, &other);
        assert!(matches!(
            engine.sign_round2(sid, &c),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn round1_requires_membership() {
        let (_, engine) = engine_fixture();
        assert!(matches!(
            engine.sign_round1([6u8; 32], &[1, 2]),
            Err(Error::UnknownParty(0))
        ));
    }

    #[test]
    fn discard_clears_round1_state() {
        let (params, engine) = engine_fixture();
        let sid = [7u8; 32];
        let r1 = engine.sign_round1(sid, &[0, 1, 2]).unwrap();
        engine.discard_session(&sid);
        let c = challenge_for(&params, &sid, &r1);
        assert!(matches!(
            engine.sign_round2(sid, &c),
            Err(Error::SessionNotFound(_))
        ));
    }
}
