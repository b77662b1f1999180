//! Per-party signing service
//!
//! Bundles one party's engine, its pairwise authenticator keys, and its
//! view of the public key behind a single handle: the unit a host process
//! exposes over its transport. Round computations stay in
//! [`RoundEngine`](crate::sign::RoundEngine); this layer adds peer
//! commitment authentication, the combiner role gate, and liveness
//! reporting.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use crate::algebra::PolyMatrix;
use crate::challenge::Challenge;
use crate::keys::{PublicKey, SecretShare};
use crate::mac::PairwiseKeys;
use crate::params::RingtailParams;
use crate::sign::{Combiner, RoundEngine};
use crate::types::{
    short_id, Heartbeat, PartyId, PartyInfo, PartyStatus, Round1Output, Round2Output, SessionId,
    ThresholdSignature,
};
use crate::wire::{Envelope, Payload};
use crate::{Error, Result};

pub struct PartyService {
    info: PartyInfo,
    engine: RoundEngine,
    pairwise: PairwiseKeys,
    combiner: Combiner,
    /// Whether this party is the deployment's designated combiner
    combiner_role: bool,
    /// Sessions with live round state, for heartbeat reporting
    active: Mutex<BTreeSet<SessionId>>,
}

impl PartyService {
    pub fn new(
        info: PartyInfo,
        share: SecretShare,
        public_key: PublicKey,
        params: RingtailParams,
        pairwise: PairwiseKeys,
        combiner_role: bool,
    ) -> Result<Self> {
        if share.party_id != info.party_id || pairwise.party_id() != info.party_id {
            return Err(Error::Internal(format!(
                "key material for a different party handed to {}",
                info.party_id
            )));
        }
        params.validate_for_quorum(public_key.total_parties())?;
        let matrix = public_key.matrix(&params);
        Ok(Self {
            info,
            engine: RoundEngine::new(params, share, matrix, pairwise.clone()),
            pairwise,
            combiner: Combiner::new(params, public_key),
            combiner_role,
            active: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn get_info(&self) -> &PartyInfo {
        &self.info
    }

    pub fn party_id(&self) -> PartyId {
        self.info.party_id
    }

    pub fn is_combiner(&self) -> bool {
        self.combiner_role
    }

    /// Run round 1 for a session this party was invited to
    pub fn sign_round1(
        &self,
        session_id: SessionId,
        participants: &[PartyId],
    ) -> Result<Round1Output> {
        let output = self.engine.sign_round1(session_id, participants)?;
        self.active
            .lock()
            .expect("active lock poisoned")
            .insert(session_id);
        Ok(output)
    }

    /// Run round 2, consuming the round-1 mask
    pub fn sign_round2(&self, session_id: SessionId, challenge: &Challenge) -> Result<Round2Output> {
        let output = self.engine.sign_round2(session_id, challenge)?;
        self.active
            .lock()
            .expect("active lock poisoned")
            .remove(&session_id);
        Ok(output)
    }

    /// Authenticate a peer's round-1 commitment using the tag addressed to
    /// this party. Rejects outputs carrying no such tag.
    pub fn verify_round1(&self, output: &Round1Output) -> Result<()> {
        let tag = output
            .macs
            .get(&self.info.party_id)
            .ok_or(Error::MacVerificationFailed(output.party_id))?;
        self.pairwise
            .verify(output.party_id, &output.session_id, &output.commitment, tag)
    }

    /// Combine a quorum's responses into a signature. Only the designated
    /// combiner may do this.
    pub fn finalize(
        &self,
        session_id: SessionId,
        challenge: &Challenge,
        commitments: &BTreeMap<PartyId, PolyMatrix>,
        responses: &BTreeMap<PartyId, Round2Output>,
    ) -> Result<ThresholdSignature> {
        if !self.combiner_role {
            return Err(Error::NotCombiner(self.info.party_id));
        }
        self.combiner
            .finalize(session_id, challenge, commitments, responses)
    }

    /// Check a signature against the deployment public key. Public
    /// operation, available to every party.
    pub fn verify(&self, message: &[u8], signature: &ThresholdSignature) -> bool {
        self.combiner.verify(message, signature)
    }

    /// Drop round state for a session that aborted or timed out
    pub fn discard_session(&self, session_id: &SessionId) {
        self.engine.discard_session(session_id);
        self.active
            .lock()
            .expect("active lock poisoned")
            .remove(session_id);
    }

    /// Current liveness signal for this party
    pub fn heartbeat(&self) -> Heartbeat {
        let active = self.active.lock().expect("active lock poisoned");
        Heartbeat {
            party_id: self.info.party_id,
            status: if active.is_empty() {
                PartyStatus::Idle
            } else {
                PartyStatus::Signing
            },
            current_session: active.iter().next().copied(),
            load: active.len() as u32,
            timestamp: Utc::now(),
        }
    }

    /// Apply one inbound envelope and produce the reply to send, if any.
    /// Envelopes addressed to another party are dropped silently.
    pub fn handle_envelope(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let me = self.info.party_id;
        if let Some(to) = envelope.to {
            if to != me {
                return Ok(None);
            }
        }

        match envelope.payload {
            Payload::SignRequest {
                participants,
                ..
            } => {
                let output = self.sign_round1(envelope.session_id, &participants)?;
                Ok(Some(Envelope::new(
                    me,
                    None,
                    envelope.session_id,
                    Payload::Round1(output),
                )))
            }
            Payload::Round1(output) => {
                if output.party_id == me {
                    return Ok(None);
                }
                if output.party_id != envelope.from {
                    warn!(
                        from = envelope.from,
                        claimed = output.party_id,
                        "Dropping round-1 output with mismatched sender"
                    );
                    return Err(Error::MacVerificationFailed(envelope.from));
                }
                self.verify_round1(&output)?;
                debug!(
                    session_id = %short_id(&output.session_id),
                    from = output.party_id,
                    "Peer round-1 commitment authenticated"
                );
                Ok(None)
            }
            Payload::Abort { reason } => {
                debug!(
                    session_id = %short_id(&envelope.session_id),
                    from = envelope.from,
                    reason = %reason,
                    "Discarding session on abort"
                );
                self.discard_session(&envelope.session_id);
                Ok(None)
            }
            Payload::SignResponse(_) => {
                // Terminal result: the session's round state is spent
                self.discard_session(&envelope.session_id);
                Ok(None)
            }
            // Round-2 shares and heartbeats are consumed by the
            // coordinator, not by peers
            Payload::Round2(_) | Payload::Heartbeat(_) => Ok(None),
        }
    }
}

impl std::fmt::Debug for PartyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyService")
            .field("party_id", &self.info.party_id)
            .field("combiner_role", &self.combiner_role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_shares;
    use crate::wire::SignResult;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn services(total: usize, threshold: usize) -> Vec<PartyService> {
        let params = RingtailParams::test_params();
        let mut rng = ChaCha20Rng::from_seed([61u8; 32]);
        let (pk, shares) = generate_shares(&params, total, threshold, &mut rng).unwrap();
        let master = [5u8; 32];
        shares
            .into_iter()
            .map(|share| {
                let id = share.party_id;
                let info = PartyInfo {
                    party_id: id,
                    total_parties: total,
                    threshold,
                    address: format!("127.0.0.1:{}", 9000 + id),
                    public_share: pk.shares[id].clone(),
                };
                let pairwise = PairwiseKeys::derive_all(id, total, &master);
                // Party 0 doubles as the combiner
                PartyService::new(info, share, pk.clone(), params, pairwise, id == 0).unwrap()
            })
            .collect()
    }

    #[test]
    fn peer_round1_authenticates_through_untrusted_relay() {
        let parties = services(3, 2);
        let sid = [11u8; 32];
        let participants = vec![0, 1, 2];
        let out = parties[1].sign_round1(sid, &participants).unwrap();

        parties[0].verify_round1(&out).unwrap();
        parties[2].verify_round1(&out).unwrap();

        // A relay that tampers with the commitment is caught
        let mut forged = out.clone();
        forged.commitment.at_mut(0, 0).coeffs[0] += 1;
        assert!(matches!(
            parties[0].verify_round1(&forged),
            Err(Error::MacVerificationFailed(1))
        ));
    }

    #[test]
    fn round1_without_tag_for_us_is_rejected() {
        let parties = services(3, 2);
        let sid = [12u8; 32];
        let mut out = parties[1].sign_round1(sid, &[0, 1, 2]).unwrap();
        out.macs.remove(&0);
        assert!(matches!(
            parties[0].verify_round1(&out),
            Err(Error::MacVerificationFailed(1))
        ));
    }

    #[test]
    fn only_the_combiner_may_finalize() {
        let parties = services(3, 2);
        let sid = [13u8; 32];
        let participants = vec![0, 1];
        let msg = b"gate";

        let mut commitments = BTreeMap::new();
        for id in [0usize, 1] {
            let out = parties[id].sign_round1(sid, &participants).unwrap();
            commitments.insert(id, out.commitment);
        }
        let sorted: Vec<(PartyId, &PolyMatrix)> =
            commitments.iter().map(|(id, c)| (*id, c)).collect();
        let challenge =
            crate::challenge::derive(&RingtailParams::test_params(), msg, &sid, &sorted);
        let mut responses = BTreeMap::new();
        for id in [0usize, 1] {
            responses.insert(id, parties[id].sign_round2(sid, &challenge).unwrap());
        }

        assert!(matches!(
            parties[1].finalize(sid, &challenge, &commitments, &responses),
            Err(Error::NotCombiner(1))
        ));

        let sig = parties[0]
            .finalize(sid, &challenge, &commitments, &responses)
            .unwrap();
        // Any party can verify
        assert!(parties[2].verify(msg, &sig));
    }

    #[test]
    fn heartbeat_reflects_round_state() {
        let parties = services(3, 2);
        let hb = parties[0].heartbeat();
        assert_eq!(hb.status, PartyStatus::Idle);
        assert_eq!(hb.load, 0);

        let sid = [14u8; 32];
        parties[0].sign_round1(sid, &[0, 1, 2]).unwrap();
        let hb = parties[0].heartbeat();
        assert_eq!(hb.status, PartyStatus::Signing);
        assert_eq!(hb.load, 1);
        assert_eq!(hb.current_session, Some(sid));

        parties[0].discard_session(&sid);
        assert_eq!(parties[0].heartbeat().status, PartyStatus::Idle);
    }

    #[test]
    fn sign_request_envelope_yields_broadcast_round1() {
        let parties = services(3, 2);
        let sid = [15u8; 32];
        let request = Envelope::new(
            0,
            Some(1),
            sid,
            Payload::SignRequest {
                message: b"m".to_vec(),
                participants: vec![0, 1, 2],
                timeout_ms: 30_000,
            },
        );
        let reply = parties[1].handle_envelope(request).unwrap().unwrap();
        assert!(reply.is_broadcast());
        assert_eq!(reply.from, 1);
        let Payload::Round1(out) = reply.payload else {
            panic!("expected round-1 reply");
        };
        parties[2].verify_round1(&out).unwrap();
    }

    #[test]
    fn envelopes_for_other_parties_are_dropped() {
        let parties = services(3, 2);
        let env = Envelope::new(
            0,
            Some(2),
            [16u8; 32],
            Payload::SignRequest {
                message: b"m".to_vec(),
                participants: vec![0, 1, 2],
                timeout_ms: 1_000,
            },
        );
        assert!(parties[1].handle_envelope(env).unwrap().is_none());
    }

    #[test]
    fn abort_envelope_clears_round_state() {
        let parties = services(3, 2);
        let sid = [17u8; 32];
        parties[1].sign_round1(sid, &[0, 1, 2]).unwrap();
        let abort = Envelope::new(0, None, sid, Payload::Abort { reason: "stop".into() });
        parties[1].handle_envelope(abort).unwrap();
        assert_eq!(parties[1].heartbeat().load, 0);
    }

    #[test]
    fn sign_response_envelope_discards_session() {
        let parties = services(3, 2);
        let sid = [18u8; 32];
        parties[1].sign_round1(sid, &[0, 1, 2]).unwrap();
        let response = Envelope::new(
            0,
            None,
            sid,
            Payload::SignResponse(SignResult::Error { reason: "t".into() }),
        );
        parties[1].handle_envelope(response).unwrap();
        assert_eq!(parties[1].heartbeat().load, 0);
    }

    #[test]
    fn mismatched_round1_sender_is_rejected() {
        let parties = services(3, 2);
        let sid = [19u8; 32];
        let out = parties[1].sign_round1(sid, &[0, 1, 2]).unwrap();
        // Party 2 replays party 1's output under its own sender id
        let env = Envelope::new(2, Some(0), sid, Payload::Round1(out));
        assert!(matches!(
            parties[0].handle_envelope(env),
            Err(Error::MacVerificationFailed(2))
        ));
    }
}
