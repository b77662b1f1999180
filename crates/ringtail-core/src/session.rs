//! Signing session state machine
//!
//! Owns the lifecycle of one signing attempt: admits participants, enforces
//! round barriers, derives the challenge at round-1 quorum, and times out
//! or aborts. All mutation goes through the transition methods here; the
//! coordinator wraps each session in its own lock so transitions are
//! atomic with respect to concurrent submissions.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::algebra::PolyMatrix;
use crate::challenge::{self, Challenge};
use crate::params::RingtailParams;
use crate::types::{
    short_id, PartyId, Round1Output, Round2Output, SessionId, SessionStatus, ThresholdSignature,
};
use crate::{Error, Result};

/// How a submission was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Recorded; the session is still waiting for more
    Accepted,
    /// Recorded, and this submission completed the round's quorum
    QuorumReached,
    /// Same (session, party) output seen before; absorbed without change
    Duplicate,
    /// Arrived after the round's quorum was fixed; kept for progress
    /// reporting only
    Late,
    /// Session already finished; result discarded rather than applied
    Discarded,
}

/// One signing attempt over a message
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    message: Vec<u8>,
    participants: BTreeSet<PartyId>,
    threshold: usize,
    params: RingtailParams,
    timeout: Duration,
    created_at: Instant,
    status: SessionStatus,
    round1: BTreeMap<PartyId, Round1Output>,
    round2: BTreeMap<PartyId, Round2Output>,
    /// Parties whose round-1 outputs fixed the challenge; set once
    quorum: Option<BTreeSet<PartyId>>,
    /// Derived once, at the round-1 -> round-2 transition
    challenge: Option<Challenge>,
    signature: Option<ThresholdSignature>,
    failure: Option<String>,
    aborted_by: Option<PartyId>,
}

impl Session {
    pub fn new(
        id: SessionId,
        message: Vec<u8>,
        participants: Vec<PartyId>,
        threshold: usize,
        params: RingtailParams,
        timeout: Duration,
    ) -> Result<Self> {
        let participants: BTreeSet<PartyId> = participants.into_iter().collect();
        if participants.len() < threshold {
            return Err(Error::InvalidParticipantSet {
                required: threshold,
                actual: participants.len(),
            });
        }

        info!(
            session_id = %short_id(&id),
            participants = ?participants,
            threshold,
            "Session created"
        );

        Ok(Self {
            id,
            message,
            participants,
            threshold,
            params,
            timeout,
            created_at: Instant::now(),
            status: SessionStatus::AwaitingRound1,
            round1: BTreeMap::new(),
            round2: BTreeMap::new(),
            quorum: None,
            challenge: None,
            signature: None,
            failure: None,
            aborted_by: None,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn participants(&self) -> &BTreeSet<PartyId> {
        &self.participants
    }

    /// Collected round counts, for progress reporting
    pub fn progress(&self) -> (usize, usize) {
        (self.round1.len(), self.round2.len())
    }

    pub fn round1_outputs(&self) -> &BTreeMap<PartyId, Round1Output> {
        &self.round1
    }

    pub fn round2_outputs(&self) -> &BTreeMap<PartyId, Round2Output> {
        &self.round2
    }

    pub fn signature(&self) -> Option<&ThresholdSignature> {
        self.signature.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// The derived challenge; available once the round-1 quorum formed
    pub fn challenge(&self) -> Result<&Challenge> {
        if self.status == SessionStatus::TimedOut {
            return Err(Error::TimedOut(short_id(&self.id)));
        }
        self.challenge
            .as_ref()
            .ok_or_else(|| Error::ChallengeNotReady(short_id(&self.id)))
    }

    /// The round-1 quorum whose commitments fixed the challenge
    pub fn quorum(&self) -> Option<&BTreeSet<PartyId>> {
        self.quorum.as_ref()
    }

    /// Commitments of exactly the challenge quorum, for combination
    pub fn quorum_commitments(&self) -> BTreeMap<PartyId, PolyMatrix> {
        let Some(quorum) = &self.quorum else {
            return BTreeMap::new();
        };
        self.round1
            .iter()
            .filter(|(id, _)| quorum.contains(id))
            .map(|(id, out)| (*id, out.commitment.clone()))
            .collect()
    }

    /// Round-2 responses restricted to the challenge quorum
    pub fn quorum_responses(&self) -> BTreeMap<PartyId, Round2Output> {
        let Some(quorum) = &self.quorum else {
            return BTreeMap::new();
        };
        self.round2
            .iter()
            .filter(|(id, _)| quorum.contains(id))
            .map(|(id, out)| (*id, out.clone()))
            .collect()
    }

    /// Mark the session timed out if its deadline has passed. Terminal
    /// states are absorbing; a timed-out session is never revived.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.status.is_terminal() {
            return self.status == SessionStatus::TimedOut;
        }
        if now.duration_since(self.created_at) >= self.timeout {
            warn!(session_id = %short_id(&self.id), "Session timed out");
            self.status = SessionStatus::TimedOut;
            self.failure = Some("deadline exceeded".into());
            return true;
        }
        false
    }

    /// Apply a round-1 submission.
    ///
    /// Duplicates are absorbed (idempotent retransmission); submissions
    /// after the quorum fixed the challenge are recorded for progress
    /// reporting but never alter the challenge or the quorum.
    pub fn submit_round1(&mut self, output: Round1Output) -> Result<SubmitOutcome> {
        self.ensure_session(&output.session_id)?;
        if !self.participants.contains(&output.party_id) {
            return Err(Error::UnknownParty(output.party_id));
        }
        self.ensure_commitment_shape(&output)?;
        if let Some(outcome) = self.terminal_outcome()? {
            return Ok(outcome);
        }

        if self.round1.contains_key(&output.party_id) {
            debug!(
                session_id = %short_id(&self.id),
                party_id = output.party_id,
                "Duplicate round-1 submission absorbed"
            );
            return Ok(SubmitOutcome::Duplicate);
        }

        let party_id = output.party_id;
        self.round1.insert(party_id, output);

        if self.status != SessionStatus::AwaitingRound1 {
            debug!(
                session_id = %short_id(&self.id),
                party_id,
                "Late round-1 submission recorded after quorum"
            );
            return Ok(SubmitOutcome::Late);
        }

        if self.round1.len() >= self.threshold {
            // Quorum reached: fix it and derive the challenge exactly once
            let quorum: BTreeSet<PartyId> = self.round1.keys().copied().collect();
            let sorted: Vec<(PartyId, &PolyMatrix)> = self
                .round1
                .iter()
                .map(|(id, out)| (*id, &out.commitment))
                .collect();
            let challenge = challenge::derive(&self.params, &self.message, &self.id, &sorted);

            info!(
                session_id = %short_id(&self.id),
                quorum = ?quorum,
                "Round-1 quorum reached, challenge derived"
            );

            self.quorum = Some(quorum);
            self.challenge = Some(challenge);
            self.status = SessionStatus::AwaitingRound2;
            return Ok(SubmitOutcome::QuorumReached);
        }

        Ok(SubmitOutcome::Accepted)
    }

    /// Apply a round-2 submission. Only parties in the round-1 quorum may
    /// contribute; processing never begins before the challenge exists.
    pub fn submit_round2(&mut self, output: Round2Output) -> Result<SubmitOutcome> {
        self.ensure_session(&output.session_id)?;
        if let Some(outcome) = self.terminal_outcome()? {
            return Ok(outcome);
        }
        if self.status == SessionStatus::AwaitingRound1 {
            return Err(Error::ChallengeNotReady(short_id(&self.id)));
        }
        let quorum = self.quorum.as_ref().expect("quorum set past round 1");
        if !quorum.contains(&output.party_id) {
            return Err(Error::UnknownParty(output.party_id));
        }
        if output.response.len() != self.params.n {
            return Err(Error::MalformedShare {
                party_id: output.party_id,
                detail: format!(
                    "response dimension {} != {}",
                    output.response.len(),
                    self.params.n
                ),
            });
        }

        if self.round2.contains_key(&output.party_id) {
            debug!(
                session_id = %short_id(&self.id),
                party_id = output.party_id,
                "Duplicate round-2 submission absorbed"
            );
            return Ok(SubmitOutcome::Duplicate);
        }

        let party_id = output.party_id;
        self.round2.insert(party_id, output);

        if self.status != SessionStatus::AwaitingRound2 {
            return Ok(SubmitOutcome::Late);
        }

        if self.round2.len() >= self.threshold {
            info!(session_id = %short_id(&self.id), "Round-2 quorum reached");
            self.status = SessionStatus::Combining;
            return Ok(SubmitOutcome::QuorumReached);
        }

        Ok(SubmitOutcome::Accepted)
    }

    /// Record the combiner's result
    pub fn complete(&mut self, signature: ThresholdSignature) {
        if self.status.is_terminal() {
            // An in-flight combination that finished after abort/timeout
            // is discarded rather than applied
            warn!(session_id = %short_id(&self.id), "Discarding result for finished session");
            return;
        }
        info!(session_id = %short_id(&self.id), signers = ?signature.signers, "Session completed");
        self.signature = Some(signature);
        self.status = SessionStatus::Completed;
    }

    /// Record a terminal signing failure
    pub fn fail(&mut self, reason: String) {
        if self.status.is_terminal() {
            return;
        }
        warn!(session_id = %short_id(&self.id), reason = %reason, "Session failed");
        self.failure = Some(reason);
        self.status = SessionStatus::Failed;
    }

    /// Abort on behalf of a participating party, or of the coordinator
    /// when `by` is `None`. Terminal states absorb the abort.
    pub fn abort(&mut self, by: Option<PartyId>, reason: &str) -> Result<()> {
        if let Some(party_id) = by {
            if !self.participants.contains(&party_id) {
                return Err(Error::UnknownParty(party_id));
            }
        }
        if self.status.is_terminal() {
            return Ok(());
        }
        warn!(
            session_id = %short_id(&self.id),
            by = ?by,
            reason = %reason,
            "Session aborted"
        );
        self.failure = Some(format!("aborted: {reason}"));
        self.aborted_by = by;
        self.status = SessionStatus::Aborted;
        Ok(())
    }

    fn ensure_session(&self, session_id: &SessionId) -> Result<()> {
        if session_id != &self.id {
            return Err(Error::Internal(format!(
                "submission for session {} routed to {}",
                short_id(session_id),
                short_id(&self.id)
            )));
        }
        Ok(())
    }

    fn ensure_commitment_shape(&self, output: &Round1Output) -> Result<()> {
        let c = &output.commitment;
        if c.rows != self.params.m || c.cols != self.params.dbar + 1 {
            return Err(Error::ParamsMismatch(format!(
                "commitment shape {}x{} != {}x{}",
                c.rows,
                c.cols,
                self.params.m,
                self.params.dbar + 1
            )));
        }
        Ok(())
    }

    /// Terminal-state handling shared by the submission paths: timed-out
    /// and aborted sessions answer with their terminal result; completed
    /// or failed sessions silently discard stragglers.
    fn terminal_outcome(&self) -> Result<Option<SubmitOutcome>> {
        match self.status {
            SessionStatus::TimedOut => Err(Error::TimedOut(short_id(&self.id))),
            SessionStatus::Aborted => Err(Error::Aborted {
                by: self.aborted_by,
                reason: self.failure.clone().unwrap_or_default(),
            }),
            SessionStatus::Completed | SessionStatus::Failed => Ok(Some(SubmitOutcome::Discarded)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use crate::algebra::PolyVector;

    fn params() -> RingtailParams {
        RingtailParams::test_params()
    }

    fn session(threshold: usize, participants: Vec<PartyId>) -> Session {
        Session::new(
            [9u8; 32],
            b"msg".to_vec(),
            participants,
            threshold,
            params(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    fn round1(party_id: PartyId, seed: u8) -> Round1Output {
        let p = params();
        let mut rng = ChaCha20Rng::from_seed([seed; 32]);
        Round1Output {
            party_id,
            session_id: [9u8; 32],
            commitment: crate::algebra::PolyMatrix::sample_bounded(
                &mut rng,
                p.m,
                p.dbar + 1,
                p.phi,
                1 << 10,
            ),
            macs: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn round2(party_id: PartyId) -> Round2Output {
        let p = params();
        Round2Output {
            party_id,
            session_id: [9u8; 32],
            response: PolyVector::zero(p.n, p.phi),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn too_few_participants_rejected() {
        let err = Session::new(
            [1u8; 32],
            b"m".to_vec(),
            vec![0, 1],
            3,
            params(),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidParticipantSet {
                required: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn quorum_fixes_challenge_and_late_round1_is_bookkeeping() {
        let mut s = session(2, vec![0, 1, 2]);
        assert_eq!(s.submit_round1(round1(0, 1)).unwrap(), SubmitOutcome::Accepted);
        assert!(s.challenge().is_err());

        assert_eq!(
            s.submit_round1(round1(1, 2)).unwrap(),
            SubmitOutcome::QuorumReached
        );
        assert_eq!(s.status(), SessionStatus::AwaitingRound2);
        let challenge = s.challenge().unwrap().clone();
        let quorum: Vec<PartyId> = s.quorum().unwrap().iter().copied().collect();
        assert_eq!(quorum, vec![0, 1]);

        // Late submission is recorded but changes neither quorum nor challenge
        assert_eq!(s.submit_round1(round1(2, 3)).unwrap(), SubmitOutcome::Late);
        assert_eq!(s.progress().0, 3);
        assert_eq!(s.challenge().unwrap(), &challenge);
        assert_eq!(s.quorum().unwrap().len(), 2);
        assert!(!s.quorum_commitments().contains_key(&2));
    }

    #[test]
    fn duplicate_round1_is_idempotent() {
        let mut s = session(3, vec![0, 1, 2, 3]);
        s.submit_round1(round1(0, 1)).unwrap();
        assert_eq!(
            s.submit_round1(round1(0, 99)).unwrap(),
            SubmitOutcome::Duplicate
        );
        assert_eq!(s.progress().0, 1);
        assert_eq!(s.status(), SessionStatus::AwaitingRound1);
    }

    #[test]
    fn round2_gated_on_challenge_and_quorum_membership() {
        let mut s = session(2, vec![0, 1, 2]);
        assert!(matches!(
            s.submit_round2(round2(0)),
            Err(Error::ChallengeNotReady(_))
        ));

        s.submit_round1(round1(0, 1)).unwrap();
        s.submit_round1(round1(1, 2)).unwrap();

        // Party 2 was invited but is outside the round-1 quorum
        assert!(matches!(s.submit_round2(round2(2)), Err(Error::UnknownParty(2))));

        assert_eq!(s.submit_round2(round2(0)).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(
            s.submit_round2(round2(0)).unwrap(),
            SubmitOutcome::Duplicate
        );
        assert_eq!(
            s.submit_round2(round2(1)).unwrap(),
            SubmitOutcome::QuorumReached
        );
        assert_eq!(s.status(), SessionStatus::Combining);
    }

    #[test]
    fn uninvited_party_rejected() {
        let mut s = session(2, vec![0, 1]);
        assert!(matches!(
            s.submit_round1(round1(7, 1)),
            Err(Error::UnknownParty(7))
        ));
    }

    #[test]
    fn timeout_is_terminal_and_monotonic() {
        let mut s = Session::new(
            [9u8; 32],
            b"m".to_vec(),
            vec![0, 1, 2],
            2,
            params(),
            Duration::from_millis(0),
        )
        .unwrap();
        assert!(s.check_timeout(Instant::now()));
        assert_eq!(s.status(), SessionStatus::TimedOut);

        // Never revived: submissions and queries answer with the timeout
        assert!(matches!(s.submit_round1(round1(0, 1)), Err(Error::TimedOut(_))));
        assert!(matches!(s.challenge(), Err(Error::TimedOut(_))));
        assert!(s.check_timeout(Instant::now()));
        assert_eq!(s.status(), SessionStatus::TimedOut);

        // Abort does not regress a terminal state
        s.abort(Some(0), "late abort").unwrap();
        assert_eq!(s.status(), SessionStatus::TimedOut);
    }

    #[test]
    fn abort_from_participant_and_coordinator() {
        let mut s = session(2, vec![0, 1]);
        assert!(matches!(
            s.abort(Some(5), "not mine"),
            Err(Error::UnknownParty(5))
        ));
        s.abort(None, "operator cancel").unwrap();
        assert_eq!(s.status(), SessionStatus::Aborted);
        assert!(matches!(s.submit_round1(round1(0, 1)), Err(Error::Aborted { .. })));
    }

    #[test]
    fn abort_errors_attribute_their_initiator() {
        // Coordinator-initiated aborts carry no party id
        let mut s = session(2, vec![0, 1]);
        s.abort(None, "operator cancel").unwrap();
        assert!(matches!(
            s.submit_round1(round1(0, 1)),
            Err(Error::Aborted { by: None, .. })
        ));

        let mut s = session(2, vec![0, 1]);
        s.abort(Some(1), "changed my mind").unwrap();
        assert!(matches!(
            s.submit_round1(round1(0, 1)),
            Err(Error::Aborted { by: Some(1), .. })
        ));
    }

    #[test]
    fn results_after_completion_are_discarded() {
        let mut s = session(2, vec![0, 1]);
        s.submit_round1(round1(0, 1)).unwrap();
        s.submit_round1(round1(1, 2)).unwrap();
        s.submit_round2(round2(0)).unwrap();
        s.submit_round2(round2(1)).unwrap();
        s.fail("combiner declined".into());
        assert_eq!(s.status(), SessionStatus::Failed);
        assert_eq!(
            s.submit_round2(round2(1)).unwrap(),
            SubmitOutcome::Discarded
        );
    }
}
