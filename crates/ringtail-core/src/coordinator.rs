//! Session coordination
//!
//! Thin orchestration over the session state machine and the combiner:
//! multiplexes peer messages by session id, tracks per-party liveness
//! through heartbeats, and owns the session store. Each session sits
//! behind its own lock, so independent sessions proceed in parallel while
//! submissions within one session apply atomically.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::challenge::Challenge;
use crate::keys::PublicKey;
use crate::params::RingtailParams;
use crate::session::{Session, SubmitOutcome};
use crate::sign::Combiner;
use crate::types::{
    short_id, Heartbeat, PartyId, PartyInfo, PartyStatus, Round1Output, Round2Output, SessionId,
    SessionStatus,
};
use crate::wire::{Envelope, Payload, SignResult};
use crate::{Error, Result};

struct SessionSlot {
    session: Mutex<Session>,
    /// Woken on every applied transition; backs the push-style wait path
    notify: Notify,
}

/// Coordinates signing sessions across a deployment
pub struct Coordinator {
    params: RingtailParams,
    combiner: Combiner,
    parties: DashMap<PartyId, PartyInfo>,
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    /// Most recent heartbeat per party; never persisted beyond that
    heartbeats: DashMap<PartyId, Heartbeat>,
}

impl Coordinator {
    pub fn new(params: RingtailParams, public_key: PublicKey) -> Result<Self> {
        params.validate_for_quorum(public_key.total_parties())?;
        Ok(Self {
            params,
            combiner: Combiner::new(params, public_key),
            parties: DashMap::new(),
            sessions: DashMap::new(),
            heartbeats: DashMap::new(),
        })
    }

    pub fn threshold(&self) -> usize {
        self.combiner.public_key().threshold
    }

    /// Register an immutable party record for lookup during sessions
    pub fn register_party(&self, info: PartyInfo) {
        self.parties.insert(info.party_id, info);
    }

    pub fn party(&self, party_id: PartyId) -> Option<PartyInfo> {
        self.parties.get(&party_id).map(|e| e.value().clone())
    }

    /// Open a signing session over `message` with a caller-chosen id
    #[instrument(skip(self, message, participants))]
    pub fn init_session_with_id(
        &self,
        session_id: SessionId,
        message: Vec<u8>,
        participants: Vec<PartyId>,
        timeout: Duration,
    ) -> Result<()> {
        if self.sessions.contains_key(&session_id) {
            return Err(Error::SessionExists(short_id(&session_id)));
        }
        let session = Session::new(
            session_id,
            message,
            participants,
            self.threshold(),
            self.params,
            timeout,
        )?;
        let slot = Arc::new(SessionSlot {
            session: Mutex::new(session),
            notify: Notify::new(),
        });
        self.sessions.insert(session_id, slot.clone());

        // Deadline watchdog; lazy checks on access cover callers running
        // outside a runtime
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let timed_out = {
                    let mut session = slot.session.lock().expect("session lock poisoned");
                    session.check_timeout(Instant::now())
                };
                if timed_out {
                    slot.notify.notify_waiters();
                }
            });
        }

        Ok(())
    }

    /// Open a signing session with a fresh random id
    pub fn init_session(
        &self,
        message: Vec<u8>,
        participants: Vec<PartyId>,
        timeout: Duration,
    ) -> Result<SessionId> {
        let mut session_id = [0u8; 32];
        OsRng.fill_bytes(&mut session_id);
        self.init_session_with_id(session_id, message, participants, timeout)?;
        Ok(session_id)
    }

    fn slot(&self, session_id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::SessionNotFound(short_id(session_id)))
    }

    /// Apply a round-1 submission to its session
    pub fn submit_round1(&self, output: Round1Output) -> Result<SubmitOutcome> {
        let slot = self.slot(&output.session_id)?;
        let outcome = {
            let mut session = slot.session.lock().expect("session lock poisoned");
            session.check_timeout(Instant::now());
            session.submit_round1(output)?
        };
        slot.notify.notify_waiters();
        Ok(outcome)
    }

    /// Apply a round-2 submission; when it completes the quorum, run the
    /// combiner and park the outcome in the session.
    pub fn submit_round2(&self, output: Round2Output) -> Result<SubmitOutcome> {
        let slot = self.slot(&output.session_id)?;
        let outcome = {
            let mut session = slot.session.lock().expect("session lock poisoned");
            session.check_timeout(Instant::now());
            let outcome = session.submit_round2(output)?;
            if outcome == SubmitOutcome::QuorumReached {
                self.combine(&mut session);
            }
            outcome
        };
        slot.notify.notify_waiters();
        Ok(outcome)
    }

    fn combine(&self, session: &mut Session) {
        debug_assert_eq!(session.status(), SessionStatus::Combining);
        let challenge = match session.challenge() {
            Ok(c) => c.clone(),
            Err(e) => {
                session.fail(e.to_string());
                return;
            }
        };
        let commitments = session.quorum_commitments();
        let responses = session.quorum_responses();
        match self
            .combiner
            .finalize(*session.id(), &challenge, &commitments, &responses)
        {
            Ok(signature) => session.complete(signature),
            Err(e) => session.fail(e.to_string()),
        }
    }

    /// The session's derived challenge, for parties entering round 2
    pub fn challenge(&self, session_id: &SessionId) -> Result<Challenge> {
        let slot = self.slot(session_id)?;
        let mut session = slot.session.lock().expect("session lock poisoned");
        session.check_timeout(Instant::now());
        session.challenge().cloned()
    }

    /// Accumulated round-1 outputs, for progress/polling use
    pub fn collect_round1(&self, session_id: &SessionId) -> Result<Vec<Round1Output>> {
        let slot = self.slot(session_id)?;
        let mut session = slot.session.lock().expect("session lock poisoned");
        if session.check_timeout(Instant::now()) {
            return Err(Error::TimedOut(short_id(session_id)));
        }
        Ok(session.round1_outputs().values().cloned().collect())
    }

    /// Accumulated round-2 outputs, for progress/polling use
    pub fn collect_round2(&self, session_id: &SessionId) -> Result<Vec<Round2Output>> {
        let slot = self.slot(session_id)?;
        let mut session = slot.session.lock().expect("session lock poisoned");
        if session.check_timeout(Instant::now()) {
            return Err(Error::TimedOut(short_id(session_id)));
        }
        Ok(session.round2_outputs().values().cloned().collect())
    }

    /// Terminal result or progress snapshot; never blocks
    pub fn get_signature(&self, session_id: &SessionId) -> Result<SignResult> {
        let slot = self.slot(session_id)?;
        let mut session = slot.session.lock().expect("session lock poisoned");
        session.check_timeout(Instant::now());
        Ok(Self::result_of(&session))
    }

    fn result_of(session: &Session) -> SignResult {
        match session.status() {
            SessionStatus::Completed => SignResult::Signature(
                session
                    .signature()
                    .expect("completed session holds a signature")
                    .clone(),
            ),
            SessionStatus::Failed | SessionStatus::Aborted | SessionStatus::TimedOut => {
                SignResult::Error {
                    reason: session.failure().unwrap_or("unknown").to_string(),
                }
            }
            status => {
                let (round1, round2) = session.progress();
                SignResult::Progress {
                    status,
                    round1,
                    round2,
                }
            }
        }
    }

    /// Push-style alternative to polling [`Coordinator::get_signature`]:
    /// resolves once the session reaches a terminal state.
    pub async fn wait_for_signature(&self, session_id: &SessionId) -> Result<SignResult> {
        let slot = self.slot(session_id)?;
        loop {
            let notified = slot.notify.notified();
            {
                let mut session = slot.session.lock().expect("session lock poisoned");
                session.check_timeout(Instant::now());
                if session.status().is_terminal() {
                    return Ok(Self::result_of(&session));
                }
            }
            notified.await;
        }
    }

    /// Force a session to `Aborted`
    pub fn cancel_session(&self, session_id: &SessionId) -> Result<()> {
        self.abort_session(session_id, None, "cancelled by coordinator")
    }

    pub fn abort_session(
        &self,
        session_id: &SessionId,
        by: Option<PartyId>,
        reason: &str,
    ) -> Result<()> {
        let slot = self.slot(session_id)?;
        {
            let mut session = slot.session.lock().expect("session lock poisoned");
            session.abort(by, reason)?;
        }
        slot.notify.notify_waiters();
        Ok(())
    }

    /// Non-terminal sessions, for liveness/debugging
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|entry| {
                let mut session = entry.value().session.lock().expect("session lock poisoned");
                session.check_timeout(now);
                !session.status().is_terminal()
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Ingest a liveness signal, keeping only the most recent per party
    pub fn record_heartbeat(&self, heartbeat: Heartbeat) {
        debug!(party_id = heartbeat.party_id, status = ?heartbeat.status, "Heartbeat");
        self.heartbeats.insert(heartbeat.party_id, heartbeat);
    }

    /// Parties with a heartbeat inside the grace window and not
    /// self-reported offline
    pub fn online_parties(&self, grace: chrono::Duration) -> Vec<PartyId> {
        let now = Utc::now();
        let mut online: Vec<PartyId> = self
            .heartbeats
            .iter()
            .filter(|e| {
                e.value().status != PartyStatus::Offline
                    && now.signed_duration_since(e.value().timestamp) <= grace
            })
            .map(|e| *e.key())
            .collect();
        online.sort_unstable();
        online
    }

    /// Pick `count` participants for a new session, preferring responsive
    /// parties. Heartbeat absence past the grace window marks a party
    /// offline for this selection only; in-flight sessions are unaffected.
    pub fn select_participants(&self, count: usize, grace: chrono::Duration) -> Result<Vec<PartyId>> {
        let online = self.online_parties(grace);
        let mut candidates: Vec<PartyId> = self.parties.iter().map(|e| *e.key()).collect();
        candidates.sort_by_key(|id| {
            let offline = !online.contains(id);
            let load = self
                .heartbeats
                .get(id)
                .map(|hb| hb.value().load)
                .unwrap_or(u32::MAX);
            (offline, load, *id)
        });
        candidates.truncate(count);
        if candidates.len() < self.threshold() {
            return Err(Error::InvalidParticipantSet {
                required: self.threshold(),
                actual: candidates.len(),
            });
        }
        candidates.sort_unstable();
        Ok(candidates)
    }

    /// Dispatch one peer envelope into the matching transition. Duplicate
    /// delivery is tolerated throughout.
    pub fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        match envelope.payload {
            Payload::Round1(output) => {
                Self::ensure_sender(envelope.from, output.party_id, "round-1")?;
                self.submit_round1(output)?;
            }
            Payload::Round2(output) => {
                Self::ensure_sender(envelope.from, output.party_id, "round-2")?;
                self.submit_round2(output)?;
            }
            Payload::SignRequest {
                message,
                participants,
                timeout_ms,
            } => {
                match self.init_session_with_id(
                    envelope.session_id,
                    message,
                    participants,
                    Duration::from_millis(timeout_ms),
                ) {
                    Ok(()) => {}
                    // Retransmitted request for a session we already opened
                    Err(Error::SessionExists(_)) => {
                        debug!(
                            session_id = %short_id(&envelope.session_id),
                            "Duplicate sign request absorbed"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            Payload::SignResponse(_) => {
                // Responses flow outward; nothing to apply here
            }
            Payload::Heartbeat(heartbeat) => {
                if heartbeat.party_id != envelope.from {
                    warn!(
                        from = envelope.from,
                        claimed = heartbeat.party_id,
                        "Dropping heartbeat with mismatched sender"
                    );
                    return Err(Error::UnknownParty(heartbeat.party_id));
                }
                self.record_heartbeat(heartbeat);
            }
            Payload::Abort { reason } => {
                self.abort_session(&envelope.session_id, Some(envelope.from), &reason)?;
            }
        }
        Ok(())
    }

    /// The transport attributes every envelope to its sender; round outputs
    /// claiming another party's id would let a participant occupy that
    /// party's quorum slot, so they are dropped at dispatch.
    fn ensure_sender(from: PartyId, claimed: PartyId, kind: &str) -> Result<()> {
        if from != claimed {
            warn!(from, claimed, kind, "Dropping round output with mismatched sender");
            return Err(Error::UnknownParty(claimed));
        }
        Ok(())
    }

    /// Build the current sign response envelope for a session, attributed
    /// to the party hosting this coordinator
    pub fn sign_response(
        &self,
        session_id: &SessionId,
        from: PartyId,
        to: Option<PartyId>,
    ) -> Result<Envelope> {
        let result = self.get_signature(session_id)?;
        Ok(Envelope::new(from, to, *session_id, Payload::SignResponse(result)))
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("sessions", &self.sessions.len())
            .field("parties", &self.parties.len())
            .finish()
    }
}
