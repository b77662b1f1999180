//! Core types for the Ringtail signing protocol

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::algebra::{PolyMatrix, PolyVector};
use crate::challenge::Challenge;
use crate::mac::MacTag;

/// Unique identifier for a party in a deployment (0-indexed)
pub type PartyId = usize;

/// Unique identifier for a signing session
pub type SessionId = [u8; 32];

/// Shorten a session id for log output
pub fn short_id(id: &SessionId) -> String {
    hex::encode(&id[..8])
}

/// Immutable registration record for one party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyInfo {
    /// This party's ID
    pub party_id: PartyId,

    /// Total number of parties in the deployment
    pub total_parties: usize,

    /// Threshold (t-of-K)
    pub threshold: usize,

    /// Network address of the party
    pub address: String,

    /// This party's public key share b_i = A * s_i
    pub public_share: PolyVector,
}

/// Lifecycle state of a signing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Pre-admission state. `Session::new` performs the
    /// Idle -> AwaitingRound1 transition atomically with participant
    /// admission, so a stored session is never observed Idle.
    Idle,
    AwaitingRound1,
    AwaitingRound2,
    Combining,
    Completed,
    Failed,
    Aborted,
    TimedOut,
}

impl SessionStatus {
    /// Terminal states are never left once entered
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Aborted
                | SessionStatus::TimedOut
        )
    }
}

/// A party's round-1 contribution: the rounded masking commitment plus one
/// MAC per other invited participant, so recipients can authenticate the
/// commitment without trusting the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1Output {
    pub party_id: PartyId,
    pub session_id: SessionId,
    /// Rounded commitment D_i, an m x (dbar + 1) matrix of high parts
    pub commitment: PolyMatrix,
    /// Authenticator tags keyed by recipient party id
    pub macs: BTreeMap<PartyId, MacTag>,
    pub timestamp: DateTime<Utc>,
}

/// A party's round-2 contribution: the response share z_i
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round2Output {
    pub party_id: PartyId,
    pub session_id: SessionId,
    /// Response share z_i, an n-dimensional ring vector
    pub response: PolyVector,
    pub timestamp: DateTime<Utc>,
}

/// The combined threshold signature.
///
/// The quorum's rounded commitments are embedded so that any verifier can
/// re-derive the challenge without access to session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdSignature {
    pub session_id: SessionId,
    /// Sparse challenge polynomial with exactly kappa nonzero coefficients
    pub challenge: Challenge,
    /// Aggregated response z = sum of z_i over the signers
    pub z: PolyVector,
    /// Correction term reconciling the rounded commitments with the exact
    /// verification equation
    pub delta: PolyVector,
    /// Parties whose round-2 shares contributed, sorted ascending
    pub signers: Vec<PartyId>,
    /// Round-1 commitments of the challenge quorum, keyed by party id
    pub commitments: BTreeMap<PartyId, PolyMatrix>,
}

/// Reported liveness status of a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyStatus {
    Idle,
    Signing,
    Offline,
}

/// Liveness signal; only the most recent heartbeat per party is retained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub party_id: PartyId,
    pub status: PartyStatus,
    pub current_session: Option<SessionId>,
    /// Number of in-flight signing sessions at the sender
    pub load: u32,
    pub timestamp: DateTime<Utc>,
}
