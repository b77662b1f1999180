//! Error types for Ringtail signing operations

use thiserror::Error;

/// Result type alias for Ringtail operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a Ringtail signing session
#[derive(Debug, Error)]
pub enum Error {
    /// Participant set too small for the configured threshold
    #[error("Invalid participant set: need at least {required}, got {actual}")]
    InvalidParticipantSet { required: usize, actual: usize },

    /// Submission from a party outside the invited set or round-1 quorum
    #[error("Unknown party: {0}")]
    UnknownParty(usize),

    /// Per-session randomness was reused; fatal for that party's participation
    #[error("Randomness reuse detected for party {0}")]
    RandomnessReuse(usize),

    /// Round 2 requested before the round-1 quorum derived a challenge
    #[error("Challenge not ready for session {0}")]
    ChallengeNotReady(String),

    /// Response share lies outside the protocol bound
    #[error("Malformed share from party {party_id}: {detail}")]
    MalformedShare { party_id: usize, detail: String },

    /// Fewer than threshold valid contributions at finalize time
    #[error("Insufficient shares: required {required}, got {actual}")]
    InsufficientShares { required: usize, actual: usize },

    /// Terminal signing failure, reported to the caller with a reason
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Session aborted explicitly; `by` is `None` for coordinator-initiated
    /// aborts
    #[error("Session aborted: {reason}")]
    Aborted {
        by: Option<usize>,
        reason: String,
    },

    /// Session deadline exceeded; a fresh session is required to retry
    #[error("Session timed out: {0}")]
    TimedOut(String),

    /// Protocol parameters differ between parties
    #[error("Parameter mismatch: {0}")]
    ParamsMismatch(String),

    /// Invalid protocol parameters
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session id already in use
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// Pairwise commitment MAC did not verify
    #[error("MAC verification failed for message from party {0}")]
    MacVerificationFailed(usize),

    /// No pairwise key registered for the given party
    #[error("No pairwise key for party {0}")]
    MissingPairwiseKey(usize),

    /// Finalize invoked on a party without the combiner role
    #[error("Party {0} does not hold the combiner role")]
    NotCombiner(usize),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
