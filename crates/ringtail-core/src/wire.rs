//! Peer-to-peer wire messages
//!
//! The sole protocol surface the core depends on. Every message is an
//! [`Envelope`] keyed by `(from, to, session_id, timestamp)` carrying
//! exactly one [`Payload`]. The surrounding transport layer guarantees
//! authenticity and confidentiality in transit and attributes each message
//! to a party id; duplicate delivery must be tolerated, which the session
//! layer handles through idempotent submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Heartbeat, PartyId, Round1Output, Round2Output, SessionId, SessionStatus, ThresholdSignature};

/// A peer message. `to` of `None` denotes broadcast; on the wire it is
/// encoded as 0 with party ids shifted up by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PartyId,
    #[serde(with = "wire_addr")]
    pub to: Option<PartyId>,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(from: PartyId, to: Option<PartyId>, session_id: SessionId, payload: Payload) -> Self {
        Self {
            from,
            to,
            session_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Message kinds, one tag per kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Round1(Round1Output),
    Round2(Round2Output),
    SignRequest {
        message: Vec<u8>,
        participants: Vec<PartyId>,
        timeout_ms: u64,
    },
    SignResponse(SignResult),
    Heartbeat(Heartbeat),
    Abort {
        reason: String,
    },
}

/// Result union carried by a sign response: a signature, a terminal
/// error, or a progress snapshot for polling callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignResult {
    Signature(ThresholdSignature),
    Error {
        reason: String,
    },
    Progress {
        status: SessionStatus,
        round1: usize,
        round2: usize,
    },
}

/// Wire encoding of the `to` address: 0 is broadcast, party p is p + 1
mod wire_addr {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::PartyId;

    pub fn serialize<S>(to: &Option<PartyId>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let raw = match to {
            None => 0u64,
            Some(id) => *id as u64 + 1,
        };
        serializer.serialize_u64(raw)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PartyId>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = u64::deserialize(deserializer)?;
        Ok(match raw {
            0 => None,
            id => Some((id - 1) as PartyId),
        })
    }
}
