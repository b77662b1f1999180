//! Pairwise message authentication for round-1 commitments
//!
//! Commitments transit through an untrusted combiner, so each round-1
//! output carries one tag per recipient, keyed on a secret shared only by
//! the sender and that recipient. Recipients verify independently of
//! whoever relayed the message.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::algebra::PolyMatrix;
use crate::types::{PartyId, SessionId};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Pairwise shared MAC key
pub type MacKey = [u8; 32];

/// Authentication tag over a commitment
pub type MacTag = [u8; 32];

/// This party's map of pairwise keys, one per other party.
///
/// Keys are assumed provisioned by the prior authenticated handshake;
/// [`PairwiseKeys::derive_all`] derives a full map from a shared master
/// secret for tests and local deployments.
#[derive(Clone)]
pub struct PairwiseKeys {
    party_id: PartyId,
    keys: HashMap<PartyId, MacKey>,
}

impl PairwiseKeys {
    pub fn new(party_id: PartyId, keys: HashMap<PartyId, MacKey>) -> Self {
        Self { party_id, keys }
    }

    /// Derive the pairwise key map for `party_id` in a deployment of
    /// `total` parties. The key for a pair is symmetric in its members.
    pub fn derive_all(party_id: PartyId, total: usize, master: &[u8; 32]) -> Self {
        let mut keys = HashMap::new();
        for other in 0..total {
            if other == party_id {
                continue;
            }
            let (lo, hi) = if party_id < other {
                (party_id, other)
            } else {
                (other, party_id)
            };
            let mut input = [0u8; 16];
            input[..8].copy_from_slice(&(lo as u64).to_le_bytes());
            input[8..].copy_from_slice(&(hi as u64).to_le_bytes());
            keys.insert(other, *blake3::keyed_hash(master, &input).as_bytes());
        }
        Self { party_id, keys }
    }

    pub fn party_id(&self) -> PartyId {
        self.party_id
    }

    /// Compute the tag authenticating `commitment` from this party to `to`
    pub fn tag(
        &self,
        to: PartyId,
        session_id: &SessionId,
        commitment: &PolyMatrix,
    ) -> Result<MacTag> {
        let key = self.keys.get(&to).ok_or(Error::MissingPairwiseKey(to))?;
        Ok(compute_tag(key, self.party_id, to, session_id, commitment))
    }

    /// Verify a tag on a commitment claimed to come from `from`
    pub fn verify(
        &self,
        from: PartyId,
        session_id: &SessionId,
        commitment: &PolyMatrix,
        tag: &MacTag,
    ) -> Result<()> {
        let key = self.keys.get(&from).ok_or(Error::MissingPairwiseKey(from))?;
        let expected = compute_tag(key, from, self.party_id, session_id, commitment);
        if expected.ct_eq(tag).into() {
            Ok(())
        } else {
            Err(Error::MacVerificationFailed(from))
        }
    }
}

fn compute_tag(
    key: &MacKey,
    from: PartyId,
    to: PartyId,
    session_id: &SessionId,
    commitment: &PolyMatrix,
) -> MacTag {
    let mut hasher = blake3::Hasher::new();
    commitment.digest_into(&mut hasher);
    let digest = hasher.finalize();

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(session_id);
    mac.update(&(from as u64).to_le_bytes());
    mac.update(&(to as u64).to_le_bytes());
    mac.update(digest.as_bytes());
    mac.finalize().into_bytes().into()
}
