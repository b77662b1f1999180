//! Transport abstraction
//!
//! The protocol core never talks to sockets directly: hosts hand envelopes
//! to a [`Delivery`] implementation and pull their inbound ones back out.
//! Implementations must attribute envelopes to their sender and reject
//! unauthenticated traffic; the core additionally MACs round-1 commitments
//! so a compromised relay cannot substitute them.

use crate::types::PartyId;
use crate::wire::Envelope;
use crate::Result;

pub use ::async_trait::async_trait;

/// Envelope transport between parties and the coordinator
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Hand an envelope to the transport. Broadcast envelopes fan out to
    /// every registered mailbox except the sender's.
    async fn deliver(&self, envelope: Envelope) -> Result<()>;

    /// Wait until at least `count` envelopes sit in `my_id`'s mailbox,
    /// then drain and return them in arrival order.
    async fn collect(&self, my_id: PartyId, count: usize) -> Result<Vec<Envelope>>;
}

/// In-memory delivery for testing
pub mod memory;

pub use memory::MemoryDelivery;
