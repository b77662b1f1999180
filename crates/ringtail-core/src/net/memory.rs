//! In-memory delivery implementation for testing

use super::{async_trait, Delivery};
use crate::types::PartyId;
use crate::wire::Envelope;
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// In-memory envelope transport for local testing.
///
/// Envelopes cross the mailbox boundary serialized, so anything that would
/// not survive a real wire fails here too.
pub struct MemoryDelivery {
    /// Per-recipient mailboxes of serialized envelopes
    mailboxes: Arc<DashMap<PartyId, Vec<Vec<u8>>>>,
    /// Notification channel
    notify: broadcast::Sender<()>,
}

impl MemoryDelivery {
    /// Create a transport with mailboxes for `recipients`
    pub fn new(recipients: &[PartyId]) -> Self {
        let (notify, _) = broadcast::channel(100);
        let mailboxes = Arc::new(DashMap::new());
        for &id in recipients {
            mailboxes.insert(id, Vec::new());
        }
        Self { mailboxes, notify }
    }

    /// Add a mailbox for a late-joining recipient
    pub fn register(&self, party_id: PartyId) {
        self.mailboxes.entry(party_id).or_default();
    }

    fn push(&self, to: PartyId, bytes: Vec<u8>) -> Result<()> {
        let mut mailbox = self
            .mailboxes
            .get_mut(&to)
            .ok_or(Error::UnknownParty(to))?;
        mailbox.push(bytes);
        Ok(())
    }
}

fn serialize(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

#[async_trait]
impl Delivery for MemoryDelivery {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let bytes = serialize(&envelope)?;

        match envelope.to {
            Some(to) => self.push(to, bytes)?,
            None => {
                for mut entry in self.mailboxes.iter_mut() {
                    if *entry.key() == envelope.from {
                        continue;
                    }
                    entry.value_mut().push(bytes.clone());
                }
            }
        }

        let _ = self.notify.send(());
        Ok(())
    }

    async fn collect(&self, my_id: PartyId, count: usize) -> Result<Vec<Envelope>> {
        let mut rx = self.notify.subscribe();

        loop {
            {
                let mut mailbox = self
                    .mailboxes
                    .get_mut(&my_id)
                    .ok_or(Error::UnknownParty(my_id))?;
                if mailbox.len() >= count {
                    let drained: Vec<Vec<u8>> = mailbox.drain(..).collect();
                    drop(mailbox);
                    return drained.iter().map(|bytes| deserialize(bytes)).collect();
                }
            }

            // Wait for notification with timeout
            tokio::select! {
                _ = rx.recv() => continue,
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => continue,
            }
        }
    }
}
