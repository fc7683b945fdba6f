//! The cipher-box mailbox: an addressable, bidirectional message pipe
//! between two parties, keyed by a 64-byte stream id derived from the
//! ticket under negotiation.
//!
//! Delivery is at-least-once and unordered across restarts; messages are
//! authenticated but may be duplicated. The negotiator is responsible for
//! idempotence.

use crate::{sidecar::Ticket, traits::KeyDescriptor, Error, Result};
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use std::fmt;

/// A 64-byte mailbox address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; 64]);

impl StreamId {
    /// The provider listens here: the raw signature bytes of the offer
    /// digest signature. Only parties holding the ticket can derive it.
    pub fn for_provider(ticket: &Ticket) -> StreamId {
        StreamId(ticket.offer.sig_offer_digest.to_bytes())
    }

    /// The recipient listens here: the x-only bytes of its node key
    /// followed by the x-only bytes of its multisig key.
    pub fn for_recipient(ticket: &Ticket) -> Result<StreamId> {
        let recipient = ticket.recipient.as_ref().ok_or_else(|| {
            Error::Protocol(format!(
                "ticket {} has no recipient to derive a stream id from",
                ticket.id
            ))
        })?;

        let mut id = [0u8; 64];
        id[..32].copy_from_slice(&recipient.node_pubkey.to_bytes()[1..33]);
        id[32..].copy_from_slice(&recipient.multisig_pubkey.to_bytes()[1..33]);

        Ok(StreamId(id))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// The mailbox transport. One logical message channel exists per stream id;
/// different streams are independent.
#[async_trait]
pub trait Mailbox {
    /// Open the stream for a ticket, proving possession of the ticket.
    /// Idempotent: an already existing stream is not an error.
    async fn init_ticket_box(&self, stream: StreamId, ticket: &Ticket) -> AnyResult<()>;

    /// Open the stream for an account holder, proving possession of the
    /// account key. Idempotent like [`Mailbox::init_ticket_box`].
    async fn init_account_box(&self, stream: StreamId, account_key: &KeyDescriptor)
        -> AnyResult<()>;

    /// Enqueue one message. Non-blocking until the per-stream buffer bound
    /// is reached.
    async fn send(&self, stream: StreamId, message: Vec<u8>) -> AnyResult<()>;

    /// Block until one message is available.
    async fn recv(&self, stream: StreamId) -> AnyResult<Vec<u8>>;

    async fn delete_ticket_box(&self, stream: StreamId, ticket: &Ticket) -> AnyResult<()>;

    async fn delete_account_box(
        &self,
        stream: StreamId,
        account_key: &KeyDescriptor,
    ) -> AnyResult<()>;
}
