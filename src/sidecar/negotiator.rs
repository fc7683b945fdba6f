//! The two-party sidecar negotiation state machines.
//!
//! Each negotiator owns two cooperative tasks: a reader that blocks on the
//! mailbox and forwards decoded tickets, and a driver that applies the FSM
//! step. The driver holds exclusive access to the mutable ticket; every
//! checkpoint lands in the store before any outgoing send, so a crash at any
//! point is recovered by one round of retransmission.
//!
//! Malformed or unexpected peer input is logged and dropped (the sender will
//! retransmit); only store corruption aborts a negotiation.

use crate::{
    mailbox::{Mailbox, StreamId},
    sidecar::{verify_offer, verify_order, Order, Ticket, TicketState},
    store::Store,
    traits::{Auctioneer, FundingManager, KeyDescriptor, OrderAlreadySubmitted},
    Error, Result, Shutdown,
};
use futures::{
    channel::mpsc,
    future::{self, Either},
    pin_mut, SinkExt, StreamExt,
};
use std::{fmt, sync::Arc};

/// What the provider FSM does with a packet, as a pure function of the
/// packet's current state, the provider's durable ticket state and the
/// incoming ticket state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProviderOp {
    /// Retransmit the offer to request the receiver's durable state.
    ResendOffer,
    /// Re-enter the machine at the durable checkpoint after a restart.
    Adopt(TicketState),
    /// Checkpoint the receiver's registered ticket.
    Checkpoint,
    /// Submit the sidecar bid bound to the ticket.
    SubmitBid,
    /// Send the finalized ticket and move to `ExpectingChannel`.
    Finalize,
    /// A settled machine with nothing to answer.
    Stay,
    /// The combination is not part of the protocol.
    Reject,
}

fn provider_step(
    current: TicketState,
    ours: TicketState,
    incoming: Option<TicketState>,
) -> ProviderOp {
    use TicketState::*;

    match current {
        Created if ours == Offered => ProviderOp::ResendOffer,
        Created if ours > Offered => ProviderOp::Adopt(ours),
        Offered if incoming == Some(Registered) => ProviderOp::Checkpoint,
        Registered => ProviderOp::SubmitBid,
        Ordered => ProviderOp::Finalize,
        ExpectingChannel if incoming == Some(Registered) => ProviderOp::Finalize,
        // A converged receiver answers duplicate retransmission requests by
        // echoing its durable `ExpectingChannel` ticket; absorb the echo
        // like the receiver absorbs duplicate finalized tickets.
        ExpectingChannel if incoming == Some(ExpectingChannel) => ProviderOp::Stay,
        ExpectingChannel if incoming.is_none() => ProviderOp::Stay,
        Completed => ProviderOp::Stay,
        _ => ProviderOp::Reject,
    }
}

/// What the receiver FSM does with an incoming ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReceiverOp {
    /// Answer with our durable ticket on the provider stream.
    ResendRegistered,
    /// Validate the finalized ticket, checkpoint it and arm the funding
    /// shim.
    Complete,
    /// A buffered or duplicate message.
    Ignore,
}

fn receiver_step(current: TicketState, incoming: TicketState) -> ReceiverOp {
    use TicketState::*;

    match (current, incoming) {
        // An incoming offer is a provider-restart request, answered with
        // whatever durable state we have.
        (_, Offered) => ReceiverOp::ResendRegistered,
        (Registered, Registered) => ReceiverOp::ResendRegistered,
        (Registered, Ordered) | (Registered, ExpectingChannel) => ReceiverOp::Complete,
        _ => ReceiverOp::Ignore,
    }
}

fn same_ticket(a: &Ticket, b: &Ticket) -> bool {
    a.id == b.id && a.offer.sign_pubkey == b.offer.sign_pubkey
}

/// Forward every well-formed ticket arriving on `stream` to the driver.
/// Malformed messages are dropped; a transport failure ends the loop, which
/// in turn ends the negotiation run.
async fn read_stream<M>(mailbox: &M, stream: StreamId, mut out: mpsc::Sender<Ticket>)
where
    M: Mailbox + Sync,
{
    loop {
        let bytes = match mailbox.recv(stream).await {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("mailbox receive on {} failed: {:#}", stream, err);
                return;
            }
        };

        match Ticket::deserialize(&bytes) {
            Ok(ticket) => {
                if out.send(ticket).await.is_err() {
                    return;
                }
            }
            Err(err) => log::warn!("dropping malformed message on {}: {}", stream, err),
        }
    }
}

/// The provider half of a negotiation: offers a ticket, checkpoints the
/// receiver's registration, submits the bid and hands the finalized ticket
/// back to the receiver.
pub struct ProviderNegotiator<M, A> {
    mailbox: M,
    auctioneer: A,
    store: Arc<Store>,
    account_key: KeyDescriptor,
}

impl<M, A> fmt::Debug for ProviderNegotiator<M, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderNegotiator")
    }
}

impl<M, A> ProviderNegotiator<M, A>
where
    M: Mailbox + Sync,
    A: Auctioneer + Sync,
{
    pub fn new(mailbox: M, auctioneer: A, store: Arc<Store>, account_key: KeyDescriptor) -> Self {
        Self {
            mailbox,
            auctioneer,
            store,
            account_key,
        }
    }

    /// Negotiate `ticket` until shutdown. On a fresh start the machine
    /// begins in `Offered` and waits for the receiver; on a restart it
    /// begins in `Created`, which triggers exactly one round of
    /// retransmission against the durable checkpoint.
    pub async fn run(&self, ticket: Ticket, on_restart: bool, shutdown: Shutdown) -> Result<()> {
        let provider_stream = StreamId::for_provider(&ticket);

        self.mailbox
            .init_account_box(provider_stream, &self.account_key)
            .await
            .map_err(Error::transient)?;

        let (out, mut packets) = mpsc::channel(8);
        let reader = read_stream(&self.mailbox, provider_stream, out);

        let driver = async {
            let mut current = if on_restart {
                TicketState::Created
            } else {
                TicketState::Offered
            };

            if current == TicketState::Created {
                if let Err(err) = self.drive(&ticket, &mut current, None, provider_stream).await {
                    match err {
                        Error::Protocol(err) => log::warn!("sidecar restart step failed: {}", err),
                        err => return Err(err),
                    }
                }
            }

            loop {
                let incoming = match packets.next().await {
                    Some(incoming) => incoming,
                    None => return Ok(()),
                };

                if !same_ticket(&incoming, &ticket) {
                    log::warn!(
                        "dropping ticket {} received on stream of ticket {}",
                        incoming.id,
                        ticket.id
                    );
                    continue;
                }

                match self
                    .drive(&ticket, &mut current, Some(incoming), provider_stream)
                    .await
                {
                    Ok(()) => {}
                    Err(Error::Protocol(err)) => {
                        log::warn!("sidecar negotiation step failed: {}", err)
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let negotiation = async {
            let (_, result) = future::join(reader, driver).await;
            result
        };
        pin_mut!(negotiation);
        let shutdown = shutdown;
        pin_mut!(shutdown);

        match future::select(negotiation, shutdown).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => Ok(()),
        }
    }

    /// Apply provider steps until the state reaches a fixed point that
    /// requires new input, checkpointing before every send.
    async fn drive(
        &self,
        ticket: &Ticket,
        current: &mut TicketState,
        incoming: Option<Ticket>,
        provider_stream: StreamId,
    ) -> Result<()> {
        let mut ours = self.store.sidecar(&ticket.id, &ticket.offer.sign_pubkey)?;

        loop {
            let op = provider_step(*current, ours.state, incoming.as_ref().map(|t| t.state));

            match op {
                ProviderOp::ResendOffer => {
                    let mut offered = ours.clone();
                    offered.state = TicketState::Offered;

                    // Before a registration ever reached us the recipient
                    // stream cannot be derived; the retransmission request
                    // then goes out on our own bidirectional stream, where
                    // the receiver listens for exactly this case.
                    let target = StreamId::for_recipient(&ours)
                        .unwrap_or(provider_stream);

                    self.send(target, &offered).await?;
                    *current = TicketState::Offered;

                    return Ok(());
                }
                ProviderOp::Adopt(state) => {
                    *current = state;
                }
                ProviderOp::Checkpoint => {
                    let incoming = incoming
                        .as_ref()
                        .expect("checkpoint op only fires on an incoming ticket");

                    verify_offer(incoming)?;
                    if incoming.recipient.is_none() {
                        return Err(Error::Protocol(format!(
                            "registered ticket {} has no recipient",
                            incoming.id
                        )));
                    }

                    let mut registered = incoming.clone();
                    registered.state = TicketState::Registered;
                    self.store.update_sidecar(&registered).await?;

                    log::info!("sidecar ticket {} registered", registered.id);

                    ours = registered;
                    *current = TicketState::Registered;
                }
                ProviderOp::SubmitBid => {
                    let bid = self.store.sidecar_bid_template(&ours)?;

                    match self.auctioneer.submit_order(&bid, &ours).await {
                        Ok(()) => {}
                        // A bid from before a crash already made it in.
                        Err(err) if err.downcast_ref::<OrderAlreadySubmitted>().is_some() => {}
                        Err(err) => return Err(Error::transient(err)),
                    }

                    let mut ordered = ours.clone();
                    ordered.order = Some(Order {
                        bid_nonce: bid.nonce,
                        sig_order_digest: bid.sig_order_digest,
                    });
                    ordered.state = TicketState::Ordered;
                    self.store.update_sidecar(&ordered).await?;

                    log::info!("sidecar bid for ticket {} submitted", ordered.id);

                    ours = ordered;
                    *current = TicketState::Ordered;
                }
                ProviderOp::Finalize => {
                    let mut finalized = ours.clone();
                    finalized.state = TicketState::ExpectingChannel;
                    self.store.update_sidecar(&finalized).await?;

                    let stream = StreamId::for_recipient(&finalized)?;
                    self.send(stream, &finalized).await?;

                    log::info!("sidecar ticket {} finalized", finalized.id);

                    ours = finalized;
                    *current = TicketState::ExpectingChannel;

                    return Ok(());
                }
                ProviderOp::Stay => return Ok(()),
                ProviderOp::Reject => {
                    return Err(Error::Protocol(format!(
                        "no provider transition from state `{}` with durable state `{}` \
                         and incoming state {:?}",
                        current,
                        ours.state,
                        incoming.map(|t| t.state),
                    )));
                }
            }
        }
    }

    async fn send(&self, stream: StreamId, ticket: &Ticket) -> Result<()> {
        self.mailbox
            .send(stream, ticket.serialize())
            .await
            .map_err(Error::transient)
    }
}

/// The receiver half of a negotiation: announces its registration, waits
/// for the finalized ticket and arms the channel-funding shim.
pub struct ReceiverNegotiator<M, F> {
    mailbox: M,
    funding: F,
    store: Arc<Store>,
}

impl<M, F> fmt::Debug for ReceiverNegotiator<M, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReceiverNegotiator")
    }
}

impl<M, F> ReceiverNegotiator<M, F>
where
    M: Mailbox + Sync,
    F: FundingManager + Sync,
{
    pub fn new(mailbox: M, funding: F, store: Arc<Store>) -> Self {
        Self {
            mailbox,
            funding,
            store,
        }
    }

    /// Negotiate the registered `ticket` until shutdown. Always restarts
    /// from the durable state; duplicates and reordered messages are
    /// absorbed by the step function.
    pub async fn run(&self, ticket: Ticket, shutdown: Shutdown) -> Result<()> {
        let recipient_stream = StreamId::for_recipient(&ticket)?;
        let provider_stream = StreamId::for_provider(&ticket);

        self.mailbox
            .init_ticket_box(recipient_stream, &ticket)
            .await
            .map_err(Error::transient)?;

        let ours = self.store.sidecar(&ticket.id, &ticket.offer.sign_pubkey)?;

        // After a restart past the finish line the only thing left to redo
        // is arming the funding shim.
        if ours.state == TicketState::ExpectingChannel {
            self.funding
                .expect_channel(&ours)
                .await
                .map_err(Error::transient)?;
        }

        // Seed the packet loop with the initial provider ticket; the first
        // step announces our registration.
        let mut seed = ours.clone();
        seed.state = TicketState::Offered;

        let (out, mut packets) = mpsc::channel(8);
        let reader = async {
            let recipient = read_stream(&self.mailbox, recipient_stream, out.clone());
            let provider = read_stream(&self.mailbox, provider_stream, out);

            future::join(recipient, provider).await;
        };

        let driver = async {
            if let Err(err) = self.drive(&ticket, seed, provider_stream).await {
                match err {
                    Error::Protocol(err) => log::warn!("sidecar seed step failed: {}", err),
                    err => return Err(err),
                }
            }

            loop {
                let incoming = match packets.next().await {
                    Some(incoming) => incoming,
                    None => return Ok(()),
                };

                if !same_ticket(&incoming, &ticket) {
                    log::warn!(
                        "dropping ticket {} received on stream of ticket {}",
                        incoming.id,
                        ticket.id
                    );
                    continue;
                }

                match self.drive(&ticket, incoming, provider_stream).await {
                    Ok(()) => {}
                    Err(Error::Protocol(err)) => {
                        log::warn!("sidecar negotiation step failed: {}", err)
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let negotiation = async {
            let (_, result) = future::join(reader, driver).await;
            result
        };
        pin_mut!(negotiation);
        let shutdown = shutdown;
        pin_mut!(shutdown);

        match future::select(negotiation, shutdown).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => Ok(()),
        }
    }

    async fn drive(
        &self,
        ticket: &Ticket,
        incoming: Ticket,
        provider_stream: StreamId,
    ) -> Result<()> {
        // The ticket must exist locally; its durable state is the FSM state.
        let ours = self.store.sidecar(&ticket.id, &ticket.offer.sign_pubkey)?;

        match receiver_step(ours.state, incoming.state) {
            ReceiverOp::ResendRegistered => {
                self.mailbox
                    .send(provider_stream, ours.serialize())
                    .await
                    .map_err(Error::transient)?;

                Ok(())
            }
            ReceiverOp::Complete => {
                verify_offer(&incoming)?;
                verify_order(&incoming)?;

                if !recipient_unchanged(&ours, &incoming) {
                    return Err(Error::Protocol(format!(
                        "finalized ticket {} mutated the recipient",
                        incoming.id
                    )));
                }

                let order = incoming.order.clone().ok_or_else(|| {
                    Error::Protocol(format!("finalized ticket {} has no order", incoming.id))
                })?;

                let mut updated = ours;
                updated.order = Some(order);
                updated.state = TicketState::ExpectingChannel;
                self.store.update_sidecar(&updated).await?;

                self.funding
                    .expect_channel(&updated)
                    .await
                    .map_err(Error::transient)?;

                log::info!("sidecar ticket {} now expecting its channel", updated.id);

                Ok(())
            }
            ReceiverOp::Ignore => Ok(()),
        }
    }
}

fn recipient_unchanged(ours: &Ticket, incoming: &Ticket) -> bool {
    match (&ours.recipient, &incoming.recipient) {
        (Some(a), Some(b)) => {
            a.node_pubkey == b.node_pubkey
                && a.multisig_pubkey == b.multisig_pubkey
                && a.multisig_key_index == b.multisig_key_index
        }
        _ => false,
    }
}
