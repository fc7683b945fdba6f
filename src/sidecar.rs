//! Sidecar tickets: a transferable, signed commitment that lets a third
//! party place a bid whose resulting channel opens at the ticket
//! recipient's node.

pub mod negotiator;

use crate::{traits::KeyDescriptor, Error, Result};
use bitcoin::Amount;
use ecdsa_fun::{
    fun::{Point, Scalar},
    nonce::Deterministic,
    Signature, ECDSA,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// Version byte of the ticket wire encoding.
pub const TICKET_VERSION: u8 = 1;

/// Prefix of the human-readable ticket interchange string.
const TICKET_PREFIX: &str = "sidecar";

const OFFER_TAG: &[u8] = b"njord/sidecar/offer";
const ORDER_TAG: &[u8] = b"njord/sidecar/order";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketId([u8; 8]);

impl TicketId {
    pub fn new_random() -> Self {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);

        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TicketId({})", self)
    }
}

/// Negotiation progress of a ticket. The discriminants are part of the wire
/// format and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketState {
    Created = 0,
    Offered = 1,
    Registered = 2,
    Ordered = 3,
    ExpectingChannel = 4,
    Completed = 5,
}

impl TicketState {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        let state = match value {
            0 => TicketState::Created,
            1 => TicketState::Offered,
            2 => TicketState::Registered,
            3 => TicketState::Ordered,
            4 => TicketState::ExpectingChannel,
            5 => TicketState::Completed,
            other => {
                return Err(Error::Protocol(format!(
                    "unknown ticket state byte {}",
                    other
                )))
            }
        };

        Ok(state)
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TicketState::Created => "created",
            TicketState::Offered => "offered",
            TicketState::Registered => "registered",
            TicketState::Ordered => "ordered",
            TicketState::ExpectingChannel => "expecting channel",
            TicketState::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// The provider's signed commitment to lease a channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Offer {
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub capacity: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub push_amount: Amount,
    pub lease_duration: u32,
    /// Whether the ticket is negotiated automatically over the mailbox.
    pub auto: bool,
    pub sign_pubkey: Point,
    pub sig_offer_digest: Signature,
}

/// Where the leased channel must open. Set at registration, immutable
/// afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recipient {
    pub node_pubkey: Point,
    pub multisig_pubkey: Point,
    pub multisig_key_index: u32,
}

/// The bid binding, set exactly once when the provider submits the order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub bid_nonce: [u8; 32],
    pub sig_order_digest: Signature,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub state: TicketState,
    pub offer: Offer,
    pub recipient: Option<Recipient>,
    pub order: Option<Order>,
}

/// The bid template a provider prepares alongside an offer. The order
/// signature is pre-computed here so that negotiation can finalize the
/// ticket without access to the provider's signing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bid {
    pub nonce: [u8; 32],
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub capacity: Amount,
    pub lease_duration: u32,
    pub sig_order_digest: Signature,
}

/// The key a provider signs its offers with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SidecarSignKey {
    secret_key: Scalar,
    public_key: Point,
}

impl SidecarSignKey {
    pub fn new_random() -> Self {
        let secret_key = Scalar::random(&mut rand::thread_rng());
        let public_key = public_key(&secret_key);

        Self {
            secret_key,
            public_key,
        }
    }

    pub fn public(&self) -> Point {
        self.public_key.clone()
    }

    pub fn sign(&self, digest: [u8; 32]) -> Signature {
        let ecdsa = ECDSA::<Deterministic<Sha256>>::default();

        ecdsa.sign(&self.secret_key, &digest)
    }
}

impl From<Scalar> for SidecarSignKey {
    fn from(secret_key: Scalar) -> Self {
        let public_key = public_key(&secret_key);

        Self {
            secret_key,
            public_key,
        }
    }
}

fn public_key(secret_key: &Scalar) -> Point {
    let ecdsa = ECDSA::<()>::default();

    ecdsa.verification_key_for(secret_key)
}

/// Mint a fresh, signed ticket in state `Offered`.
pub fn offer_ticket(
    capacity: Amount,
    push_amount: Amount,
    lease_duration: u32,
    auto: bool,
    key: &SidecarSignKey,
) -> Ticket {
    let id = TicketId::new_random();
    let digest = offer_digest(&id, capacity, push_amount, lease_duration, &key.public());

    Ticket {
        id,
        state: TicketState::Offered,
        offer: Offer {
            capacity,
            push_amount,
            lease_duration,
            auto,
            sign_pubkey: key.public(),
            sig_offer_digest: key.sign(digest),
        },
        recipient: None,
        order: None,
    }
}

/// Prepare the bid template for an offered ticket: a fresh nonce and the
/// matching order signature.
pub fn bid_template(ticket: &Ticket, key: &SidecarSignKey) -> Bid {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);

    let digest = order_digest(&ticket.id, &nonce);

    Bid {
        nonce,
        capacity: ticket.offer.capacity,
        lease_duration: ticket.offer.lease_duration,
        sig_order_digest: key.sign(digest),
    }
}

/// Receiver-side registration: fill in the recipient block and move the
/// ticket to `Registered`.
pub fn register_ticket(
    mut ticket: Ticket,
    node_pubkey: Point,
    multisig_key: &KeyDescriptor,
) -> Result<Ticket> {
    verify_offer(&ticket)?;

    if ticket.state != TicketState::Offered {
        return Err(Error::Protocol(format!(
            "cannot register ticket in state `{}`",
            ticket.state
        )));
    }

    let multisig_pubkey = Point::from_bytes(multisig_key.pubkey.serialize())
        .ok_or_else(|| Error::Fatal("wallet returned an invalid multisig key".to_string()))?;

    ticket.recipient = Some(Recipient {
        node_pubkey,
        multisig_pubkey,
        multisig_key_index: multisig_key.locator.index,
    });
    ticket.state = TicketState::Registered;

    Ok(ticket)
}

impl Ticket {
    /// The 41-byte storage key: `id || sign_pubkey`.
    pub fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(41);
        key.extend_from_slice(self.id.as_bytes());
        key.extend_from_slice(&self.offer.sign_pubkey.to_bytes());

        key
    }

    /// The fixed-layout wire encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(256);

        body.extend_from_slice(self.id.as_bytes());
        body.push(self.state.to_u8());

        body.extend_from_slice(&self.offer.capacity.as_sat().to_be_bytes());
        body.extend_from_slice(&self.offer.push_amount.as_sat().to_be_bytes());
        body.extend_from_slice(&self.offer.lease_duration.to_be_bytes());
        body.push(self.offer.auto as u8);
        body.extend_from_slice(&self.offer.sign_pubkey.to_bytes());
        body.extend_from_slice(&self.offer.sig_offer_digest.to_bytes());

        match &self.recipient {
            Some(recipient) => {
                body.push(1);
                body.extend_from_slice(&recipient.node_pubkey.to_bytes());
                body.extend_from_slice(&recipient.multisig_pubkey.to_bytes());
                body.extend_from_slice(&recipient.multisig_key_index.to_be_bytes());
            }
            None => body.push(0),
        }

        match &self.order {
            Some(order) => {
                body.push(1);
                body.extend_from_slice(&order.bid_nonce);
                body.extend_from_slice(&order.sig_order_digest.to_bytes());
            }
            None => body.push(0),
        }

        let mut encoded = Vec::with_capacity(3 + body.len());
        encoded.push(TICKET_VERSION);
        #[allow(clippy::cast_possible_truncation)]
        encoded.extend_from_slice(&(body.len() as u16).to_be_bytes());
        encoded.extend_from_slice(&body);

        encoded
    }

    /// Parse the wire encoding.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader(bytes);

        let version = reader.u8()?;
        if version != TICKET_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported ticket version {}",
                version
            )));
        }

        let len = reader.u16()? as usize;
        if reader.0.len() != len {
            return Err(Error::Protocol("ticket length mismatch".to_string()));
        }

        let id = TicketId::from_bytes(reader.array::<8>()?);
        let state = TicketState::from_u8(reader.u8()?)?;

        let capacity = Amount::from_sat(reader.u64()?);
        let push_amount = Amount::from_sat(reader.u64()?);
        let lease_duration = reader.u32()?;
        let auto = match reader.u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(Error::Protocol(format!(
                    "invalid auto flag byte {}",
                    other
                )))
            }
        };
        let sign_pubkey = reader.point()?;
        let sig_offer_digest = reader.signature()?;

        let recipient = match reader.u8()? {
            0 => None,
            1 => Some(Recipient {
                node_pubkey: reader.point()?,
                multisig_pubkey: reader.point()?,
                multisig_key_index: reader.u32()?,
            }),
            other => {
                return Err(Error::Protocol(format!(
                    "invalid recipient marker byte {}",
                    other
                )))
            }
        };

        let order = match reader.u8()? {
            0 => None,
            1 => Some(Order {
                bid_nonce: reader.array::<32>()?,
                sig_order_digest: reader.signature()?,
            }),
            other => {
                return Err(Error::Protocol(format!(
                    "invalid order marker byte {}",
                    other
                )))
            }
        };

        if !reader.0.is_empty() {
            return Err(Error::Protocol("trailing ticket bytes".to_string()));
        }

        Ok(Ticket {
            id,
            state,
            offer: Offer {
                capacity,
                push_amount,
                lease_duration,
                auto,
                sign_pubkey,
                sig_offer_digest,
            },
            recipient,
            order,
        })
    }
}

impl fmt::Display for Ticket {
    /// The human-readable interchange form: a `sidecar` prefix over the hex
    /// of the wire encoding with a 4-byte double-SHA256 checksum.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = self.serialize();
        let checksum = double_sha256(&payload);
        payload.extend_from_slice(&checksum[..4]);

        write!(f, "{}{}", TICKET_PREFIX, hex::encode(payload))
    }
}

impl FromStr for Ticket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let encoded = s
            .strip_prefix(TICKET_PREFIX)
            .ok_or_else(|| Error::Protocol("missing sidecar ticket prefix".to_string()))?;

        let payload = hex::decode(encoded)
            .map_err(|_| Error::Protocol("sidecar ticket is not valid hex".to_string()))?;

        if payload.len() < 4 {
            return Err(Error::Protocol("sidecar ticket too short".to_string()));
        }

        let (body, checksum) = payload.split_at(payload.len() - 4);
        if double_sha256(body)[..4] != *checksum {
            return Err(Error::Protocol("sidecar ticket checksum mismatch".to_string()));
        }

        Ticket::deserialize(body)
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(Error::Protocol("truncated ticket".to_string()));
        }

        let (head, tail) = self.0.split_at(n);
        self.0 = tail;

        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);

        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array::<8>()?))
    }

    fn point(&mut self) -> Result<Point> {
        Point::from_bytes(self.array::<33>()?)
            .ok_or_else(|| Error::Protocol("invalid curve point in ticket".to_string()))
    }

    fn signature(&mut self) -> Result<Signature> {
        Signature::from_bytes(self.array::<64>()?)
            .ok_or_else(|| Error::Protocol("invalid signature in ticket".to_string()))
    }
}

fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);

    Sha256::digest(&first).into()
}

fn tagged_hash(tag: &[u8], payload: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag);

    let mut hasher = Sha256::new();
    hasher.update(&tag_hash);
    hasher.update(&tag_hash);
    hasher.update(payload);

    hasher.finalize().into()
}

/// The domain-separated hash the provider signs when making an offer.
pub fn offer_digest(
    id: &TicketId,
    capacity: Amount,
    push_amount: Amount,
    lease_duration: u32,
    sign_pubkey: &Point,
) -> [u8; 32] {
    let mut payload = Vec::with_capacity(8 + 8 + 8 + 4 + 33);
    payload.extend_from_slice(id.as_bytes());
    payload.extend_from_slice(&capacity.as_sat().to_be_bytes());
    payload.extend_from_slice(&push_amount.as_sat().to_be_bytes());
    payload.extend_from_slice(&lease_duration.to_be_bytes());
    payload.extend_from_slice(&sign_pubkey.to_bytes());

    tagged_hash(OFFER_TAG, &payload)
}

/// The domain-separated hash binding a ticket to a bid nonce.
pub fn order_digest(id: &TicketId, bid_nonce: &[u8; 32]) -> [u8; 32] {
    let mut payload = Vec::with_capacity(8 + 32);
    payload.extend_from_slice(id.as_bytes());
    payload.extend_from_slice(&bid_nonce[..]);

    tagged_hash(ORDER_TAG, &payload)
}

/// Check that the offer signature is a valid signature by
/// `offer.sign_pubkey` over the offer digest.
pub fn verify_offer(ticket: &Ticket) -> Result<()> {
    let digest = offer_digest(
        &ticket.id,
        ticket.offer.capacity,
        ticket.offer.push_amount,
        ticket.offer.lease_duration,
        &ticket.offer.sign_pubkey,
    );

    let ecdsa = ECDSA::verify_only();
    if !ecdsa.verify(
        &ticket.offer.sign_pubkey,
        &digest,
        &ticket.offer.sig_offer_digest,
    ) {
        return Err(Error::Protocol(format!(
            "invalid offer signature on ticket {}",
            ticket.id
        )));
    }

    Ok(())
}

/// Check the order signature. Only required once a ticket has reached
/// `Ordered`; earlier states vacuously pass.
pub fn verify_order(ticket: &Ticket) -> Result<()> {
    if ticket.state < TicketState::Ordered {
        return Ok(());
    }

    let order = ticket.order.as_ref().ok_or_else(|| {
        Error::Protocol(format!("ticket {} is ordered but has no order", ticket.id))
    })?;

    let digest = order_digest(&ticket.id, &order.bid_nonce);

    let ecdsa = ECDSA::verify_only();
    if !ecdsa.verify(
        &ticket.offer.sign_pubkey,
        &digest,
        &order.sig_order_digest,
    ) {
        return Err(Error::Protocol(format!(
            "invalid order signature on ticket {}",
            ticket.id
        )));
    }

    Ok(())
}
