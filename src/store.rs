//! Durable keyed storage for accounts and sidecar tickets.
//!
//! Two typed namespaces share one sled database: accounts keyed by the
//! compressed trader public key, and sidecar tickets keyed by
//! `id || sign_pubkey`, with a sub-namespace mapping the ticket key to its
//! bid nonce and a parallel bid record keyed by nonce. Every successful
//! update is flushed before returning, and multi-record writes go through a
//! single transaction so a partial batch can never be observed.

use crate::{
    account::{Account, AccountState},
    sidecar::{Bid, Ticket, TicketId},
    Error, Result,
};
use anyhow::Context;
use bitcoin::{OutPoint, Transaction};
use ecdsa_fun::fun::Point;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use std::{fmt, path::Path};

const ACCOUNTS_TREE: &[u8] = b"accounts";
const SIDECARS_TREE: &[u8] = b"sidecars";

/// Sub-namespace prefixes within the sidecar tree.
const TICKET_PREFIX: &[u8] = b"t/";
const NONCE_PREFIX: &[u8] = b"n/";
const BID_PREFIX: &[u8] = b"b/";

/// A single change to an account record. Updates apply an ordered list of
/// modifiers atomically.
#[derive(Clone, Debug)]
pub enum AccountModifier {
    State(AccountState),
    OutPoint(OutPoint),
    CloseTx(Transaction),
    BatchKey(bitcoin::secp256k1::PublicKey),
    HeightHint(u32),
}

impl AccountModifier {
    fn apply(&self, account: &mut Account) {
        match self {
            AccountModifier::State(state) => account.state = *state,
            AccountModifier::OutPoint(outpoint) => account.outpoint = Some(*outpoint),
            AccountModifier::CloseTx(tx) => account.close_tx = Some(tx.clone()),
            AccountModifier::BatchKey(key) => account.batch_key = *key,
            AccountModifier::HeightHint(height) => account.height_hint = *height,
        }
    }
}

pub struct Store {
    db: sled::Db,
    accounts: sled::Tree,
    sidecars: sled::Tree,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Store")
    }
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(storage_error)?;

        Self::from_db(db)
    }

    /// A throwaway store whose files are removed on drop.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_error)?;

        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let accounts = db.open_tree(ACCOUNTS_TREE).map_err(storage_error)?;
        let sidecars = db.open_tree(SIDECARS_TREE).map_err(storage_error)?;

        Ok(Self {
            db,
            accounts,
            sidecars,
        })
    }

    /// Insert a new account; fails if the trader key is already present.
    pub async fn add_account(&self, account: &Account) -> Result<()> {
        let key = account.key();
        let value = serialize(account)?;

        self.accounts
            .compare_and_swap(&key[..], Option::<&[u8]>::None, Some(value))
            .map_err(storage_error)?
            .map_err(|_| {
                Error::invalid_parameters(format!(
                    "account {} already exists",
                    hex::encode(&key[..])
                ))
            })?;

        self.flush().await
    }

    /// Apply the modifiers to `account` in order, persist the result, and
    /// flush. The caller's copy reflects the stored record on return.
    pub async fn update_account(
        &self,
        account: &mut Account,
        modifiers: &[AccountModifier],
    ) -> Result<()> {
        let mut updated = account.clone();
        for modifier in modifiers {
            modifier.apply(&mut updated);
        }

        let key = updated.key();
        if self.accounts.get(&key[..]).map_err(storage_error)?.is_none() {
            return Err(Error::NotFound("account"));
        }

        self.accounts
            .insert(&key[..], serialize(&updated)?)
            .map_err(storage_error)?;
        self.flush().await?;

        *account = updated;

        Ok(())
    }

    pub fn account(&self, trader_key: &[u8; 33]) -> Result<Account> {
        let raw = self
            .accounts
            .get(&trader_key[..])
            .map_err(storage_error)?
            .ok_or(Error::NotFound("account"))?;

        deserialize(&raw)
    }

    /// All stored accounts, in unspecified order.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.accounts
            .iter()
            .map(|item| {
                let (_, value) = item.map_err(storage_error)?;
                deserialize(&value)
            })
            .collect()
    }

    /// Insert a new sidecar ticket.
    pub async fn add_sidecar(&self, ticket: &Ticket) -> Result<()> {
        let key = prefixed(TICKET_PREFIX, &ticket.storage_key());
        let value = serialize(ticket)?;

        self.sidecars
            .compare_and_swap(key, Option::<&[u8]>::None, Some(value))
            .map_err(storage_error)?
            .map_err(|_| {
                Error::invalid_parameters(format!("ticket {} already exists", ticket.id))
            })?;

        self.flush().await
    }

    /// Insert a new ticket together with its bid template, atomically.
    pub async fn add_sidecar_with_bid(&self, ticket: &Ticket, bid: &Bid) -> Result<()> {
        let ticket_key = prefixed(TICKET_PREFIX, &ticket.storage_key());
        let nonce_key = prefixed(NONCE_PREFIX, &ticket.storage_key());
        let bid_key = prefixed(BID_PREFIX, &bid.nonce[..]);

        let ticket_value = serialize(ticket)?;
        let bid_value = serialize(bid)?;

        if self
            .sidecars
            .get(&ticket_key)
            .map_err(storage_error)?
            .is_some()
        {
            return Err(Error::invalid_parameters(format!(
                "ticket {} already exists",
                ticket.id
            )));
        }

        self.sidecars
            .transaction(|tree| -> ConflictableTransactionResult<(), sled::Error> {
                tree.insert(ticket_key.as_slice(), ticket_value.clone())?;
                tree.insert(nonce_key.as_slice(), bid.nonce.to_vec())?;
                tree.insert(bid_key.as_slice(), bid_value.clone())?;

                Ok(())
            })
            .map_err(transaction_error)?;

        self.flush().await
    }

    /// Overwrite an existing ticket checkpoint.
    pub async fn update_sidecar(&self, ticket: &Ticket) -> Result<()> {
        let key = prefixed(TICKET_PREFIX, &ticket.storage_key());

        if self.sidecars.get(&key).map_err(storage_error)?.is_none() {
            return Err(Error::NotFound("sidecar ticket"));
        }

        self.sidecars
            .insert(key, serialize(ticket)?)
            .map_err(storage_error)?;

        self.flush().await
    }

    pub fn sidecar(&self, id: &TicketId, sign_pubkey: &Point) -> Result<Ticket> {
        let mut storage_key = Vec::with_capacity(41);
        storage_key.extend_from_slice(id.as_bytes());
        storage_key.extend_from_slice(&sign_pubkey.to_bytes());

        let raw = self
            .sidecars
            .get(prefixed(TICKET_PREFIX, &storage_key))
            .map_err(storage_error)?
            .ok_or(Error::NotFound("sidecar ticket"))?;

        deserialize(&raw)
    }

    /// All stored tickets, in unspecified order.
    pub fn sidecars(&self) -> Result<Vec<Ticket>> {
        self.sidecars
            .scan_prefix(TICKET_PREFIX)
            .map(|item| {
                let (_, value) = item.map_err(storage_error)?;
                deserialize(&value)
            })
            .collect()
    }

    /// The bid template bound to a ticket at offer time.
    pub fn sidecar_bid_template(&self, ticket: &Ticket) -> Result<Bid> {
        let nonce = self
            .sidecars
            .get(prefixed(NONCE_PREFIX, &ticket.storage_key()))
            .map_err(storage_error)?
            .ok_or(Error::NotFound("bid nonce for ticket"))?;

        let raw = self
            .sidecars
            .get(prefixed(BID_PREFIX, &nonce))
            .map_err(storage_error)?
            .ok_or(Error::NotFound("bid record"))?;

        deserialize(&raw)
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(storage_error)
    }
}

fn prefixed(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);

    out
}

fn serialize<T: Serialize>(t: &T) -> Result<Vec<u8>> {
    serde_cbor::to_vec(t)
        .context("could not serialize record")
        .map_err(Error::Transient)
}

fn deserialize<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_cbor::from_slice(raw).map_err(|err| {
        // A record that no longer decodes means the store is corrupt.
        Error::Fatal(format!("could not deserialize stored record: {}", err))
    })
}

fn storage_error(err: sled::Error) -> Error {
    match err {
        err @ sled::Error::Corruption { .. } => Error::Fatal(format!("store corruption: {}", err)),
        other => Error::Transient(anyhow::Error::new(other)),
    }
}

fn transaction_error(err: TransactionError<sled::Error>) -> Error {
    match err {
        TransactionError::Abort(err) | TransactionError::Storage(err) => storage_error(err),
    }
}
