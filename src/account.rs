//! On-chain account lifecycle: model, script library, chain watcher and the
//! per-account state machine.

pub mod manager;
pub mod script;
pub mod watcher;

use crate::{
    traits::KeyDescriptor, Error, Result, MAX_ACCOUNT_EXPIRY, MAX_ACCOUNT_VALUE,
    MIN_ACCOUNT_EXPIRY, MIN_ACCOUNT_VALUE,
};
use bitcoin::{secp256k1::PublicKey, Amount, OutPoint, Script, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A funded 2-of-2 output co-owned by the trader and the auctioneer.
///
/// The output script at any point in an account's history is uniquely
/// determined by `(expiry, trader_key, auctioneer_key, batch_key,
/// shared_secret)`; the batch key advances by one generator-point increment
/// per cleared batch, yielding a fresh output script each time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub value: Amount,
    /// Absolute block height after which the trader can sweep unilaterally.
    pub expiry: u32,
    pub trader_key: KeyDescriptor,
    pub auctioneer_key: PublicKey,
    pub batch_key: PublicKey,
    /// ECDH of the trader key and the auctioneer key.
    pub shared_secret: [u8; 32],
    pub state: AccountState,
    /// Set exactly once, when the funding transaction is adopted.
    pub outpoint: Option<OutPoint>,
    /// Lower bound for chain rescans.
    pub height_hint: u32,
    pub close_tx: Option<Transaction>,
}

impl Account {
    /// The storage key: the compressed trader public key.
    pub fn key(&self) -> [u8; 33] {
        self.trader_key.pubkey.serialize()
    }

    /// The current witness script of the account output.
    pub fn witness_script(&self) -> Result<Script> {
        script::account_script(
            self.expiry,
            &self.trader_key.pubkey,
            &self.auctioneer_key,
            &self.batch_key,
            &self.shared_secret,
        )
    }

    /// The witness script the output will have after the next cleared batch.
    pub fn next_witness_script(&self) -> Result<Script> {
        script::account_script(
            self.expiry,
            &self.trader_key.pubkey,
            &self.auctioneer_key,
            &script::next_batch_key(&self.batch_key)?,
            &self.shared_secret,
        )
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "account {} ({})",
            hex::encode(&self.key()[..]),
            self.state
        )
    }
}

/// The lifecycle of an account, a directed acyclic path.
///
/// `Closed` is terminal; a late chain event can never resurrect an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountState {
    /// Reserved with the auctioneer but not yet funded.
    Initiated,
    /// Funding transaction created, waiting for confirmation.
    PendingOpen,
    /// Funding transaction confirmed.
    Open,
    /// The expiry height was reached before the account closed.
    Expired,
    /// A closing transaction was published, waiting for its spend.
    PendingClosed,
    Closed,
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountState::Initiated => "initiated",
            AccountState::PendingOpen => "pending open",
            AccountState::Open => "open",
            AccountState::Expired => "expired",
            AccountState::PendingClosed => "pending closed",
            AccountState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Caller-supplied parameters of a new account, validated before any key
/// material is reserved.
#[derive(Clone, Copy, Debug)]
pub struct AccountParameters {
    pub value: Amount,
    pub expiry: u32,
}

impl AccountParameters {
    pub fn validate(&self, best_height: u32) -> Result<()> {
        let sat = self.value.as_sat();
        if sat < MIN_ACCOUNT_VALUE || sat > MAX_ACCOUNT_VALUE {
            return Err(Error::invalid_parameters(format!(
                "account value must be within [{}, {}] sat, got {}",
                MIN_ACCOUNT_VALUE, MAX_ACCOUNT_VALUE, sat
            )));
        }

        if self.expiry < best_height + MIN_ACCOUNT_EXPIRY {
            return Err(Error::invalid_parameters(format!(
                "account expiry must be at least {} blocks from the current tip",
                MIN_ACCOUNT_EXPIRY
            )));
        }

        if self.expiry > best_height + MAX_ACCOUNT_EXPIRY {
            return Err(Error::invalid_parameters(format!(
                "account expiry must be at most {} blocks from the current tip",
                MAX_ACCOUNT_EXPIRY
            )));
        }

        Ok(())
    }
}

/// The confirmation depth required before an account opens, scaled with the
/// account's value: `clamp(6 * value / max_value, 3, 6)`.
pub fn num_confs_for_value(value: Amount) -> u32 {
    let confs = 6 * value.as_sat() / MAX_ACCOUNT_VALUE;

    #[allow(clippy::cast_possible_truncation)]
    {
        confs.max(3).min(6) as u32
    }
}
