//! Capabilities the core consumes from the outside world.
//!
//! Consumers implement these traits on whatever backs their node: an lnd-style
//! wallet and signer, a ZMQ or RPC chain notifier, and the auctioneer's RPC
//! client. All of them are suspension points; every method must be safe to
//! call again after a failure, and implementations are assumed thread-safe.

use crate::{account::Account, fees::FeeRate, sidecar::{Bid, Ticket}};
use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{secp256k1::PublicKey, Address, OutPoint, Script, Transaction, TxOut, Txid};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Identifies a key within the wallet's deterministic derivation tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLocator {
    pub family: u32,
    pub index: u32,
}

/// A wallet key together with the locator it was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub locator: KeyLocator,
    pub pubkey: PublicKey,
}

/// The auctioneer's answer to an account reservation request.
#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    pub auctioneer_key: PublicKey,
    pub initial_batch_key: PublicKey,
}

/// Details of a transaction reaching its requested confirmation depth.
#[derive(Clone, Debug)]
pub struct TxConfirmation {
    pub tx: Transaction,
    pub block_height: u32,
}

/// Details of a watched outpoint being spent.
#[derive(Clone, Debug)]
pub struct SpendDetail {
    pub tx: Transaction,
    pub spent_outpoint: OutPoint,
}

/// Everything a signer needs to produce one input signature.
#[derive(Clone, Debug)]
pub struct SignDescriptor {
    pub key: KeyDescriptor,
    /// Scalar added to the private key before signing, if any.
    pub single_tweak: Option<[u8; 32]>,
    pub witness_script: Script,
    /// The output being spent by `input_index`.
    pub output: TxOut,
    pub input_index: usize,
}

/// A stream of best-block heights. Implementations must yield the current
/// tip immediately upon subscription, then every new tip in chain order.
pub type BlockStream = BoxStream<'static, u32>;

#[async_trait]
pub trait Wallet {
    /// Derive the next key in the given family.
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor>;

    /// Create, sign and broadcast a transaction paying the given outputs,
    /// funded from wallet coins at the given fee rate.
    async fn send_outputs(&self, outputs: Vec<TxOut>, fee_rate: FeeRate) -> Result<Transaction>;

    /// Broadcast a fully signed transaction. Must be idempotent: publishing
    /// an already-known transaction is not an error.
    async fn publish_transaction(&self, tx: Transaction) -> Result<()>;

    /// A fresh address owned by the wallet.
    async fn next_address(&self) -> Result<Address>;

    /// All transactions relevant to the wallet, confirmed or not.
    async fn list_transactions(&self) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait Signer {
    /// ECDH between the key identified by `local` and `remote_key`,
    /// returning the hashed shared point.
    async fn derive_shared_key(
        &self,
        remote_key: &PublicKey,
        local: &KeyLocator,
    ) -> Result<[u8; 32]>;

    /// Produce one DER-encoded signature (without sighash flag) per
    /// descriptor, each committing to `SIGHASH_ALL` over the BIP-143 digest
    /// of the described input.
    async fn sign_output_raw(
        &self,
        tx: &Transaction,
        sign_descs: &[SignDescriptor],
    ) -> Result<Vec<Vec<u8>>>;
}

#[async_trait]
pub trait ChainNotifier {
    /// Resolve once `txid` paying the P2WSH of `script` has `num_confs`
    /// confirmations. `height_hint` bounds the rescan.
    async fn wait_for_confirmation(
        &self,
        txid: Txid,
        script: Script,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<TxConfirmation>;

    /// Resolve once `outpoint` is spent.
    async fn wait_for_spend(
        &self,
        outpoint: OutPoint,
        script: Script,
        height_hint: u32,
    ) -> Result<SpendDetail>;

    /// Subscribe to best-block heights.
    async fn block_epochs(&self) -> Result<BlockStream>;
}

/// Returned by [`Auctioneer::submit_order`] when the order nonce was already
/// accepted by a previous submission. Retransmissions after a restart treat
/// this as success.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("an order with this nonce has already been submitted")]
pub struct OrderAlreadySubmitted;

#[async_trait]
pub trait Auctioneer {
    /// Reserve key material for a new account.
    async fn reserve_account(
        &self,
        value: bitcoin::Amount,
        expiry: u32,
        trader_key: &PublicKey,
    ) -> Result<Reservation>;

    /// Announce a funded account to the auctioneer.
    async fn init_account(&self, account: &Account) -> Result<()>;

    /// Subscribe to server-side updates for an account.
    async fn subscribe_account_updates(&self, account: &Account) -> Result<()>;

    /// Ask the auctioneer to co-sign the multisig path of `closing_tx`.
    /// Returns the DER-encoded signature without sighash flag.
    async fn close_account(
        &self,
        trader_key: &PublicKey,
        closing_tx: &Transaction,
    ) -> Result<Vec<u8>>;

    /// Submit a sidecar bid bound to `ticket`.
    async fn submit_order(&self, bid: &Bid, ticket: &Ticket) -> Result<()>;
}

#[async_trait]
pub trait FundingManager {
    /// Arm the channel-funding shim for the channel promised by `ticket`.
    async fn expect_channel(&self, ticket: &Ticket) -> Result<()>;
}

// Shared capability handles delegate through `Arc`.

#[async_trait]
impl<T> Wallet for std::sync::Arc<T>
where
    T: Wallet + Send + Sync,
{
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor> {
        (**self).derive_next_key(family).await
    }

    async fn send_outputs(&self, outputs: Vec<TxOut>, fee_rate: FeeRate) -> Result<Transaction> {
        (**self).send_outputs(outputs, fee_rate).await
    }

    async fn publish_transaction(&self, tx: Transaction) -> Result<()> {
        (**self).publish_transaction(tx).await
    }

    async fn next_address(&self) -> Result<Address> {
        (**self).next_address().await
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        (**self).list_transactions().await
    }
}

#[async_trait]
impl<T> Signer for std::sync::Arc<T>
where
    T: Signer + Send + Sync,
{
    async fn derive_shared_key(
        &self,
        remote_key: &PublicKey,
        local: &KeyLocator,
    ) -> Result<[u8; 32]> {
        (**self).derive_shared_key(remote_key, local).await
    }

    async fn sign_output_raw(
        &self,
        tx: &Transaction,
        sign_descs: &[SignDescriptor],
    ) -> Result<Vec<Vec<u8>>> {
        (**self).sign_output_raw(tx, sign_descs).await
    }
}

#[async_trait]
impl<T> Auctioneer for std::sync::Arc<T>
where
    T: Auctioneer + Send + Sync,
{
    async fn reserve_account(
        &self,
        value: bitcoin::Amount,
        expiry: u32,
        trader_key: &PublicKey,
    ) -> Result<Reservation> {
        (**self).reserve_account(value, expiry, trader_key).await
    }

    async fn init_account(&self, account: &Account) -> Result<()> {
        (**self).init_account(account).await
    }

    async fn subscribe_account_updates(&self, account: &Account) -> Result<()> {
        (**self).subscribe_account_updates(account).await
    }

    async fn close_account(
        &self,
        trader_key: &PublicKey,
        closing_tx: &Transaction,
    ) -> Result<Vec<u8>> {
        (**self).close_account(trader_key, closing_tx).await
    }

    async fn submit_order(&self, bid: &Bid, ticket: &Ticket) -> Result<()> {
        (**self).submit_order(bid, ticket).await
    }
}

#[async_trait]
impl<T> FundingManager for std::sync::Arc<T>
where
    T: FundingManager + Send + Sync,
{
    async fn expect_channel(&self, ticket: &Ticket) -> Result<()> {
        (**self).expect_channel(ticket).await
    }
}
