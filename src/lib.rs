#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod account;
pub mod fees;
pub mod mailbox;
pub mod sidecar;
pub mod store;
pub mod traits;

pub use ::bitcoin;
pub use account::{
    manager::AccountManager,
    watcher::{self, WatcherHandle},
    Account, AccountParameters, AccountState,
};
pub use sidecar::{negotiator, Bid, Ticket, TicketId, TicketState};
pub use store::Store;

use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};

/// Smallest value an account output may carry, in satoshi.
pub const MIN_ACCOUNT_VALUE: u64 = 100_000;

/// Largest value an account output may carry, in satoshi.
pub const MAX_ACCOUNT_VALUE: u64 = MIN_ACCOUNT_VALUE + ((1 << 24) - 1);

/// Minimum number of blocks between the current tip and an account's expiry.
pub const MIN_ACCOUNT_EXPIRY: u32 = 144;

/// Maximum number of blocks between the current tip and an account's expiry.
pub const MAX_ACCOUNT_EXPIRY: u32 = 144 * 365;

/// Key family under which the wallet derives account trader keys.
pub const ACCOUNT_KEY_FAMILY: u32 = 220;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error taxonomy.
///
/// `Transient` wraps a failure of an external capability (wallet, signer,
/// chain notifier, auctioneer, mailbox); callers are expected to retry the
/// surrounding operation, typically by resuming at the next startup.
/// `Protocol` covers malformed or unexpected peer input and is dropped by
/// negotiator readers but treated as fatal by the account spend handler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub(crate) fn transient(err: anyhow::Error) -> Self {
        Error::Transient(err)
    }

    pub(crate) fn invalid_parameters(msg: impl Into<String>) -> Self {
        Error::InvalidParameters(msg.into())
    }
}

/// A cloneable cancellation signal shared by every long-running loop.
///
/// Resolves once the paired [`ShutdownTrigger`] is either fired or dropped;
/// loops treat both the same way and exit at their next suspension point.
pub type Shutdown = Shared<oneshot::Receiver<()>>;

/// The sending half of a [`Shutdown`] signal.
#[derive(Debug)]
pub struct ShutdownTrigger(oneshot::Sender<()>);

impl ShutdownTrigger {
    /// Fire the signal explicitly. Dropping the trigger has the same effect.
    pub fn trigger(self) {
        let _ = self.0.send(());
    }
}

/// Create a linked shutdown trigger and signal.
pub fn shutdown() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = oneshot::channel();

    (ShutdownTrigger(tx), rx.shared())
}
