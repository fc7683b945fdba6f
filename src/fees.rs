//! Fee estimation for account transactions.

use bitcoin::{Amount, Transaction};
use serde::{Deserialize, Serialize};

/// A fee rate in satoshi per 1000 weight units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(u64);

/// The widely-relayed minimum. Account funding and closing transactions are
/// time-insensitive, so the floor is used throughout.
pub const FEE_RATE_FLOOR: FeeRate = FeeRate(253);

impl FeeRate {
    pub fn from_sat_per_kw(rate: u64) -> Self {
        Self(rate)
    }

    pub fn as_sat_per_kw(self) -> u64 {
        self.0
    }

    /// The fee owed by a transaction of the given weight, rounded down.
    pub fn fee_for_weight(self, weight: usize) -> Amount {
        Amount::from_sat(self.0 * weight as u64 / 1000)
    }
}

/// Estimated weight of `tx` once a witness of `witness_size` bytes is
/// attached to its sole input. `tx` must not carry any witness data yet.
pub fn weight_with_witness(tx: &Transaction, witness_size: usize) -> usize {
    // A witness-less transaction serializes without the segwit marker and
    // flag bytes; both count towards weight once any witness is present.
    tx.get_weight() + 2 + witness_size
}
