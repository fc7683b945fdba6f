//! The account output script and its two spending paths.
//!
//! Everything in here is pure and deterministic; both the trader and the
//! auctioneer must derive byte-identical scripts from the same account
//! parameters or neither spending path will be recognised.

use crate::{Error, Result};
use bitcoin::{
    blockdata::{opcodes, script::Builder},
    hashes::{sha256, Hash},
    secp256k1::{PublicKey, Secp256k1},
    Script, Transaction,
};
use sha2::{Digest, Sha256};

/// Maximum encoded size of the witness spending the expiry path:
/// one signature, the empty branch selector and the witness script.
pub const EXPIRY_WITNESS_SIZE: usize = 193;

/// Maximum encoded size of the witness spending the multisig path:
/// the CHECKMULTISIG dummy, two signatures, the branch selector and the
/// witness script.
pub const MULTISIG_WITNESS_SIZE: usize = 269;

/// The compressed secp256k1 generator point.
const GENERATOR: [u8; 33] = [
    0x02, 0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87,
    0x0b, 0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b, 0x16,
    0xf8, 0x17, 0x98,
];

/// The single tweak applied to the trader's key at signing time:
/// `SHA256(batch_key || shared_secret || trader_key)`.
pub fn trader_key_tweak(
    batch_key: &PublicKey,
    shared_secret: &[u8; 32],
    trader_key: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&batch_key.serialize()[..]);
    hasher.update(&shared_secret[..]);
    hasher.update(&trader_key.serialize()[..]);

    hasher.finalize().into()
}

/// The tweak applied to the auctioneer's key, committing to the already
/// tweaked trader key: `SHA256(auctioneer_key || tweaked_trader_key)`.
pub fn auctioneer_key_tweak(
    auctioneer_key: &PublicKey,
    tweaked_trader_key: &PublicKey,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&auctioneer_key.serialize()[..]);
    hasher.update(&tweaked_trader_key.serialize()[..]);

    hasher.finalize().into()
}

fn add_tweak(key: &PublicKey, tweak: &[u8; 32]) -> Result<PublicKey> {
    let secp = Secp256k1::verification_only();

    let mut tweaked = *key;
    tweaked
        .add_exp_assign(&secp, &tweak[..])
        .map_err(|_| Error::Fatal("account key tweak is out of range".to_string()))?;

    Ok(tweaked)
}

/// Both script keys after applying their per-account tweaks.
pub fn tweaked_keys(
    trader_key: &PublicKey,
    auctioneer_key: &PublicKey,
    batch_key: &PublicKey,
    shared_secret: &[u8; 32],
) -> Result<(PublicKey, PublicKey)> {
    let trader = add_tweak(
        trader_key,
        &trader_key_tweak(batch_key, shared_secret, trader_key),
    )?;
    let auctioneer = add_tweak(
        auctioneer_key,
        &auctioneer_key_tweak(auctioneer_key, &trader),
    )?;

    Ok((trader, auctioneer))
}

/// The batch key after one cleared batch: `current + G`.
pub fn next_batch_key(batch_key: &PublicKey) -> Result<PublicKey> {
    let generator = PublicKey::from_slice(&GENERATOR).expect("generator is a valid point");

    batch_key
        .combine(&generator)
        .map_err(|_| Error::Fatal("batch key evolution produced the point at infinity".to_string()))
}

/// The raw witness script of an account output:
///
/// ```text
/// OP_IF
///     2 <tweaked_trader_key> <tweaked_auctioneer_key> 2 OP_CHECKMULTISIG
/// OP_ELSE
///     <expiry> OP_CHECKLOCKTIMEVERIFY OP_DROP
///     <tweaked_trader_key> OP_CHECKSIG
/// OP_ENDIF
/// ```
pub fn witness_script(
    expiry: u32,
    tweaked_trader_key: &PublicKey,
    tweaked_auctioneer_key: &PublicKey,
) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_IF)
        .push_int(2)
        .push_slice(&tweaked_trader_key.serialize())
        .push_slice(&tweaked_auctioneer_key.serialize())
        .push_int(2)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .push_opcode(opcodes::all::OP_ELSE)
        .push_int(i64::from(expiry))
        .push_opcode(opcodes::all::OP_CLTV)
        .push_opcode(opcodes::all::OP_DROP)
        .push_slice(&tweaked_trader_key.serialize())
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

/// The witness script derived from untweaked account parameters.
pub fn account_script(
    expiry: u32,
    trader_key: &PublicKey,
    auctioneer_key: &PublicKey,
    batch_key: &PublicKey,
    shared_secret: &[u8; 32],
) -> Result<Script> {
    let (trader, auctioneer) = tweaked_keys(trader_key, auctioneer_key, batch_key, shared_secret)?;

    Ok(witness_script(expiry, &trader, &auctioneer))
}

/// The P2WSH output script committing to `script`.
pub fn p2wsh(script: &Script) -> Script {
    let hash = sha256::Hash::hash(script.as_bytes());

    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHBYTES_0)
        .push_slice(&hash[..])
        .into_script()
}

/// Index of the output paying the P2WSH of `script`, if any.
pub fn locate_output(tx: &Transaction, script: &Script) -> Option<usize> {
    let script_pubkey = p2wsh(script);

    tx.output
        .iter()
        .position(|output| output.script_pubkey == script_pubkey)
}

/// Whether a witness stack spends an account output through the expiry
/// path: a trader signature followed by the empty branch selector and the
/// witness script.
pub fn is_expiry_spend(witness: &[Vec<u8>]) -> bool {
    witness.len() == 3 && witness[1].is_empty() && !witness[0].is_empty()
}

/// Whether a witness stack spends an account output through the multisig
/// path: the CHECKMULTISIG dummy, two signatures, a truthy branch selector
/// and the witness script.
pub fn is_multisig_spend(witness: &[Vec<u8>]) -> bool {
    witness.len() == 5 && witness[0].is_empty() && witness[3] == [0x01]
}

/// Assemble the expiry-path witness. `trader_sig` must already carry its
/// sighash flag.
pub fn expiry_witness(trader_sig: &[u8], script: &Script) -> Vec<Vec<u8>> {
    vec![trader_sig.to_vec(), Vec::new(), script.to_bytes()]
}

/// Assemble the multisig-path witness. Signature order must match the key
/// order within the script: trader first, auctioneer second.
pub fn multisig_witness(
    trader_sig: &[u8],
    auctioneer_sig: &[u8],
    script: &Script,
) -> Vec<Vec<u8>> {
    vec![
        Vec::new(),
        trader_sig.to_vec(),
        auctioneer_sig.to_vec(),
        vec![0x01],
        script.to_bytes(),
    ]
}
