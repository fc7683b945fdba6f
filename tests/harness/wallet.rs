use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    secp256k1::{ecdh::SharedSecret, All, Message, PublicKey, Secp256k1, SecretKey},
    util::bip143::SighashComponents,
    Address, Network, OutPoint, Script, Transaction, TxIn, TxOut, Txid,
};
use njord::{
    fees::FeeRate,
    traits::{KeyDescriptor, KeyLocator, SignDescriptor, Signer, Wallet},
};
use rand::RngCore;
use std::{
    collections::HashMap,
    sync::Mutex,
};

/// An in-memory wallet and signer backed by freshly generated keys.
pub struct TestWallet {
    secp: Secp256k1<All>,
    inner: Mutex<WalletState>,
}

#[derive(Default)]
struct WalletState {
    next_index: u32,
    keys: HashMap<u32, SecretKey>,
    transactions: Vec<Transaction>,
    published: Vec<Transaction>,
}

impl TestWallet {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            inner: Mutex::new(WalletState::default()),
        }
    }

    /// Make a transaction visible to `list_transactions` without going
    /// through `send_outputs`, mimicking a transaction found after restart.
    pub fn insert_transaction(&self, tx: Transaction) {
        self.inner.lock().unwrap().transactions.push(tx);
    }

    /// Every transaction handed to `publish_transaction`, in order.
    pub fn published(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().published.clone()
    }

    fn new_secret(&self) -> SecretKey {
        loop {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);

            if let Ok(sk) = SecretKey::from_slice(&bytes) {
                return sk;
            }
        }
    }

    fn secret_for(&self, locator: &KeyLocator) -> Result<SecretKey> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .get(&locator.index)
            .copied()
            .ok_or_else(|| anyhow!("no key at index {}", locator.index))
    }
}

#[async_trait]
impl Wallet for TestWallet {
    async fn derive_next_key(&self, family: u32) -> Result<KeyDescriptor> {
        let sk = self.new_secret();
        let pubkey = PublicKey::from_secret_key(&self.secp, &sk);

        let mut state = self.inner.lock().unwrap();
        let index = state.next_index;
        state.next_index += 1;
        state.keys.insert(index, sk);

        Ok(KeyDescriptor {
            locator: KeyLocator { family, index },
            pubkey,
        })
    }

    async fn send_outputs(&self, outputs: Vec<TxOut>, _fee_rate: FeeRate) -> Result<Transaction> {
        let mut coin = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut coin);

        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::hash(&coin), 0),
                script_sig: Script::new(),
                sequence: 0xffff_ffff,
                witness: Vec::new(),
            }],
            output: outputs,
        };

        self.inner.lock().unwrap().transactions.push(tx.clone());

        Ok(tx)
    }

    async fn publish_transaction(&self, tx: Transaction) -> Result<()> {
        let mut state = self.inner.lock().unwrap();

        if !state.transactions.iter().any(|t| t.txid() == tx.txid()) {
            state.transactions.push(tx.clone());
        }
        state.published.push(tx);

        Ok(())
    }

    async fn next_address(&self) -> Result<Address> {
        let sk = self.new_secret();
        let pubkey = bitcoin::PublicKey {
            compressed: true,
            key: PublicKey::from_secret_key(&self.secp, &sk),
        };

        Ok(Address::p2wpkh(&pubkey, Network::Regtest))
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.inner.lock().unwrap().transactions.clone())
    }
}

#[async_trait]
impl Signer for TestWallet {
    async fn derive_shared_key(
        &self,
        remote_key: &PublicKey,
        local: &KeyLocator,
    ) -> Result<[u8; 32]> {
        let sk = self.secret_for(local)?;
        let shared = SharedSecret::new(remote_key, &sk);

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&shared[..]);

        Ok(secret)
    }

    async fn sign_output_raw(
        &self,
        tx: &Transaction,
        sign_descs: &[SignDescriptor],
    ) -> Result<Vec<Vec<u8>>> {
        let mut sigs = Vec::with_capacity(sign_descs.len());

        for desc in sign_descs {
            let mut sk = self.secret_for(&desc.key.locator)?;
            if let Some(tweak) = desc.single_tweak {
                sk.add_assign(&tweak[..])
                    .context("tweak pushed key out of range")?;
            }

            let digest = SighashComponents::new(tx).sighash_all(
                &tx.input[desc.input_index],
                &desc.witness_script,
                desc.output.value,
            );
            let message = Message::from_slice(&digest.into_inner())?;

            let sig = self.secp.sign(&message, &sk);
            sigs.push(sig.serialize_der().as_ref().to_vec());
        }

        Ok(sigs)
    }
}
