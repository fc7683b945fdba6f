use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey},
    util::bip143::SighashComponents,
    Amount, Transaction,
};
use njord::{
    account::{script, Account},
    sidecar::{Bid, Ticket},
    traits::{Auctioneer, FundingManager, OrderAlreadySubmitted, Reservation},
};
use rand::RngCore;
use std::{collections::HashMap, sync::Mutex};

/// A scripted auctioneer that hands out reservations and co-signs closes.
pub struct TestAuctioneer {
    secp: Secp256k1<All>,
    inner: Mutex<AuctionState>,
}

#[derive(Default)]
struct AuctionState {
    reservations: HashMap<[u8; 33], SecretKey>,
    accounts: HashMap<[u8; 33], Account>,
    init_calls: Vec<[u8; 33]>,
    subscriptions: Vec<[u8; 33]>,
    orders: Vec<[u8; 32]>,
}

impl TestAuctioneer {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            inner: Mutex::new(AuctionState::default()),
        }
    }

    pub fn init_calls(&self) -> Vec<[u8; 33]> {
        self.inner.lock().unwrap().init_calls.clone()
    }

    pub fn subscriptions(&self) -> Vec<[u8; 33]> {
        self.inner.lock().unwrap().subscriptions.clone()
    }

    pub fn submitted_orders(&self) -> Vec<[u8; 32]> {
        self.inner.lock().unwrap().orders.clone()
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
}

#[async_trait]
impl Auctioneer for TestAuctioneer {
    async fn reserve_account(
        &self,
        _value: Amount,
        _expiry: u32,
        trader_key: &PublicKey,
    ) -> Result<Reservation> {
        let auctioneer_sk = self.new_secret();
        let auctioneer_key = PublicKey::from_secret_key(&self.secp, &auctioneer_sk);
        let initial_batch_key =
            PublicKey::from_secret_key(&self.secp, &self.new_secret());

        self.inner
            .lock()
            .unwrap()
            .reservations
            .insert(trader_key.serialize(), auctioneer_sk);

        Ok(Reservation {
            auctioneer_key,
            initial_batch_key,
        })
    }

    async fn init_account(&self, account: &Account) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.accounts.insert(account.key(), account.clone());
        state.init_calls.push(account.key());

        Ok(())
    }

    async fn subscribe_account_updates(&self, account: &Account) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .push(account.key());

        Ok(())
    }

    async fn close_account(
        &self,
        trader_key: &PublicKey,
        closing_tx: &Transaction,
    ) -> Result<Vec<u8>> {
        let (account, auctioneer_sk) = {
            let state = self.inner.lock().unwrap();
            let key = trader_key.serialize();

            let account = state
                .accounts
                .get(&key)
                .ok_or_else(|| anyhow!("unknown account"))?
                .clone();
            let sk = *state
                .reservations
                .get(&key)
                .ok_or_else(|| anyhow!("no reservation for account"))?;

            (account, sk)
        };

        let witness_script = account
            .witness_script()
            .map_err(|err| anyhow!("{}", err))?;
        let (tweaked_trader, _) = script::tweaked_keys(
            &account.trader_key.pubkey,
            &account.auctioneer_key,
            &account.batch_key,
            &account.shared_secret,
        )
        .map_err(|err| anyhow!("{}", err))?;

        let mut sk = auctioneer_sk;
        sk.add_assign(&script::auctioneer_key_tweak(
            &account.auctioneer_key,
            &tweaked_trader,
        ))
        .context("tweak pushed key out of range")?;

        let digest = SighashComponents::new(closing_tx).sighash_all(
            &closing_tx.input[0],
            &witness_script,
            account.value.as_sat(),
        );
        let message = Message::from_slice(&digest.into_inner())?;

        let sig = self.secp.sign(&message, &sk);

        Ok(sig.serialize_der().as_ref().to_vec())
    }

    async fn submit_order(&self, bid: &Bid, _ticket: &Ticket) -> Result<()> {
        let mut state = self.inner.lock().unwrap();

        if state.orders.contains(&bid.nonce) {
            return Err(anyhow::Error::new(OrderAlreadySubmitted));
        }

        state.orders.push(bid.nonce);

        Ok(())
    }
}

/// Records which tickets had their channel-funding shim armed.
pub struct TestFunding {
    expected: Mutex<Vec<Ticket>>,
}

impl TestFunding {
    pub fn new() -> Self {
        Self {
            expected: Mutex::new(Vec::new()),
        }
    }

    pub fn expected(&self) -> Vec<Ticket> {
        self.expected.lock().unwrap().clone()
    }
}

#[async_trait]
impl FundingManager for TestFunding {
    async fn expect_channel(&self, ticket: &Ticket) -> Result<()> {
        self.expected.lock().unwrap().push(ticket.clone());

        Ok(())
    }
}
