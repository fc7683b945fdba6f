//! The per-account state machine.
//!
//! All state lives in the store; the manager only ever works on a transient
//! copy scoped to a single step. `resume` is the one reentry point of the
//! machine and is driven both at first funding and after every restart.

use crate::{
    account::{
        num_confs_for_value, script,
        watcher::{AccountEvents, WatcherHandle},
        Account, AccountParameters, AccountState,
    },
    fees::{weight_with_witness, FEE_RATE_FLOOR},
    store::{AccountModifier, Store},
    traits::{Auctioneer, SignDescriptor, Signer, SpendDetail, TxConfirmation, Wallet},
    Error, Result, ACCOUNT_KEY_FAMILY,
};
use async_trait::async_trait;
use bitcoin::{
    secp256k1::PublicKey, Amount, Script, SigHashType, Transaction, TxIn, TxOut,
};
use futures::lock::Mutex;
use std::{fmt, sync::Arc};

/// Outputs below this many satoshi are not relayed when paying a P2WPKH.
const P2WPKH_DUST_LIMIT: u64 = 294;

pub struct AccountManager<W, S, A> {
    wallet: W,
    signer: S,
    auctioneer: A,
    store: Arc<Store>,
    watcher: WatcherHandle,
    /// Serializes every state transition, including the event handlers.
    ///
    /// Holders must not register more watches per critical section than the
    /// watcher's command buffer can absorb, since the dispatch loop may
    /// itself be blocked on this lock inside a handler.
    lock: Mutex<()>,
}

impl<W, S, A> fmt::Debug for AccountManager<W, S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountManager")
    }
}

impl<W, S, A> AccountManager<W, S, A>
where
    W: Wallet + Send + Sync,
    S: Signer + Send + Sync,
    A: Auctioneer + Send + Sync,
{
    pub fn new(
        wallet: W,
        signer: S,
        auctioneer: A,
        store: Arc<Store>,
        watcher: WatcherHandle,
    ) -> Self {
        Self {
            wallet,
            signer,
            auctioneer,
            store,
            watcher,
            lock: Mutex::new(()),
        }
    }

    /// Create, fund and start watching a new account.
    pub async fn init_account(
        &self,
        params: AccountParameters,
        best_height: u32,
    ) -> Result<Account> {
        params.validate(best_height)?;

        let trader_key = self
            .wallet
            .derive_next_key(ACCOUNT_KEY_FAMILY)
            .await
            .map_err(Error::transient)?;

        let reservation = self
            .auctioneer
            .reserve_account(params.value, params.expiry, &trader_key.pubkey)
            .await
            .map_err(Error::transient)?;

        if reservation.auctioneer_key == trader_key.pubkey
            || reservation.initial_batch_key == trader_key.pubkey
        {
            return Err(Error::Protocol(
                "auctioneer reservation echoed our trader key".to_string(),
            ));
        }

        let shared_secret = self
            .signer
            .derive_shared_key(&reservation.auctioneer_key, &trader_key.locator)
            .await
            .map_err(Error::transient)?;

        let account = Account {
            value: params.value,
            expiry: params.expiry,
            trader_key,
            auctioneer_key: reservation.auctioneer_key,
            batch_key: reservation.initial_batch_key,
            shared_secret,
            state: AccountState::Initiated,
            outpoint: None,
            height_hint: best_height,
            close_tx: None,
        };

        self.store.add_account(&account).await?;
        log::info!("initialized {}", account);

        self.resume(account.clone(), false).await?;

        self.store.account(&account.key())
    }

    /// Resume every stored account after a restart. Per-account transient
    /// failures are logged and skipped so one flaky account cannot block the
    /// rest; fatal errors abort.
    pub async fn resume_all(&self) -> Result<()> {
        for account in self.store.accounts()? {
            let key = hex::encode(&account.key()[..]);

            match self.resume(account, true).await {
                Ok(()) => {}
                Err(err @ Error::Fatal(_)) => return Err(err),
                Err(err) => log::warn!("failed to resume account {}: {}", key, err),
            }
        }

        Ok(())
    }

    /// All stored accounts.
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.store.accounts()
    }

    /// The stored account owned by `trader_key`.
    pub fn account(&self, trader_key: &PublicKey) -> Result<Account> {
        self.store.account(&trader_key.serialize())
    }

    /// Close an account, spending it either through the expiry path (if it
    /// is already expired or past its expiry height) or cooperatively
    /// through the multisig path. Returns the published closing transaction.
    pub async fn close_account(
        &self,
        trader_key: &PublicKey,
        close_outputs: Vec<TxOut>,
        best_height: u32,
    ) -> Result<Transaction> {
        let _guard = self.lock.lock().await;

        let mut account = self.store.account(&trader_key.serialize())?;

        match account.state {
            AccountState::PendingClosed | AccountState::Closed => {
                return Err(Error::invalid_parameters(format!(
                    "cannot close account in state `{}`",
                    account.state
                )));
            }
            _ => {}
        }

        let outpoint = account
            .outpoint
            .ok_or_else(|| Error::invalid_parameters("account is not funded yet"))?;

        let expiry_path =
            account.state == AccountState::Expired || best_height >= account.expiry;
        let witness_size = if expiry_path {
            script::EXPIRY_WITNESS_SIZE
        } else {
            script::MULTISIG_WITNESS_SIZE
        };

        let witness_script = account.witness_script()?;

        let mut tx = Transaction {
            version: 2,
            // The expiry path must satisfy the CLTV branch.
            lock_time: if expiry_path { best_height } else { 0 },
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: Script::new(),
                sequence: if expiry_path { 0 } else { 0xffff_ffff },
                witness: Vec::new(),
            }],
            output: close_outputs,
        };

        if tx.output.is_empty() {
            let address = self
                .wallet
                .next_address()
                .await
                .map_err(Error::transient)?;

            tx.output.push(TxOut {
                value: 0,
                script_pubkey: address.script_pubkey(),
            });

            let weight = weight_with_witness(&tx, witness_size);
            let fee = FEE_RATE_FLOOR.fee_for_weight(weight);
            let value = account.value.checked_sub(fee).ok_or_else(|| {
                Error::invalid_parameters("account value cannot cover the closing fee")
            })?;

            tx.output[0].value = value.as_sat();
        }

        check_close_sanity(&tx, account.value)?;

        let trader_sig = self.trader_close_sig(&account, &tx, &witness_script).await?;

        tx.input[0].witness = if expiry_path {
            script::expiry_witness(&trader_sig, &witness_script)
        } else {
            let auctioneer_sig = self
                .auctioneer
                .close_account(&account.trader_key.pubkey, &tx)
                .await
                .map_err(Error::transient)?;

            script::multisig_witness(
                &trader_sig,
                &with_sighash_flag(auctioneer_sig),
                &witness_script,
            )
        };

        self.store
            .update_account(
                &mut account,
                &[
                    AccountModifier::State(AccountState::PendingClosed),
                    AccountModifier::CloseTx(tx.clone()),
                ],
            )
            .await?;

        log::info!("closing {} with {}", account, tx.txid());

        // A failed broadcast is retried by the next resume; the closing
        // transaction is already durable.
        if let Err(err) = self.wallet.publish_transaction(tx.clone()).await {
            log::warn!("failed to publish closing transaction: {:#}", err);
        }

        Ok(tx)
    }

    /// The single reentry point of the state machine. Dispatches on the
    /// account's state and falls through to the later states within the same
    /// call, checkpointing before every fall-through.
    pub async fn resume(&self, mut account: Account, on_restart: bool) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut step = account.state;
        loop {
            match step {
                AccountState::Initiated => {
                    self.fund_account(&mut account, on_restart).await?;
                    step = AccountState::PendingOpen;
                }
                AccountState::PendingOpen => {
                    self.announce_account(&account, on_restart).await?;
                    step = AccountState::Open;
                }
                AccountState::Open => {
                    self.watch_funded_account(&account).await?;

                    self.auctioneer
                        .subscribe_account_updates(&account)
                        .await
                        .map_err(Error::transient)?;

                    break;
                }
                AccountState::Expired => {
                    self.watch_spend(&account).await?;
                    break;
                }
                AccountState::PendingClosed => {
                    self.republish_close(&account).await;
                    self.watch_spend(&account).await?;
                    break;
                }
                AccountState::Closed => break,
            }
        }

        Ok(())
    }

    /// `Initiated`: find or create the funding transaction and adopt its
    /// account output.
    async fn fund_account(&self, account: &mut Account, on_restart: bool) -> Result<()> {
        let witness_script = account.witness_script()?;
        let script_pubkey = script::p2wsh(&witness_script);

        let existing = if on_restart {
            // A previous run may have created (and possibly broadcast) the
            // funding transaction before crashing; adopt it instead of
            // paying for a second one.
            self.wallet
                .list_transactions()
                .await
                .map_err(Error::transient)?
                .into_iter()
                .find(|tx| {
                    tx.output.iter().any(|out| {
                        out.script_pubkey == script_pubkey
                            && out.value == account.value.as_sat()
                    })
                })
        } else {
            None
        };

        let tx = match existing {
            Some(tx) => tx,
            None => self
                .wallet
                .send_outputs(
                    vec![TxOut {
                        value: account.value.as_sat(),
                        script_pubkey,
                    }],
                    FEE_RATE_FLOOR,
                )
                .await
                .map_err(Error::transient)?,
        };

        let index = script::locate_output(&tx, &witness_script).ok_or_else(|| {
            Error::Fatal("funding transaction does not pay the account script".to_string())
        })?;

        #[allow(clippy::cast_possible_truncation)]
        let outpoint = bitcoin::OutPoint::new(tx.txid(), index as u32);

        self.store
            .update_account(
                account,
                &[
                    AccountModifier::State(AccountState::PendingOpen),
                    AccountModifier::OutPoint(outpoint),
                ],
            )
            .await?;

        log::info!("funded {} at {}", account, outpoint);

        Ok(())
    }

    /// `PendingOpen`: make sure the funding transaction is out, tell the
    /// auctioneer, and wait for the value-scaled confirmation depth.
    async fn announce_account(&self, account: &Account, on_restart: bool) -> Result<()> {
        let outpoint = account
            .outpoint
            .ok_or_else(|| Error::Fatal("pending-open account without outpoint".to_string()))?;

        if on_restart {
            let tx = self
                .wallet
                .list_transactions()
                .await
                .map_err(Error::transient)?
                .into_iter()
                .find(|tx| tx.txid() == outpoint.txid)
                .ok_or(Error::NotFound("funding transaction"))?;

            self.wallet
                .publish_transaction(tx)
                .await
                .map_err(Error::transient)?;
        }

        self.auctioneer
            .init_account(account)
            .await
            .map_err(Error::transient)?;

        self.watcher
            .watch_conf(
                account.key(),
                outpoint.txid,
                account.witness_script()?,
                num_confs_for_value(account.value),
                account.height_hint,
            )
            .await?;

        Ok(())
    }

    /// Watches shared by `Open` accounts: the spend of the outpoint and the
    /// expiry height.
    async fn watch_funded_account(&self, account: &Account) -> Result<()> {
        self.watch_spend(account).await?;

        self.watcher
            .watch_expiration(account.key(), account.expiry)
            .await?;

        Ok(())
    }

    async fn watch_spend(&self, account: &Account) -> Result<()> {
        let outpoint = account
            .outpoint
            .ok_or_else(|| Error::Fatal("funded account without outpoint".to_string()))?;

        self.watcher
            .watch_spend(
                account.key(),
                outpoint,
                account.witness_script()?,
                account.height_hint,
            )
            .await
    }

    async fn republish_close(&self, account: &Account) {
        let close_tx = match &account.close_tx {
            Some(tx) => tx.clone(),
            None => {
                log::warn!("{} has no closing transaction to republish", account);
                return;
            }
        };

        if let Err(err) = self.wallet.publish_transaction(close_tx).await {
            log::warn!(
                "failed to republish closing transaction of {}: {:#}",
                account,
                err
            );
        }
    }

    async fn trader_close_sig(
        &self,
        account: &Account,
        tx: &Transaction,
        witness_script: &Script,
    ) -> Result<Vec<u8>> {
        let tweak = script::trader_key_tweak(
            &account.batch_key,
            &account.shared_secret,
            &account.trader_key.pubkey,
        );

        let sign_desc = SignDescriptor {
            key: account.trader_key,
            single_tweak: Some(tweak),
            witness_script: witness_script.clone(),
            output: TxOut {
                value: account.value.as_sat(),
                script_pubkey: script::p2wsh(witness_script),
            },
            input_index: 0,
        };

        let sigs = self
            .signer
            .sign_output_raw(tx, &[sign_desc])
            .await
            .map_err(Error::transient)?;

        let sig = sigs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("signer returned no signature".to_string()))?;

        Ok(with_sighash_flag(sig))
    }
}

#[async_trait]
impl<W, S, A> AccountEvents for AccountManager<W, S, A>
where
    W: Wallet + Send + Sync,
    S: Signer + Send + Sync,
    A: Auctioneer + Send + Sync,
{
    async fn on_confirmation(&self, trader_key: [u8; 33], conf: TxConfirmation) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut account = self.store.account(&trader_key)?;

        // When the confirmation lands exactly at the expiry height the
        // expiry handler drives the state change instead.
        if conf.block_height == account.expiry {
            return Ok(());
        }

        // A late confirmation must not resurrect an account that has moved
        // on (or closed) in the meantime.
        if account.state != AccountState::PendingOpen {
            return Ok(());
        }

        self.store
            .update_account(
                &mut account,
                &[
                    AccountModifier::State(AccountState::Open),
                    AccountModifier::HeightHint(conf.block_height),
                ],
            )
            .await?;

        log::info!("{} confirmed at height {}", account, conf.block_height);

        Ok(())
    }

    async fn on_spend(&self, trader_key: [u8; 33], spend: SpendDetail) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut account = self.store.account(&trader_key)?;
        let outpoint = account
            .outpoint
            .ok_or_else(|| Error::Fatal("spent account without outpoint".to_string()))?;

        let witness = spend
            .tx
            .input
            .iter()
            .find(|input| input.previous_output == outpoint)
            .map(|input| input.witness.clone())
            .ok_or_else(|| {
                Error::Protocol("spend notification does not spend the account".to_string())
            })?;

        if script::is_multisig_spend(&witness) {
            // A batch execution recreates the account output under the next
            // batch key; the batch subsystem updates account and order state
            // atomically, so nothing to do here.
            let next_script = script::p2wsh(&account.next_witness_script()?);
            if spend
                .tx
                .output
                .iter()
                .any(|out| out.script_pubkey == next_script)
            {
                log::debug!("{} recreated by batch execution", account);
                return Ok(());
            }
        } else if !script::is_expiry_spend(&witness) {
            return Err(Error::Protocol(format!(
                "unknown witness spending account {}",
                hex::encode(&trader_key[..])
            )));
        }

        self.store
            .update_account(
                &mut account,
                &[
                    AccountModifier::State(AccountState::Closed),
                    AccountModifier::CloseTx(spend.tx.clone()),
                ],
            )
            .await?;

        log::info!("{} spent by {}", account, spend.tx.txid());

        Ok(())
    }

    async fn on_expiry(&self, trader_key: [u8; 33]) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut account = self.store.account(&trader_key)?;

        match account.state {
            AccountState::PendingClosed | AccountState::Closed => return Ok(()),
            _ => {}
        }

        self.store
            .update_account(&mut account, &[AccountModifier::State(AccountState::Expired)])
            .await?;

        log::info!("{} reached its expiry height", account);

        Ok(())
    }
}

fn with_sighash_flag(mut sig: Vec<u8>) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation)]
    sig.push(SigHashType::All.as_u32() as u8);
    sig
}

fn check_close_sanity(tx: &Transaction, account_value: Amount) -> Result<()> {
    if tx.output.is_empty() {
        return Err(Error::invalid_parameters(
            "closing transaction pays no outputs",
        ));
    }

    let total: u64 = tx.output.iter().map(|out| out.value).sum();
    if total > account_value.as_sat() {
        return Err(Error::invalid_parameters(
            "closing outputs exceed the account value",
        ));
    }

    if let Some(out) = tx.output.iter().find(|out| out.value < P2WPKH_DUST_LIMIT) {
        return Err(Error::invalid_parameters(format!(
            "closing output of {} sat is below the dust limit",
            out.value
        )));
    }

    Ok(())
}
