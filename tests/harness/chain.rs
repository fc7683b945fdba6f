use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Transaction, Txid};
use futures::{channel::mpsc, channel::oneshot, StreamExt};
use njord::traits::{BlockStream, ChainNotifier, SpendDetail, TxConfirmation};
use std::sync::Mutex;

/// A scripted chain: tests mine blocks, the notifier resolves waiters.
pub struct TestNotifier {
    inner: Mutex<ChainState>,
}

struct ChainState {
    height: u32,
    mined: Vec<(u32, Transaction)>,
    epochs: Vec<mpsc::UnboundedSender<u32>>,
    conf_waiters: Vec<ConfWaiter>,
    spend_waiters: Vec<SpendWaiter>,
    conf_requests: Vec<(Txid, u32)>,
}

struct ConfWaiter {
    txid: Txid,
    num_confs: u32,
    sender: oneshot::Sender<TxConfirmation>,
}

struct SpendWaiter {
    outpoint: OutPoint,
    sender: oneshot::Sender<SpendDetail>,
}

impl TestNotifier {
    pub fn new(height: u32) -> Self {
        Self {
            inner: Mutex::new(ChainState {
                height,
                mined: Vec::new(),
                epochs: Vec::new(),
                conf_waiters: Vec::new(),
                spend_waiters: Vec::new(),
                conf_requests: Vec::new(),
            }),
        }
    }

    pub fn height(&self) -> u32 {
        self.inner.lock().unwrap().height
    }

    /// Every confirmation registration seen, as `(txid, num_confs)`.
    pub fn conf_requests(&self) -> Vec<(Txid, u32)> {
        self.inner.lock().unwrap().conf_requests.clone()
    }

    pub fn mine_block(&self, txs: Vec<Transaction>) {
        let mut state = self.inner.lock().unwrap();

        state.height += 1;
        let tip = state.height;
        for tx in txs {
            state.mined.push((tip, tx));
        }

        let mined = state.mined.clone();

        let waiters = std::mem::replace(&mut state.conf_waiters, Vec::new());
        for waiter in waiters {
            match confirmation(&mined, tip, waiter.txid, waiter.num_confs) {
                Some(conf) => {
                    let _ = waiter.sender.send(conf);
                }
                None => state.conf_waiters.push(waiter),
            }
        }

        let waiters = std::mem::replace(&mut state.spend_waiters, Vec::new());
        for waiter in waiters {
            match spend(&mined, waiter.outpoint) {
                Some(detail) => {
                    let _ = waiter.sender.send(detail);
                }
                None => state.spend_waiters.push(waiter),
            }
        }

        state.epochs.retain(|epoch| epoch.unbounded_send(tip).is_ok());
    }

    pub fn mine_until(&self, target: u32) {
        while self.height() < target {
            self.mine_block(Vec::new());
        }
    }
}

fn confirmation(
    mined: &[(u32, Transaction)],
    tip: u32,
    txid: Txid,
    num_confs: u32,
) -> Option<TxConfirmation> {
    mined
        .iter()
        .find(|(_, tx)| tx.txid() == txid)
        .and_then(|(height, tx)| {
            if tip + 1 >= *height + num_confs {
                Some(TxConfirmation {
                    tx: tx.clone(),
                    block_height: *height,
                })
            } else {
                None
            }
        })
}

fn spend(mined: &[(u32, Transaction)], outpoint: OutPoint) -> Option<SpendDetail> {
    mined
        .iter()
        .find(|(_, tx)| {
            tx.input
                .iter()
                .any(|input| input.previous_output == outpoint)
        })
        .map(|(_, tx)| SpendDetail {
            tx: tx.clone(),
            spent_outpoint: outpoint,
        })
}

#[async_trait]
impl ChainNotifier for TestNotifier {
    async fn wait_for_confirmation(
        &self,
        txid: Txid,
        _script: Script,
        num_confs: u32,
        _height_hint: u32,
    ) -> Result<TxConfirmation> {
        let receiver = {
            let mut state = self.inner.lock().unwrap();
            state.conf_requests.push((txid, num_confs));

            if let Some(conf) = confirmation(&state.mined, state.height, txid, num_confs) {
                return Ok(conf);
            }

            let (sender, receiver) = oneshot::channel();
            state.conf_waiters.push(ConfWaiter {
                txid,
                num_confs,
                sender,
            });

            receiver
        };

        receiver.await.map_err(|_| anyhow!("notifier shut down"))
    }

    async fn wait_for_spend(
        &self,
        outpoint: OutPoint,
        _script: Script,
        _height_hint: u32,
    ) -> Result<SpendDetail> {
        let receiver = {
            let mut state = self.inner.lock().unwrap();

            if let Some(detail) = spend(&state.mined, outpoint) {
                return Ok(detail);
            }

            let (sender, receiver) = oneshot::channel();
            state.spend_waiters.push(SpendWaiter { outpoint, sender });

            receiver
        };

        receiver.await.map_err(|_| anyhow!("notifier shut down"))
    }

    async fn block_epochs(&self) -> Result<BlockStream> {
        let (sender, receiver) = mpsc::unbounded();

        let mut state = self.inner.lock().unwrap();
        sender
            .unbounded_send(state.height)
            .map_err(|_| anyhow!("epoch subscriber gone"))?;
        state.epochs.push(sender);

        Ok(receiver.boxed())
    }
}
