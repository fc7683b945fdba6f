//! Fans chain events out to the account manager.
//!
//! The watcher owns a single cooperative dispatch loop. Registrations arrive
//! over a command channel and are serialized by that loop; confirmation and
//! spend notifications are pending futures obtained from the chain notifier,
//! and expirations are tracked against the block epoch stream. When a
//! confirmation and an expiration are both due at the same height the
//! confirmation is always delivered first; the confirmation handler no-ops at
//! the expiry height so that the expiry handler drives the state change.

use crate::{
    traits::{ChainNotifier, SpendDetail, TxConfirmation},
    Error, Result, Shutdown,
};
use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Txid};
use futures::{
    channel::mpsc,
    future::{BoxFuture, FutureExt},
    select_biased,
    stream::FuturesUnordered,
    SinkExt, StreamExt,
};
use std::{fmt, sync::Arc};

/// Handlers invoked by the dispatch loop, supplied at construction.
#[async_trait]
pub trait AccountEvents {
    async fn on_confirmation(&self, trader_key: [u8; 33], conf: TxConfirmation) -> Result<()>;
    async fn on_spend(&self, trader_key: [u8; 33], spend: SpendDetail) -> Result<()>;
    async fn on_expiry(&self, trader_key: [u8; 33]) -> Result<()>;
}

#[derive(Clone, Debug)]
enum WatchCommand {
    Confirmation {
        trader_key: [u8; 33],
        txid: Txid,
        script: Script,
        num_confs: u32,
        height_hint: u32,
    },
    Spend {
        trader_key: [u8; 33],
        outpoint: OutPoint,
        script: Script,
        height_hint: u32,
    },
    Expiration {
        trader_key: [u8; 33],
        expiry: u32,
    },
}

/// Registration front-end of the watcher, cheap to clone.
#[derive(Clone)]
pub struct WatcherHandle {
    commands: mpsc::Sender<WatchCommand>,
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatcherHandle")
    }
}

impl WatcherHandle {
    /// Register a one-shot confirmation callback.
    pub async fn watch_conf(
        &self,
        trader_key: [u8; 33],
        txid: Txid,
        script: Script,
        num_confs: u32,
        height_hint: u32,
    ) -> Result<()> {
        self.send(WatchCommand::Confirmation {
            trader_key,
            txid,
            script,
            num_confs,
            height_hint,
        })
        .await
    }

    /// Register a one-shot spend callback.
    pub async fn watch_spend(
        &self,
        trader_key: [u8; 33],
        outpoint: OutPoint,
        script: Script,
        height_hint: u32,
    ) -> Result<()> {
        self.send(WatchCommand::Spend {
            trader_key,
            outpoint,
            script,
            height_hint,
        })
        .await
    }

    /// Fire `on_expiry` exactly once when the best-known tip reaches
    /// `expiry`.
    pub async fn watch_expiration(&self, trader_key: [u8; 33], expiry: u32) -> Result<()> {
        self.send(WatchCommand::Expiration { trader_key, expiry })
            .await
    }

    async fn send(&self, command: WatchCommand) -> Result<()> {
        self.commands
            .clone()
            .send(command)
            .await
            .map_err(|_| Error::Fatal("chain watcher is gone".to_string()))
    }
}

/// Everything `run` needs besides the notifier and the handlers.
#[derive(Debug)]
pub struct Registrations {
    commands: mpsc::Receiver<WatchCommand>,
}

/// Create the registration handle and its loop-side receiver.
pub fn channel() -> (WatcherHandle, Registrations) {
    let (tx, rx) = mpsc::channel(16);

    (
        WatcherHandle { commands: tx },
        Registrations { commands: rx },
    )
}

enum ChainEvent {
    Confirmed {
        trader_key: [u8; 33],
        conf: TxConfirmation,
    },
    Spent {
        trader_key: [u8; 33],
        spend: SpendDetail,
    },
}

/// Drive the dispatch loop until shutdown, all registration handles are
/// dropped, or a handler reports a fatal error.
pub async fn run<C, H>(
    notifier: Arc<C>,
    handlers: Arc<H>,
    registrations: Registrations,
    shutdown: Shutdown,
) -> Result<()>
where
    C: ChainNotifier + Send + Sync + 'static,
    H: AccountEvents + Send + Sync,
{
    let mut commands = registrations.commands;
    let mut pending: FuturesUnordered<BoxFuture<'static, anyhow::Result<ChainEvent>>> =
        FuturesUnordered::new();
    let mut expirations: Vec<([u8; 33], u32)> = Vec::new();
    let mut best_height = 0u32;

    let mut blocks = notifier
        .block_epochs()
        .await
        .map_err(Error::transient)?
        .fuse();
    let mut shutdown = shutdown;

    loop {
        select_biased! {
            event = pending.select_next_some() => match event {
                Ok(ChainEvent::Confirmed { trader_key, conf }) => {
                    handlers.on_confirmation(trader_key, conf).await?;
                }
                Ok(ChainEvent::Spent { trader_key, spend }) => {
                    handlers.on_spend(trader_key, spend).await?;
                }
                Err(err) => {
                    log::warn!("chain notification failed: {:#}", err);
                }
            },
            height = blocks.next() => {
                let height = match height {
                    Some(height) => height,
                    None => {
                        return Err(Error::Transient(anyhow::anyhow!(
                            "block epoch stream ended"
                        )))
                    }
                };
                best_height = height;

                let mut due = Vec::new();
                expirations.retain(|(trader_key, expiry)| {
                    if *expiry <= height {
                        due.push(*trader_key);
                        false
                    } else {
                        true
                    }
                });

                for trader_key in due {
                    handlers.on_expiry(trader_key).await?;
                }
            },
            command = commands.next() => {
                let command = match command {
                    Some(command) => command,
                    None => break,
                };

                register(&notifier, command, &mut pending, &mut expirations, best_height, &*handlers).await?;
            },
            _ = shutdown => break,
        }
    }

    Ok(())
}

async fn register<C, H>(
    notifier: &Arc<C>,
    command: WatchCommand,
    pending: &mut FuturesUnordered<BoxFuture<'static, anyhow::Result<ChainEvent>>>,
    expirations: &mut Vec<([u8; 33], u32)>,
    best_height: u32,
    handlers: &H,
) -> Result<()>
where
    C: ChainNotifier + Send + Sync + 'static,
    H: AccountEvents + Send + Sync,
{
    match command {
        WatchCommand::Confirmation {
            trader_key,
            txid,
            script,
            num_confs,
            height_hint,
        } => {
            let notifier = notifier.clone();
            pending.push(
                async move {
                    let conf = notifier
                        .wait_for_confirmation(txid, script, num_confs, height_hint)
                        .await
                        .context("confirmation watch failed")?;

                    Ok(ChainEvent::Confirmed { trader_key, conf })
                }
                .boxed(),
            );
        }
        WatchCommand::Spend {
            trader_key,
            outpoint,
            script,
            height_hint,
        } => {
            let notifier = notifier.clone();
            pending.push(
                async move {
                    let spend = notifier
                        .wait_for_spend(outpoint, script, height_hint)
                        .await
                        .context("spend watch failed")?;

                    Ok(ChainEvent::Spent { trader_key, spend })
                }
                .boxed(),
            );
        }
        WatchCommand::Expiration { trader_key, expiry } => {
            // A registration at or past the expiry height fires right away.
            if best_height >= expiry {
                handlers.on_expiry(trader_key).await?;
            } else {
                expirations.push((trader_key, expiry));
            }
        }
    }

    Ok(())
}
