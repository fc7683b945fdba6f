#![allow(dead_code)]

pub mod auction;
pub mod chain;
pub mod mailbox;
pub mod wallet;

pub use auction::{TestAuctioneer, TestFunding};
pub use chain::TestNotifier;
pub use mailbox::TestMailbox;
pub use wallet::TestWallet;

use njord::{account::watcher, AccountManager, Shutdown, ShutdownTrigger, Store};
use std::{sync::Arc, time::Duration};

pub type TestManager =
    AccountManager<Arc<TestWallet>, Arc<TestWallet>, Arc<TestAuctioneer>>;

/// One trader process: shared mocks, a store, a manager and a running
/// watcher task. Dropping the trader shuts the watcher down.
pub struct Trader {
    pub wallet: Arc<TestWallet>,
    pub auctioneer: Arc<TestAuctioneer>,
    pub notifier: Arc<TestNotifier>,
    pub store: Arc<Store>,
    pub manager: Arc<TestManager>,
    pub shutdown: Shutdown,
    trigger: ShutdownTrigger,
}

pub fn start_trader(best_height: u32) -> Trader {
    let _ = env_logger::builder().is_test(true).try_init();

    start_trader_with(
        Arc::new(TestWallet::new()),
        Arc::new(TestAuctioneer::new()),
        Arc::new(TestNotifier::new(best_height)),
        Arc::new(Store::open_temporary().expect("temporary store")),
    )
}

pub fn start_trader_with(
    wallet: Arc<TestWallet>,
    auctioneer: Arc<TestAuctioneer>,
    notifier: Arc<TestNotifier>,
    store: Arc<Store>,
) -> Trader {
    let (handle, registrations) = watcher::channel();

    let manager = Arc::new(AccountManager::new(
        wallet.clone(),
        wallet.clone(),
        auctioneer.clone(),
        store.clone(),
        handle,
    ));

    let (trigger, shutdown) = njord::shutdown();

    tokio::spawn({
        let notifier = notifier.clone();
        let manager = manager.clone();
        let shutdown = shutdown.clone();

        async move {
            if let Err(err) = watcher::run(notifier, manager, registrations, shutdown).await {
                log::error!("watcher stopped: {}", err);
            }
        }
    });

    Trader {
        wallet,
        auctioneer,
        notifier,
        store,
        manager,
        shutdown,
        trigger,
    }
}

impl Trader {
    /// Simulate a process restart: tear the watcher down and bring a fresh
    /// manager up over the same durable store and external services.
    pub fn restart(self) -> Trader {
        let Trader {
            wallet,
            auctioneer,
            notifier,
            store,
            trigger,
            ..
        } = self;

        trigger.trigger();

        start_trader_with(wallet, auctioneer, notifier, store)
    }
}

/// Poll until `condition` holds, failing the test after a couple of
/// seconds. Events travel through channels and background tasks, so tests
/// must tolerate scheduling delay.
pub async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }

        tokio::time::delay_for(Duration::from_millis(10)).await;
    }

    panic!("timed out waiting until {}", description);
}
