//! The public surface: connect a wallet, inspect it, move funds through swaps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::balance::{BalanceReconciler, BalanceSnapshot};
use crate::chain::ChainClient;
use crate::chain::electrum::ElectrumChainClient;
use crate::chain::watcher::ChainWatcher;
use crate::config::Config;
use crate::error::{ConnectError, WalletError};
use crate::lightning::PaymentClient;
use crate::lightning::ldk::LdkPaymentClient;
use crate::liquid::keys::KeyVault;
use crate::liquid::wallet::{LiquidWallet, LwkOnchainWallet, OnchainWallet};
use crate::swap::Swap;
use crate::swap::engine::{CorruptSwap, StuckSwap, SwapEngine, SwapUpdate};
use crate::swap::store::SqliteSwapStore;
use crate::swapper::SwapProvider;
use crate::swapper::http::HttpSwapProvider;

pub struct ConnectRequest {
    pub config: Config,
    pub mnemonic: String,
}

/// External capabilities the wallet drives. [`Wallet::connect`] builds the
/// real adapters from the config; tests inject their own.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainClient>,
    pub wallet: Arc<dyn OnchainWallet>,
    pub payments: Arc<dyn PaymentClient>,
    pub provider: Arc<dyn SwapProvider>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetInfoRequest {
    /// Poll the chain before answering instead of using the last poll.
    pub with_scan: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetInfoResponse {
    pub pubkey: String,
    pub balance: BalanceSnapshot,
    pub tip_height: u32,
    pub stuck_swaps: Vec<StuckSwap>,
    pub corrupt_swaps: Vec<CorruptSwap>,
}

pub struct Wallet {
    config: Config,
    vault: Arc<KeyVault>,
    watcher: Arc<ChainWatcher>,
    engine: SwapEngine,
    balance: BalanceReconciler,
    pubkey: String,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Wallet {
    /// Connects with the Electrum, lwk, LDK Server and HTTP provider adapters
    /// described by `request.config`.
    pub async fn connect(request: ConnectRequest) -> Result<Self, ConnectError> {
        let vault = open_vault(&request)?;
        let config = &request.config;

        let chain = ElectrumChainClient::new(&config.electrum_url, config.electrum_tls)
            .map_err(|e| ConnectError::NetworkUnreachable(format!("{e:#}")))?;

        let mnemonic = request.mnemonic.clone();
        let network = config.network;
        let electrum_url = config.electrum_url.clone();
        let electrum_tls = config.electrum_tls;
        let wallet_dir = config.wallet_dir();
        let wallet = tokio::task::spawn_blocking(move || {
            LiquidWallet::new(&mnemonic, network, &electrum_url, electrum_tls, &wallet_dir)
        })
        .await
        .map_err(|e| ConnectError::NetworkUnreachable(format!("open liquid wallet: {e}")))?
        .map_err(|e| ConnectError::NetworkUnreachable(format!("{e:#}")))?;

        let (shutdown, _) = watch::channel(false);
        let payments = Arc::new(LdkPaymentClient::new(config.ldk_rest_addr.clone()));
        let poller = payments.spawn_poller(
            Duration::from_millis(config.payment_poll_interval_ms),
            shutdown.subscribe(),
        );

        let collaborators = Collaborators {
            chain: Arc::new(chain),
            wallet: Arc::new(LwkOnchainWallet::new(wallet)),
            payments,
            provider: Arc::new(HttpSwapProvider::new(config.swapper_url.clone())),
        };
        Self::assemble(request.config, vault, collaborators, shutdown, vec![poller]).await
    }

    /// Connects with injected capabilities.
    pub async fn connect_with(
        request: ConnectRequest,
        collaborators: Collaborators,
    ) -> Result<Self, ConnectError> {
        let vault = open_vault(&request)?;
        let (shutdown, _) = watch::channel(false);
        Self::assemble(request.config, vault, collaborators, shutdown, Vec::new()).await
    }

    async fn assemble(
        config: Config,
        vault: KeyVault,
        collaborators: Collaborators,
        shutdown: watch::Sender<bool>,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Result<Self, ConnectError> {
        let abort = |tasks: Vec<JoinHandle<()>>| tasks.into_iter().for_each(|t| t.abort());

        if let Err(err) = config.validate() {
            abort(tasks);
            return Err(err);
        }
        let vault = Arc::new(vault);
        let pubkey = match vault.identity_pubkey() {
            Ok(pubkey) => hex::encode(pubkey.serialize()),
            Err(err) => {
                abort(tasks);
                return Err(err.into());
            }
        };

        let store_path = config.store_path();
        let store = match tokio::task::spawn_blocking(move || SqliteSwapStore::open(store_path))
            .await
        {
            Ok(Ok(store)) => Arc::new(store),
            Ok(Err(err)) => {
                abort(tasks);
                return Err(ConnectError::StorageUnavailable(err));
            }
            Err(err) => {
                abort(tasks);
                return Err(ConnectError::Resume(format!("open store: {err}")));
            }
        };

        let watcher = Arc::new(ChainWatcher::new(
            collaborators.chain.clone(),
            collaborators.wallet.clone(),
        ));
        if let Err(err) = watcher.poll().await {
            abort(tasks);
            return Err(ConnectError::NetworkUnreachable(err.to_string()));
        }

        let engine = SwapEngine::new(
            config.clone(),
            vault.clone(),
            store,
            watcher.clone(),
            collaborators.wallet.clone(),
            collaborators.payments.clone(),
            collaborators.provider.clone(),
        );
        let resumed = match engine.start().await {
            Ok(resumed) => resumed,
            Err(err) => {
                engine.shutdown().await;
                abort(tasks);
                return Err(match err {
                    WalletError::Storage(err) => ConnectError::StorageUnavailable(err),
                    other => ConnectError::Resume(other.to_string()),
                });
            }
        };

        if let Some(interval) = config.chain_poll_interval() {
            tasks.push(watcher.spawn(interval, shutdown.subscribe()));
        }

        let balance = BalanceReconciler::new(
            config.network.policy_asset(),
            watcher.clone(),
            engine.clone(),
            collaborators.payments.clone(),
        );

        tracing::info!(
            network = ?config.network,
            %pubkey,
            tip = watcher.tip(),
            resumed,
            "wallet connected"
        );
        Ok(Self {
            config,
            vault,
            watcher,
            engine,
            balance,
            pubkey,
            shutdown,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn get_info(&self, request: GetInfoRequest) -> Result<GetInfoResponse, WalletError> {
        self.ensure_open()?;
        if request.with_scan {
            self.sync().await?;
        }
        Ok(GetInfoResponse {
            pubkey: self.pubkey.clone(),
            balance: self.balance.snapshot().await?,
            tip_height: self.watcher.tip(),
            stuck_swaps: self.engine.stuck_swaps(),
            corrupt_swaps: self.engine.corrupt_swaps(),
        })
    }

    /// Starts a swap that delivers `amount_sat` (minus the provider fee) on-chain.
    pub async fn receive_payment(&self, amount_sat: u64) -> Result<Swap, WalletError> {
        self.ensure_open()?;
        if amount_sat == 0 {
            return Err(WalletError::Other("amount must be positive".into()));
        }
        self.engine.create_receive_swap(amount_sat).await
    }

    /// Pays a BOLT11 invoice from on-chain funds.
    pub async fn send_payment(&self, invoice: &str) -> Result<Swap, WalletError> {
        self.ensure_open()?;
        self.engine.create_send_swap(invoice).await
    }

    pub async fn get_swap(&self, swap_id: &str) -> Result<Swap, WalletError> {
        self.engine.get_swap(swap_id).await
    }

    pub async fn list_swaps(&self) -> Result<Vec<Swap>, WalletError> {
        self.engine.list_swaps().await
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SwapUpdate> {
        self.engine.subscribe_updates()
    }

    /// Polls the chain once and returns the tip.
    pub async fn sync(&self) -> Result<u32, WalletError> {
        self.ensure_open()?;
        Ok(self.watcher.poll().await?)
    }

    /// Stops background loops and swap actors, then drops the seed.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        self.engine.shutdown().await;

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task list mutex poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
        self.vault.lock();
        tracing::info!("wallet disconnected");
    }

    fn ensure_open(&self) -> Result<(), WalletError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WalletError::Shutdown);
        }
        Ok(())
    }
}

fn open_vault(request: &ConnectRequest) -> Result<KeyVault, ConnectError> {
    KeyVault::from_mnemonic(&request.mnemonic, request.config.network)
        .map_err(|e| ConnectError::InvalidMnemonic(e.to_string()))
}
