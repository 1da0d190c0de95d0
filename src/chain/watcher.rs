use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lwk_wollet::elements::{OutPoint, Script, Transaction, Txid};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use super::{ChainClient, HistoryEntry, Utxo, UtxoEvent, confirmations};
use crate::error::ChainError;
use crate::liquid::wallet::OnchainWallet;

/// Events for one watched script. Ends when the watcher is dropped; a dropped
/// stream is not resumed, the caller subscribes again.
pub struct UtxoEventStream {
    rx: mpsc::UnboundedReceiver<UtxoEvent>,
}

impl UtxoEventStream {
    pub async fn next(&mut self) -> Option<UtxoEvent> {
        self.rx.recv().await
    }
}

struct Tracked {
    utxo: Utxo,
    reported_depth: u32,
    spent: bool,
}

struct Subscription {
    script: Script,
    tx: mpsc::UnboundedSender<UtxoEvent>,
    seen_txs: HashSet<Txid>,
    outputs: BTreeMap<OutPoint, Tracked>,
    /// Events scanned but not yet delivered.
    backlog: Vec<UtxoEvent>,
}

pub struct ChainWatcher {
    chain: Arc<dyn ChainClient>,
    wallet: Arc<dyn OnchainWallet>,
    tip: watch::Sender<u32>,
    subscriptions: Mutex<Vec<Subscription>>,
    wallet_utxos: RwLock<Vec<Utxo>>,
}

impl ChainWatcher {
    pub fn new(chain: Arc<dyn ChainClient>, wallet: Arc<dyn OnchainWallet>) -> Self {
        let (tip, _) = watch::channel(0);
        Self {
            chain,
            wallet,
            tip,
            subscriptions: Mutex::new(Vec::new()),
            wallet_utxos: RwLock::new(Vec::new()),
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    /// Watches `script`. Nothing is fetched until the next [`ChainWatcher::poll`].
    pub async fn subscribe(&self, script: Script) -> UtxoEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().await.push(Subscription {
            script,
            tx,
            seen_txs: HashSet::new(),
            outputs: BTreeMap::new(),
            backlog: Vec::new(),
        });
        UtxoEventStream { rx }
    }

    pub fn subscribe_tip(&self) -> watch::Receiver<u32> {
        self.tip.subscribe()
    }

    /// Last polled tip height; `0` before the first poll.
    pub fn tip(&self) -> u32 {
        *self.tip.borrow()
    }

    pub fn wallet_utxos(&self) -> Vec<Utxo> {
        self.wallet_utxos
            .read()
            .expect("utxo cache lock poisoned")
            .clone()
    }

    /// Refreshes tip, subscriptions and wallet UTXOs, then delivers events.
    ///
    /// The wallet is synced after the script histories are read, so once an
    /// event reports a spend the wallet cache already contains its outputs.
    /// The new tip is published before the events go out. A script whose scan
    /// fails is retried on the next poll without holding back the others;
    /// events stay queued until a poll gets through the wallet sync.
    pub async fn poll(&self) -> Result<u32, ChainError> {
        let mut subscriptions = self.subscriptions.lock().await;

        let tip = self.chain.tip_height().await?;

        let mut failed = None;
        for sub in subscriptions.iter_mut() {
            if let Err(err) = self.scan(sub, tip).await {
                tracing::warn!(error = %err, "script scan failed");
                failed.get_or_insert(err);
            }
        }

        self.wallet
            .sync()
            .await
            .map_err(|e| ChainError::Backend(format!("sync wallet: {e:#}")))?;
        let utxos = self
            .wallet
            .utxos()
            .await
            .map_err(|e| ChainError::Backend(format!("list wallet utxos: {e:#}")))?;
        *self.wallet_utxos.write().expect("utxo cache lock poisoned") =
            utxos.into_iter().map(|u| u.with_tip(tip)).collect();
        self.tip.send_replace(tip);

        for sub in subscriptions.iter_mut() {
            for event in sub.backlog.drain(..) {
                // The receiver is gone; the subscription is pruned below.
                let _ = sub.tx.send(event);
            }
        }
        subscriptions.retain(|sub| !sub.tx.is_closed());
        drop(subscriptions);

        if let Some(err) = failed {
            return Err(err);
        }
        tracing::debug!(tip, "chain poll complete");
        Ok(tip)
    }

    /// Fetches everything new for `sub` before touching its state, so a
    /// failed fetch leaves the subscription as it was.
    async fn scan(&self, sub: &mut Subscription, tip: u32) -> Result<(), ChainError> {
        let mut history = self.chain.script_history(&sub.script).await?;
        sort_history(&mut history);

        let mut fresh = Vec::new();
        for entry in history.iter().filter(|h| !sub.seen_txs.contains(&h.txid)) {
            let tx = self.chain.get_transaction(&entry.txid).await?;
            fresh.push((entry.txid, tx, entry.height));
        }

        // Mempool heights do not order a spend after its funding, so outputs
        // are registered before any input is matched.
        for (_, tx, height) in &fresh {
            register_outputs(sub, tx, *height, tip);
        }
        for (txid, tx, height) in fresh {
            match_inputs(sub, &tx, height);
            sub.seen_txs.insert(txid);
        }

        let heights: HashMap<Txid, Option<u32>> =
            history.iter().map(|h| (h.txid, h.height)).collect();
        for tracked in sub.outputs.values_mut().filter(|t| !t.spent) {
            let height = heights.get(&tracked.utxo.outpoint.txid).copied().flatten();
            tracked.utxo.height = height;
            tracked.utxo.confirmations = confirmations(height, tip);

            let depth = tracked.utxo.confirmations;
            if depth > tracked.reported_depth {
                tracked.reported_depth = depth;
                sub.backlog.push(UtxoEvent::Confirmed {
                    utxo: tracked.utxo.clone(),
                    depth,
                });
            } else if depth < tracked.reported_depth {
                tracing::warn!(
                    outpoint = %tracked.utxo.outpoint,
                    was = tracked.reported_depth,
                    now = depth,
                    "watched output lost confirmations"
                );
                tracked.reported_depth = depth;
            }
        }

        Ok(())
    }

    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = watcher.poll().await {
                    tracing::warn!(error = %err, "chain poll failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::debug!("chain watcher stopped");
        })
    }
}

/// Confirmed entries by height, mempool entries last; stable within a block.
fn sort_history(history: &mut [HistoryEntry]) {
    history.sort_by_key(|h| h.height.unwrap_or(u32::MAX));
}

fn match_inputs(sub: &mut Subscription, tx: &Transaction, height: Option<u32>) {
    for input in &tx.input {
        let Some(tracked) = sub.outputs.get_mut(&input.previous_output) else {
            continue;
        };
        if tracked.spent {
            continue;
        }
        tracked.spent = true;
        sub.backlog.push(UtxoEvent::Spent {
            utxo: tracked.utxo.clone(),
            spending_tx: tx.clone(),
            height,
        });
    }
}

fn register_outputs(sub: &mut Subscription, tx: &Transaction, height: Option<u32>, tip: u32) {
    let txid = tx.txid();
    for (vout, output) in tx.output.iter().enumerate() {
        if output.script_pubkey != sub.script {
            continue;
        }
        let (Some(amount_sat), Some(asset)) = (output.value.explicit(), output.asset.explicit())
        else {
            tracing::warn!(%txid, vout, "ignoring confidential output on watched script");
            continue;
        };
        let outpoint = OutPoint {
            txid,
            vout: vout as u32,
        };
        if sub.outputs.contains_key(&outpoint) {
            continue;
        }
        let utxo = Utxo {
            outpoint,
            amount_sat,
            asset,
            script_pubkey: output.script_pubkey.clone(),
            height,
            confirmations: 0,
        }
        .with_tip(tip);
        sub.outputs.insert(
            outpoint,
            Tracked {
                utxo: utxo.clone(),
                reported_depth: 0,
                spent: false,
            },
        );
        sub.backlog.push(UtxoEvent::Appeared(utxo));
    }
}
