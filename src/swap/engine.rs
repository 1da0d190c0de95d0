use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use lwk_wollet::elements::bitcoin::secp256k1::PublicKey;
use lwk_wollet::elements::{Address, AssetId, Script, Transaction, Txid};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::retry::{RetryPolicy, retry_with_backoff};
use super::store::SqliteSwapStore;
use super::{
    PreimageSource, Swap, SwapDirection, SwapState, SwapTerms, Transition, encode_tx, swap_id_for,
};
use crate::chain::watcher::{ChainWatcher, UtxoEventStream};
use crate::chain::{Utxo, UtxoEvent};
use crate::config::{Config, Network};
use crate::error::{StorageError, SwapProtocolError, WalletError};
use crate::lightning::{OutboundStatus, PaymentClient};
use crate::lightning::invoice::decode_bolt11;
use crate::liquid::htlc::{self, HtlcFunding, HtlcSpec, sha256_preimage};
use crate::liquid::keys::{DerivedKey, KeyVault};
use crate::liquid::wallet::OnchainWallet;
use crate::swapper::{
    CooperativeRefundRequest, ReverseSwapRequest, ReverseSwapResponse, SubmarineSwapRequest,
    SubmarineSwapResponse, SwapProvider,
};

/// Broadcast to every `subscribe_updates` receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwapUpdate {
    StateChanged {
        swap_id: String,
        state: SwapState,
    },
    Stuck {
        swap_id: String,
        state: SwapState,
        attempts: u32,
        reason: String,
    },
}

/// A swap whose last broadcast ran out of retries. It is retried on the next block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckSwap {
    pub swap_id: String,
    pub state: SwapState,
    pub attempts: u32,
    pub reason: String,
}

impl From<StuckSwap> for WalletError {
    fn from(stuck: StuckSwap) -> Self {
        WalletError::SwapStuck {
            swap_id: stuck.swap_id,
            state: stuck.state,
            attempts: stuck.attempts,
            reason: stuck.reason,
        }
    }
}

/// A swap whose persisted log could not be replayed. It is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptSwap {
    pub swap_id: String,
    pub reason: String,
}

#[derive(Debug)]
enum SwapEvent {
    Tip(u32),
    Preimage {
        preimage: [u8; 32],
        source: PreimageSource,
    },
}

#[derive(Debug, Clone, Copy)]
enum Broadcast {
    Lockup,
    Claim,
    Refund,
}

impl Broadcast {
    fn label(self) -> &'static str {
        match self {
            Broadcast::Lockup => "broadcast lockup",
            Broadcast::Claim => "broadcast claim",
            Broadcast::Refund => "broadcast refund",
        }
    }
}

struct Inner {
    config: Config,
    policy_asset: AssetId,
    vault: Arc<KeyVault>,
    store: Arc<SqliteSwapStore>,
    watcher: Arc<ChainWatcher>,
    wallet: Arc<dyn OnchainWallet>,
    payments: Arc<dyn PaymentClient>,
    provider: Arc<dyn SwapProvider>,

    actors: Mutex<HashMap<String, mpsc::UnboundedSender<SwapEvent>>>,
    hashes: Mutex<HashMap<[u8; 32], String>>,
    stuck: Mutex<HashMap<String, StuckSwap>>,
    corrupt: Mutex<HashMap<String, String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    updates: broadcast::Sender<SwapUpdate>,
    shutdown: watch::Sender<bool>,
    create_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SwapEngine {
    inner: Arc<Inner>,
}

impl SwapEngine {
    pub fn new(
        config: Config,
        vault: Arc<KeyVault>,
        store: Arc<SqliteSwapStore>,
        watcher: Arc<ChainWatcher>,
        wallet: Arc<dyn OnchainWallet>,
        payments: Arc<dyn PaymentClient>,
        provider: Arc<dyn SwapProvider>,
    ) -> Self {
        let (updates, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                policy_asset: config.network.policy_asset(),
                config,
                vault,
                store,
                watcher,
                wallet,
                payments,
                provider,
                actors: Mutex::new(HashMap::new()),
                hashes: Mutex::new(HashMap::new()),
                stuck: Mutex::new(HashMap::new()),
                corrupt: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                updates,
                shutdown,
                create_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Starts the event routers and resumes every active swap. Returns the
    /// number of swaps resumed; corrupt ones are recorded and skipped.
    pub async fn start(&self) -> Result<usize, WalletError> {
        let settled = self.inner.payments.subscribe_settled();
        self.inner.track(spawn_payment_router(
            self.inner.clone(),
            settled,
            self.inner.shutdown.subscribe(),
        ));
        self.inner.track(spawn_tip_router(
            self.inner.clone(),
            self.inner.watcher.subscribe_tip(),
            self.inner.shutdown.subscribe(),
        ));

        let active = blocking(&self.inner.store, |store| store.list_active()).await?;
        let mut resumed = 0;
        for (swap_id, loaded) in active {
            match loaded {
                Ok(swap) => {
                    tracing::info!(swap_id = %swap.id, state = ?swap.state, "resuming swap");
                    match self.spawn_actor(swap).await {
                        Ok(()) => resumed += 1,
                        Err(err) => self.inner.mark_corrupt(&swap_id, err.to_string()),
                    }
                }
                Err(err) => self.inner.mark_corrupt(&swap_id, err.to_string()),
            }
        }
        Ok(resumed)
    }

    pub async fn create_receive_swap(&self, amount_sat: u64) -> Result<Swap, WalletError> {
        let inner = &self.inner;
        let _guard = inner.create_lock.lock().await;

        let key_index = blocking(&inner.store, |store| store.swap_count()).await?;
        let claim_key = inner.vault.swap_key(key_index)?;
        let request = ReverseSwapRequest::lightning_to_liquid(
            amount_sat,
            hex::encode(claim_key.public_key().serialize()),
        );
        let response = inner.provider.create_reverse_swap(&request).await?;
        let tip = inner.current_tip().await?;

        let terms = verify_reverse_swap(
            &inner.config,
            amount_sat,
            key_index,
            &claim_key,
            &response,
            tip,
        )?;
        let swap = self.persist_new(terms).await?;
        self.spawn_actor(swap.clone()).await?;
        Ok(swap)
    }

    pub async fn create_send_swap(&self, invoice: &str) -> Result<Swap, WalletError> {
        let inner = &self.inner;
        let invoice_terms = decode_bolt11(invoice, inner.config.network)?;
        let payment_hash = hex::encode(invoice_terms.payment_hash);

        let _guard = inner.create_lock.lock().await;
        let lookup = payment_hash.clone();
        if let Some(existing) =
            blocking(&inner.store, move |store| store.active_swap_for_hash(&lookup)).await?
        {
            return Err(StorageError::DuplicateSwap {
                payment_hash,
                existing,
            }
            .into());
        }

        let key_index = blocking(&inner.store, |store| store.swap_count()).await?;
        let refund_key = inner.vault.swap_key(key_index)?;
        let request = SubmarineSwapRequest::liquid_to_lightning(
            invoice.trim().to_string(),
            hex::encode(refund_key.public_key().serialize()),
        );
        let response = inner.provider.create_submarine_swap(&request).await?;
        let tip = inner.current_tip().await?;

        let terms = verify_submarine_swap(
            &inner.config,
            invoice.trim(),
            invoice_terms.payment_hash,
            invoice_terms.amount_sat,
            key_index,
            &refund_key,
            &response,
            tip,
        )?;
        let swap = self.persist_new(terms).await?;

        let mut actor = self.new_actor(swap).await?;
        let locked = actor.lock_funds().await;
        let snapshot = actor.swap.clone();
        if snapshot.is_terminal() {
            self.inner.forget(&snapshot);
            let reason = snapshot
                .failure_reason
                .clone()
                .unwrap_or_else(|| "lockup failed".to_string());
            let err = locked.err().unwrap_or(WalletError::Other(reason));
            return Err(err.for_swap(&snapshot.id, snapshot.state));
        }
        locked.map_err(|e| e.for_swap(&snapshot.id, snapshot.state))?;
        self.run_actor(actor);
        Ok(snapshot)
    }

    /// Delivers a preimage learned out of band. Duplicates are ignored.
    pub fn submit_preimage(
        &self,
        payment_hash: [u8; 32],
        preimage: [u8; 32],
    ) -> Result<(), WalletError> {
        let actual = sha256_preimage(&preimage);
        if actual != payment_hash {
            return Err(SwapProtocolError::HashMismatch {
                expected: hex::encode(payment_hash),
                actual: hex::encode(actual),
            }
            .into());
        }
        if self
            .inner
            .route_preimage(payment_hash, preimage, PreimageSource::PaymentClient)
        {
            Ok(())
        } else {
            Err(WalletError::SwapNotFound(hex::encode(payment_hash)))
        }
    }

    pub async fn get_swap(&self, swap_id: &str) -> Result<Swap, WalletError> {
        let id = swap_id.to_string();
        match blocking(&self.inner.store, move |store| store.load(&id)).await {
            Err(WalletError::Storage(StorageError::NotFound(id))) => {
                Err(WalletError::SwapNotFound(id))
            }
            other => other,
        }
    }

    pub async fn list_swaps(&self) -> Result<Vec<Swap>, WalletError> {
        let all = blocking(&self.inner.store, |store| store.list_all()).await?;
        Ok(self.inner.keep_loaded(all))
    }

    pub async fn active_swaps(&self) -> Result<Vec<Swap>, WalletError> {
        let active = blocking(&self.inner.store, |store| store.list_active()).await?;
        Ok(self.inner.keep_loaded(active))
    }

    pub fn stuck_swaps(&self) -> Vec<StuckSwap> {
        let stuck = self.inner.stuck.lock().expect("stuck mutex poisoned");
        let mut out: Vec<_> = stuck.values().cloned().collect();
        out.sort_by(|a, b| a.swap_id.cmp(&b.swap_id));
        out
    }

    pub fn corrupt_swaps(&self) -> Vec<CorruptSwap> {
        let corrupt = self.inner.corrupt.lock().expect("corrupt mutex poisoned");
        let mut out: Vec<_> = corrupt
            .iter()
            .map(|(swap_id, reason)| CorruptSwap {
                swap_id: swap_id.clone(),
                reason: reason.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.swap_id.cmp(&b.swap_id));
        out
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SwapUpdate> {
        self.inner.updates.subscribe()
    }

    /// Stops routers and actors. An actor finishes the transition it is in
    /// before it sees the signal.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .expect("task list mutex poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "swap task ended abnormally");
            }
        }
    }

    async fn persist_new(&self, terms: SwapTerms) -> Result<Swap, WalletError> {
        let payment_hash = terms.payment_hash_bytes()?;
        let id = swap_id_for(terms.direction, &payment_hash, terms.timeout_height);
        let swap = Swap::from_created(id, terms);

        let record = swap.clone();
        blocking(&self.inner.store, move |store| store.create(&record)).await?;
        tracing::info!(
            swap_id = %swap.id,
            direction = swap.terms.direction.as_str(),
            amount_sat = swap.terms.amount_sat,
            timeout_height = swap.terms.timeout_height,
            "swap created"
        );
        let _ = self.inner.updates.send(SwapUpdate::StateChanged {
            swap_id: swap.id.clone(),
            state: swap.state,
        });
        Ok(swap)
    }

    async fn new_actor(&self, swap: Swap) -> Result<SwapActor, WalletError> {
        let htlc = swap.terms.htlc()?;
        let payment_hash = swap.terms.payment_hash_bytes()?;
        let script_pubkey = htlc.script_pubkey();
        let utxos = self.inner.watcher.subscribe(script_pubkey.clone()).await;

        let (tx, events) = mpsc::unbounded_channel();
        self.inner
            .actors
            .lock()
            .expect("actor registry mutex poisoned")
            .insert(swap.id.clone(), tx);
        self.inner
            .hashes
            .lock()
            .expect("hash registry mutex poisoned")
            .insert(payment_hash, swap.id.clone());

        Ok(SwapActor {
            inner: self.inner.clone(),
            tip: self.inner.watcher.tip(),
            swap,
            htlc,
            payment_hash,
            script_pubkey,
            events,
            utxos,
            early_preimage: None,
            payment_requested: false,
            output_seen: false,
            output_spent: false,
            last_broadcast_tip: None,
        })
    }

    fn run_actor(&self, actor: SwapActor) {
        let shutdown = self.inner.shutdown.subscribe();
        self.inner.track(tokio::spawn(actor.run(shutdown)));
    }

    async fn spawn_actor(&self, swap: Swap) -> Result<(), WalletError> {
        let actor = self.new_actor(swap).await?;
        self.run_actor(actor);
        Ok(())
    }
}

impl Inner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task list mutex poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn current_tip(&self) -> Result<u32, WalletError> {
        match self.watcher.tip() {
            0 => Ok(self.watcher.chain().tip_height().await?),
            tip => Ok(tip),
        }
    }

    fn route_preimage(&self, payment_hash: [u8; 32], preimage: [u8; 32], source: PreimageSource) -> bool {
        let Some(swap_id) = self
            .hashes
            .lock()
            .expect("hash registry mutex poisoned")
            .get(&payment_hash)
            .cloned()
        else {
            return false;
        };
        self.send_to(&swap_id, SwapEvent::Preimage { preimage, source })
    }

    fn send_to(&self, swap_id: &str, event: SwapEvent) -> bool {
        let actors = self.actors.lock().expect("actor registry mutex poisoned");
        actors
            .get(swap_id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    fn broadcast_tip(&self, tip: u32) {
        let actors = self.actors.lock().expect("actor registry mutex poisoned");
        for tx in actors.values() {
            let _ = tx.send(SwapEvent::Tip(tip));
        }
    }

    fn forget(&self, swap: &Swap) {
        self.actors
            .lock()
            .expect("actor registry mutex poisoned")
            .remove(&swap.id);
        if let Ok(hash) = swap.terms.payment_hash_bytes() {
            let mut hashes = self.hashes.lock().expect("hash registry mutex poisoned");
            if hashes.get(&hash) == Some(&swap.id) {
                hashes.remove(&hash);
            }
        }
        if swap.is_terminal() {
            self.stuck.lock().expect("stuck mutex poisoned").remove(&swap.id);
        }
    }

    fn mark_stuck(&self, stuck: StuckSwap) {
        let err = WalletError::from(stuck.clone());
        tracing::error!(swap_id = %stuck.swap_id, state = ?stuck.state, error = %err, "swap stuck");
        let _ = self.updates.send(SwapUpdate::Stuck {
            swap_id: stuck.swap_id.clone(),
            state: stuck.state,
            attempts: stuck.attempts,
            reason: stuck.reason.clone(),
        });
        self.stuck
            .lock()
            .expect("stuck mutex poisoned")
            .insert(stuck.swap_id.clone(), stuck);
    }

    fn clear_stuck(&self, swap_id: &str) {
        self.stuck.lock().expect("stuck mutex poisoned").remove(swap_id);
    }

    fn mark_corrupt(&self, swap_id: &str, reason: String) {
        tracing::error!(swap_id, %reason, "swap log cannot be replayed; skipping swap");
        self.corrupt
            .lock()
            .expect("corrupt mutex poisoned")
            .insert(swap_id.to_string(), reason);
    }

    fn keep_loaded(&self, loaded: Vec<(String, Result<Swap, StorageError>)>) -> Vec<Swap> {
        loaded
            .into_iter()
            .filter_map(|(swap_id, swap)| match swap {
                Ok(swap) => Some(swap),
                Err(err) => {
                    self.mark_corrupt(&swap_id, err.to_string());
                    None
                }
            })
            .collect()
    }
}

fn spawn_payment_router(
    inner: Arc<Inner>,
    mut settled: broadcast::Receiver<crate::lightning::PaymentSettled>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                msg = settled.recv() => match msg {
                    Ok(payment) => {
                        inner.route_preimage(
                            payment.payment_hash,
                            payment.preimage,
                            PreimageSource::PaymentClient,
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Actors fall back to `payment_status` on the next block.
                        tracing::warn!(skipped, "payment callbacks dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn spawn_tip_router(
    inner: Arc<Inner>,
    mut tips: watch::Receiver<u32>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = tips.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tip = *tips.borrow_and_update();
                    inner.broadcast_tip(tip);
                }
            }
        }
    })
}

async fn blocking<T, F>(store: &Arc<SqliteSwapStore>, f: F) -> Result<T, WalletError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteSwapStore) -> Result<T, StorageError> + Send + 'static,
{
    let store = store.clone();
    Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
}

struct SwapActor {
    inner: Arc<Inner>,
    swap: Swap,
    htlc: HtlcSpec,
    payment_hash: [u8; 32],
    script_pubkey: Script,
    events: mpsc::UnboundedReceiver<SwapEvent>,
    utxos: UtxoEventStream,
    tip: u32,
    /// Preimage that arrived before the funding did. Not persisted: the
    /// payment client reports it again on lookup.
    early_preimage: Option<[u8; 32]>,
    payment_requested: bool,
    output_seen: bool,
    output_spent: bool,
    last_broadcast_tip: Option<u32>,
}

impl SwapActor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let resumed = self.resume().await;
        self.report(resumed).await;
        if !self.swap.is_terminal() && self.current_tip() > 0 {
            let tip = self.tip;
            let handled = self.on_tip(tip).await;
            self.report(handled).await;
        }

        while !self.swap.is_terminal() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = self.utxos.next() => {
                    let handled = self.on_utxo(event).await;
                    self.report(handled).await;
                }
                Some(event) = self.events.recv() => {
                    let handled = match event {
                        SwapEvent::Tip(tip) => self.on_tip(tip).await,
                        SwapEvent::Preimage { preimage, source } => {
                            self.on_preimage(preimage, source).await
                        }
                    };
                    self.report(handled).await;
                }
                else => break,
            }
        }

        tracing::debug!(swap_id = %self.swap.id, state = ?self.swap.state, "swap actor stopped");
        self.inner.forget(&self.swap);
    }

    async fn report(&mut self, result: Result<(), WalletError>) {
        let Err(err) = result else {
            return;
        };
        if let WalletError::Storage(StorageError::Conflict { .. }) = err {
            let id = self.swap.id.clone();
            match blocking(&self.inner.store, move |store| store.load(&id)).await {
                Ok(swap) => self.swap = swap,
                Err(err) => self.inner.mark_corrupt(&self.swap.id, err.to_string()),
            }
            return;
        }
        let err = err.for_swap(&self.swap.id, self.swap.state);
        tracing::warn!(error = %err, "swap step failed");
    }

    fn current_tip(&mut self) -> u32 {
        self.tip = self.tip.max(self.inner.watcher.tip());
        self.tip
    }

    fn timeout(&self) -> u32 {
        self.swap.terms.timeout_height
    }

    /// Appends `transition` to the log, then makes it the in-memory state.
    async fn commit(&mut self, transition: Transition) -> Result<(), WalletError> {
        let mut next = self.swap.clone();
        next.apply(&transition)
            .map_err(|e| WalletError::Other(e.to_string()))?;

        let id = self.swap.id.clone();
        let expected_len = self.swap.log_len;
        blocking(&self.inner.store, move |store| {
            store.append(&id, expected_len, &transition)
        })
        .await?;

        self.swap = next;
        tracing::info!(swap_id = %self.swap.id, state = ?self.swap.state, "swap transition");
        let _ = self.inner.updates.send(SwapUpdate::StateChanged {
            swap_id: self.swap.id.clone(),
            state: self.swap.state,
        });
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), WalletError> {
        use SwapDirection as D;
        use SwapState as S;

        match (self.swap.direction(), self.swap.state) {
            (D::Receive, S::FundingDetected) => self.request_payment().await,
            (D::Receive, S::PreimageKnown) => self.claim().await,
            (D::Receive, S::Claiming) => self.broadcast_unless_known(Broadcast::Claim).await,
            (D::Send, S::Created) => self.lock_funds().await,
            (D::Send, S::LockedByUs) => self.broadcast_unless_known(Broadcast::Lockup).await,
            (D::Send, S::Refunding) => self.broadcast_unless_known(Broadcast::Refund).await,
            _ => Ok(()),
        }
    }

    async fn on_tip(&mut self, tip: u32) -> Result<(), WalletError> {
        use SwapDirection as D;
        use SwapState as S;

        self.tip = self.tip.max(tip);
        let tip = self.tip;
        let fresh_block = self.last_broadcast_tip.is_none_or(|last| tip > last);

        match (self.swap.direction(), self.swap.state) {
            (D::Receive, S::Created) if tip >= self.timeout() => {
                tracing::info!(swap_id = %self.swap.id, tip, "swap timed out before funding");
                self.commit(Transition::Refunded { txid: None }).await
            }
            (D::Receive, S::FundingDetected) => {
                let status = self.payment_status().await;
                if let Some(OutboundStatus::Succeeded { preimage }) = status {
                    return self.on_preimage(preimage, PreimageSource::PaymentClient).await;
                }
                if tip >= self.timeout() {
                    // The claim branch has no locktime; a late preimage still claims.
                    if matches!(status, None | Some(OutboundStatus::Pending)) {
                        tracing::debug!(swap_id = %self.swap.id, tip, "payment unresolved past timeout");
                        return Ok(());
                    }
                    tracing::info!(swap_id = %self.swap.id, tip, "no preimage before timeout");
                    return self.commit(Transition::Refunded { txid: None }).await;
                }
                if !self.payment_requested {
                    return self.request_payment().await;
                }
                Ok(())
            }
            (D::Receive, S::PreimageKnown) => self.claim().await,
            (D::Receive, S::Claiming) if !self.output_spent && tip < self.timeout() && fresh_block => {
                self.broadcast(Broadcast::Claim).await
            }
            (D::Send, S::LockedByUs) if tip >= self.timeout() && !self.output_spent => {
                self.refund().await
            }
            (D::Send, S::LockedByUs) if !self.output_seen && fresh_block => {
                self.broadcast(Broadcast::Lockup).await
            }
            (D::Send, S::Refunding) if !self.output_spent && fresh_block => {
                self.broadcast(Broadcast::Refund).await
            }
            _ => Ok(()),
        }
    }

    async fn on_preimage(
        &mut self,
        preimage: [u8; 32],
        source: PreimageSource,
    ) -> Result<(), WalletError> {
        if sha256_preimage(&preimage) != self.payment_hash {
            tracing::warn!(swap_id = %self.swap.id, "ignoring preimage for another hash");
            return Ok(());
        }

        match (self.swap.direction(), self.swap.state) {
            (SwapDirection::Receive, SwapState::Created) => {
                tracing::debug!(swap_id = %self.swap.id, "preimage arrived before funding");
                self.early_preimage = Some(preimage);
                Ok(())
            }
            (SwapDirection::Receive, SwapState::FundingDetected) => {
                self.commit(Transition::PreimageKnown {
                    preimage: hex::encode(preimage),
                    source,
                })
                .await?;
                self.claim().await
            }
            _ => {
                tracing::debug!(swap_id = %self.swap.id, state = ?self.swap.state, "duplicate preimage ignored");
                Ok(())
            }
        }
    }

    async fn on_utxo(&mut self, event: UtxoEvent) -> Result<(), WalletError> {
        match event {
            UtxoEvent::Appeared(utxo) | UtxoEvent::Confirmed { utxo, .. } => {
                self.on_output(utxo).await
            }
            UtxoEvent::Spent {
                utxo, spending_tx, ..
            } => self.on_spent(utxo, spending_tx).await,
        }
    }

    async fn on_output(&mut self, utxo: Utxo) -> Result<(), WalletError> {
        if utxo.asset != self.inner.policy_asset {
            tracing::warn!(swap_id = %self.swap.id, outpoint = %utxo.outpoint, "ignoring non-L-BTC output on swap script");
            return Ok(());
        }

        if self.is_funding(&utxo) {
            self.output_seen = true;
        }

        if self.swap.direction() != SwapDirection::Receive || self.swap.state != SwapState::Created
        {
            return Ok(());
        }
        if self.current_tip() >= self.timeout() {
            return Ok(());
        }
        if utxo.confirmations < self.inner.config.funding_confirmations {
            tracing::debug!(
                swap_id = %self.swap.id,
                depth = utxo.confirmations,
                required = self.inner.config.funding_confirmations,
                "funding below required depth"
            );
            return Ok(());
        }

        let expected = self.swap.terms.onchain_amount_sat;
        if utxo.amount_sat < expected {
            let err = SwapProtocolError::UnderfundedLockup {
                expected,
                actual: utxo.amount_sat,
            };
            return self
                .commit(Transition::Failed {
                    reason: err.to_string(),
                    txid: None,
                })
                .await;
        }

        self.commit(Transition::FundingDetected {
            txid: utxo.outpoint.txid.to_string(),
            vout: utxo.outpoint.vout,
            amount_sat: utxo.amount_sat,
            height: utxo.height,
        })
        .await?;
        self.output_seen = true;
        self.request_payment().await
    }

    async fn on_spent(
        &mut self,
        utxo: Utxo,
        spending_tx: Transaction,
    ) -> Result<(), WalletError> {
        use SwapDirection as D;
        use SwapState as S;

        let spend_txid = spending_tx.txid().to_string();
        let is_funding = self.is_funding(&utxo);
        if is_funding {
            self.output_spent = true;
        }

        match (self.swap.direction(), self.swap.state) {
            (D::Receive, S::Created) => {
                tracing::info!(swap_id = %self.swap.id, %spend_txid, "lockup reclaimed before it was trusted");
                self.commit(Transition::Refunded {
                    txid: Some(spend_txid),
                })
                .await
            }
            (D::Receive, S::FundingDetected) if is_funding => {
                self.commit(Transition::Refunded {
                    txid: Some(spend_txid),
                })
                .await
            }
            (D::Receive, S::PreimageKnown | S::Claiming) if is_funding => {
                let ours = self
                    .swap
                    .claim_tx
                    .as_ref()
                    .is_some_and(|c| c.txid == spend_txid)
                    || htlc::extract_preimage(&spending_tx, &utxo.outpoint, &self.payment_hash)
                        .is_some();
                if ours {
                    self.inner.clear_stuck(&self.swap.id);
                    self.commit(Transition::Settled { txid: spend_txid }).await
                } else {
                    self.commit(Transition::Failed {
                        reason: "funding reclaimed by counterparty".into(),
                        txid: Some(spend_txid),
                    })
                    .await
                }
            }
            (D::Send, S::LockedByUs | S::Refunding) if is_funding => {
                if let Some(preimage) =
                    htlc::extract_preimage(&spending_tx, &utxo.outpoint, &self.payment_hash)
                {
                    self.commit(Transition::PreimageKnown {
                        preimage: hex::encode(preimage),
                        source: PreimageSource::Chain,
                    })
                    .await?;
                    return self.commit(Transition::Settled { txid: spend_txid }).await;
                }
                let our_refund = self
                    .swap
                    .refund_tx
                    .as_ref()
                    .is_some_and(|r| r.txid == spend_txid);
                if our_refund {
                    self.commit(Transition::Refunded {
                        txid: Some(spend_txid),
                    })
                    .await
                } else {
                    self.commit(Transition::Failed {
                        reason: "lockup spent by an unknown transaction".into(),
                        txid: Some(spend_txid),
                    })
                    .await
                }
            }
            (D::Send, S::PreimageKnown) if is_funding => {
                self.commit(Transition::Settled { txid: spend_txid }).await
            }
            _ => Ok(()),
        }
    }

    fn is_funding(&self, utxo: &Utxo) -> bool {
        self.swap.funding.as_ref().is_some_and(|f| {
            f.outpoint()
                .map(|outpoint| outpoint == utxo.outpoint)
                .unwrap_or(false)
        })
    }

    /// `None` when the payment client could not be asked.
    async fn payment_status(&self) -> Option<OutboundStatus> {
        match self.inner.payments.payment_status(&self.payment_hash).await {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::warn!(swap_id = %self.swap.id, error = %err, "payment status lookup failed");
                None
            }
        }
    }

    /// Pays the provider invoice for a funded receive swap.
    async fn request_payment(&mut self) -> Result<(), WalletError> {
        if let Some(preimage) = self.early_preimage.take() {
            return self
                .on_preimage(preimage, PreimageSource::PaymentClient)
                .await;
        }
        match self.payment_status().await {
            Some(OutboundStatus::Succeeded { preimage }) => {
                return self
                    .on_preimage(preimage, PreimageSource::PaymentClient)
                    .await;
            }
            Some(OutboundStatus::Pending) => {
                tracing::debug!(swap_id = %self.swap.id, "invoice payment already in flight");
                self.payment_requested = true;
                return Ok(());
            }
            _ => {}
        }

        let tip = self.current_tip();
        let max_cltv_expiry_delta = lightning_cltv_budget(
            self.timeout(),
            tip,
            self.inner.config.claim_safety_blocks,
        );
        if max_cltv_expiry_delta == 0 {
            tracing::warn!(
                swap_id = %self.swap.id,
                tip,
                timeout_height = self.timeout(),
                "timeout too close; not paying invoice"
            );
            return Ok(());
        }

        self.inner
            .payments
            .pay_invoice(&self.swap.terms.invoice, max_cltv_expiry_delta)
            .await?;
        self.payment_requested = true;
        tracing::info!(swap_id = %self.swap.id, max_cltv_expiry_delta, "invoice payment requested");
        Ok(())
    }

    fn htlc_funding(&self) -> Result<HtlcFunding, WalletError> {
        let funding = self
            .swap
            .funding
            .as_ref()
            .ok_or_else(|| WalletError::Other("swap has no funding output".into()))?;
        let outpoint = funding.outpoint()?;
        Ok(HtlcFunding {
            txid: outpoint.txid,
            vout: outpoint.vout,
            amount_sat: funding.amount_sat,
            policy_asset: self.inner.policy_asset,
        })
    }

    fn swap_key(&self) -> Result<DerivedKey, WalletError> {
        Ok(self.inner.vault.swap_key(self.swap.terms.key_index)?)
    }

    async fn claim(&mut self) -> Result<(), WalletError> {
        let preimage = self
            .swap
            .preimage_bytes()
            .ok_or_else(|| WalletError::Other("claim without preimage".into()))?;
        let funding = self.htlc_funding()?;
        let destination = self.inner.wallet.receive_address().await?;
        let key = self.swap_key()?;
        let fee_sat = self.inner.config.claim_fee_sat;

        let tx = htlc::claim_tx(
            &self.htlc,
            &funding,
            &destination,
            &self.inner.vault,
            &key,
            preimage,
            fee_sat,
        )?;
        self.commit(Transition::Claiming {
            tx_hex: encode_tx(&tx),
            txid: tx.txid().to_string(),
            amount_sat: funding.amount_sat - fee_sat,
        })
        .await?;
        self.broadcast(Broadcast::Claim).await
    }

    /// Refunds the lockup, cooperatively when the provider counter-signs and
    /// through the timeout branch otherwise.
    async fn refund(&mut self) -> Result<(), WalletError> {
        let funding = self.htlc_funding()?;
        let destination = self.inner.wallet.receive_address().await?;
        let key = self.swap_key()?;
        let fee_sat = self.inner.config.refund_fee_sat;

        let tx = match self
            .cooperative_refund(&funding, &destination, &key, fee_sat)
            .await
        {
            Ok(tx) => {
                tracing::info!(swap_id = %self.swap.id, "provider signed cooperative refund");
                tx
            }
            Err(err) => {
                tracing::warn!(swap_id = %self.swap.id, error = %err, "cooperative refund failed; using timeout path");
                htlc::refund_tx(
                    &self.htlc,
                    &funding,
                    &destination,
                    &self.inner.vault,
                    &key,
                    fee_sat,
                )?
            }
        };
        tracing::info!(swap_id = %self.swap.id, tip = self.tip, "refunding lockup after timeout");
        self.commit(Transition::Refunding {
            tx_hex: encode_tx(&tx),
            txid: tx.txid().to_string(),
            amount_sat: funding.amount_sat - fee_sat,
        })
        .await?;
        self.broadcast(Broadcast::Refund).await
    }

    async fn cooperative_refund(
        &self,
        funding: &HtlcFunding,
        destination: &Address,
        key: &DerivedKey,
        fee_sat: u64,
    ) -> Result<Transaction, WalletError> {
        let unsigned = htlc::cooperative_refund_tx(funding, destination, fee_sat)?;
        let response = self
            .inner
            .provider
            .sign_cooperative_refund(
                &self.swap.terms.provider_swap_id,
                &CooperativeRefundRequest {
                    transaction: encode_tx(&unsigned),
                    index: 0,
                },
            )
            .await?;
        let claim_sig = hex::decode(&response.signature)
            .map_err(|e| SwapProtocolError::Malformed(format!("refund signature: {e}")))?;
        Ok(htlc::finalize_cooperative_refund(
            unsigned,
            &self.htlc,
            funding,
            &self.inner.vault,
            key,
            &claim_sig,
        )?)
    }

    async fn lock_funds(&mut self) -> Result<(), WalletError> {
        if self.current_tip() >= self.timeout() {
            return self
                .commit(Transition::Failed {
                    reason: "timeout passed before lockup".into(),
                    txid: None,
                })
                .await;
        }

        let address = self
            .htlc
            .p2wsh_address(self.inner.config.network.address_params());
        let amount_sat = self.swap.terms.onchain_amount_sat;
        let tx = match self.inner.wallet.build_lockup_tx(&address, amount_sat).await {
            Ok(tx) => tx,
            Err(err) => {
                return self
                    .commit(Transition::Failed {
                        reason: format!("build lockup tx: {err:#}"),
                        txid: None,
                    })
                    .await;
            }
        };

        let Some(vout) = tx.output.iter().position(|out| {
            out.script_pubkey == self.script_pubkey && out.value.explicit() == Some(amount_sat)
        }) else {
            return self
                .commit(Transition::Failed {
                    reason: "lockup tx does not pay the swap script".into(),
                    txid: None,
                })
                .await;
        };

        self.commit(Transition::LockedByUs {
            tx_hex: encode_tx(&tx),
            txid: tx.txid().to_string(),
            vout: vout as u32,
            amount_sat,
        })
        .await
    }

    async fn broadcast_unless_known(&mut self, kind: Broadcast) -> Result<(), WalletError> {
        let Some(signed) = self.signed(kind) else {
            return Ok(());
        };
        let txid = Txid::from_str(&signed.txid)
            .map_err(|e| WalletError::Other(format!("parse txid: {e}")))?;
        if self.inner.watcher.chain().get_transaction(&txid).await.is_ok() {
            tracing::debug!(swap_id = %self.swap.id, %txid, "transaction already known to the chain");
            self.last_broadcast_tip = Some(self.current_tip());
            return Ok(());
        }
        self.broadcast(kind).await
    }

    fn signed(&self, kind: Broadcast) -> Option<&super::SignedTx> {
        match kind {
            Broadcast::Lockup => self.swap.lockup_tx.as_ref(),
            Broadcast::Claim => self.swap.claim_tx.as_ref(),
            Broadcast::Refund => self.swap.refund_tx.as_ref(),
        }
    }

    fn retry_policy(&self, kind: Broadcast) -> RetryPolicy {
        match kind {
            Broadcast::Lockup | Broadcast::Claim => self.inner.config.broadcast_retry,
            Broadcast::Refund => self.inner.config.refund_retry,
        }
    }

    /// Broadcasts with bounded retry. Exhaustion marks the swap stuck; the
    /// next block triggers another round.
    async fn broadcast(&mut self, kind: Broadcast) -> Result<(), WalletError> {
        let Some(signed) = self.signed(kind) else {
            return Ok(());
        };
        let tx = signed.transaction()?;
        let policy = self.retry_policy(kind);
        let chain = self.inner.watcher.chain().clone();

        let result = retry_with_backoff(kind.label(), &policy, || {
            let chain = chain.clone();
            let tx = tx.clone();
            async move { chain.broadcast(&tx).await }
        })
        .await;
        self.last_broadcast_tip = Some(self.current_tip());

        match result {
            Ok(txid) => {
                tracing::info!(swap_id = %self.swap.id, %txid, "{}", kind.label());
                self.inner.clear_stuck(&self.swap.id);
            }
            Err(exhausted) => {
                self.inner.mark_stuck(StuckSwap {
                    swap_id: self.swap.id.clone(),
                    state: self.swap.state,
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Liquid blocks per Bitcoin block, by target interval.
const LIQUID_BLOCKS_PER_BITCOIN_BLOCK: u32 = 10;

/// Longest Lightning CLTV expiry, in Bitcoin blocks, that still fails the
/// payment back before the lockup can be refunded, keeping
/// `claim_safety_blocks` spare for the claim.
fn lightning_cltv_budget(timeout_height: u32, tip: u32, claim_safety_blocks: u32) -> u32 {
    timeout_height
        .saturating_sub(tip)
        .saturating_sub(claim_safety_blocks)
        / LIQUID_BLOCKS_PER_BITCOIN_BLOCK
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn parse_pubkey(value: &str) -> Result<PublicKey, SwapProtocolError> {
    let bytes = hex::decode(value)
        .map_err(|e| SwapProtocolError::InvalidPubkey(format!("{value}: {e}")))?;
    PublicKey::from_slice(&bytes).map_err(|e| SwapProtocolError::InvalidPubkey(format!("{value}: {e}")))
}

fn check_timeout(timeout_height: u32, tip: u32, config: &Config) -> Result<(), SwapProtocolError> {
    let min = tip
        .saturating_add(config.claim_safety_blocks)
        .saturating_add(1);
    let max = tip.saturating_add(config.max_timeout_blocks);
    if timeout_height < min || timeout_height > max {
        return Err(SwapProtocolError::TimeoutOutOfRange {
            timeout_height,
            min,
            max,
        });
    }
    Ok(())
}

fn check_fee(amount_sat: u64, fee_sat: u64, max_fee_ppm: u64) -> Result<(), SwapProtocolError> {
    let max_fee_sat = (u128::from(amount_sat) * u128::from(max_fee_ppm) / 1_000_000) as u64;
    if fee_sat > max_fee_sat {
        return Err(SwapProtocolError::FeeTooHigh {
            fee_sat,
            max_fee_sat,
        });
    }
    Ok(())
}

fn check_spendable(amount_sat: u64, fee_sat: u64) -> Result<(), SwapProtocolError> {
    if amount_sat <= fee_sat {
        return Err(SwapProtocolError::LockupBelowSpendFee { amount_sat, fee_sat });
    }
    Ok(())
}

fn check_lockup_address(
    spec: &HtlcSpec,
    provided: &str,
    network: Network,
) -> Result<(), SwapProtocolError> {
    let derived = spec.p2wsh_address(network.address_params());
    let mismatch = || SwapProtocolError::ScriptMismatch {
        derived: derived.to_string(),
        provided: provided.to_string(),
    };
    let parsed = Address::from_str(provided).map_err(|_| mismatch())?;
    if parsed.params != derived.params || parsed.script_pubkey() != derived.script_pubkey() {
        return Err(mismatch());
    }
    Ok(())
}

fn verify_reverse_swap(
    config: &Config,
    amount_sat: u64,
    key_index: u32,
    claim_key: &DerivedKey,
    response: &ReverseSwapResponse,
    tip: u32,
) -> Result<SwapTerms, SwapProtocolError> {
    let invoice = decode_bolt11(&response.invoice, config.network)?;
    if invoice.amount_sat != amount_sat {
        return Err(SwapProtocolError::AmountMismatch {
            expected: amount_sat,
            actual: invoice.amount_sat,
        });
    }
    if response.onchain_amount > amount_sat {
        return Err(SwapProtocolError::Malformed(format!(
            "onchain amount {} exceeds invoice amount {amount_sat}",
            response.onchain_amount
        )));
    }
    check_spendable(response.onchain_amount, config.claim_fee_sat)?;
    let fee_sat = amount_sat - response.onchain_amount;
    check_fee(amount_sat, fee_sat, config.max_swap_fee_ppm)?;
    check_timeout(response.timeout_block_height, tip, config)?;

    let refund_pubkey = parse_pubkey(&response.refund_public_key)?;
    let spec = HtlcSpec {
        payment_hash: invoice.payment_hash,
        claim_pubkey: claim_key.public_key(),
        refund_pubkey,
        timeout_height: response.timeout_block_height,
    };
    check_lockup_address(&spec, &response.lockup_address, config.network)?;

    Ok(SwapTerms {
        direction: SwapDirection::Receive,
        provider_swap_id: response.id.clone(),
        invoice: response.invoice.clone(),
        payment_hash: hex::encode(invoice.payment_hash),
        amount_sat,
        onchain_amount_sat: response.onchain_amount,
        fee_sat,
        key_index,
        claim_pubkey: hex::encode(spec.claim_pubkey.serialize()),
        refund_pubkey: hex::encode(refund_pubkey.serialize()),
        timeout_height: spec.timeout_height,
        lockup_address: response.lockup_address.clone(),
        witness_script: hex::encode(spec.witness_script().to_bytes()),
        created_at: unix_now(),
    })
}

#[allow(clippy::too_many_arguments)]
fn verify_submarine_swap(
    config: &Config,
    invoice: &str,
    payment_hash: [u8; 32],
    amount_sat: u64,
    key_index: u32,
    refund_key: &DerivedKey,
    response: &SubmarineSwapResponse,
    tip: u32,
) -> Result<SwapTerms, SwapProtocolError> {
    if response.expected_amount < amount_sat {
        return Err(SwapProtocolError::AmountMismatch {
            expected: amount_sat,
            actual: response.expected_amount,
        });
    }
    check_spendable(response.expected_amount, config.refund_fee_sat)?;
    let fee_sat = response.expected_amount - amount_sat;
    check_fee(amount_sat, fee_sat, config.max_swap_fee_ppm)?;
    check_timeout(response.timeout_block_height, tip, config)?;

    let claim_pubkey = parse_pubkey(&response.claim_public_key)?;
    let spec = HtlcSpec {
        payment_hash,
        claim_pubkey,
        refund_pubkey: refund_key.public_key(),
        timeout_height: response.timeout_block_height,
    };
    check_lockup_address(&spec, &response.address, config.network)?;

    Ok(SwapTerms {
        direction: SwapDirection::Send,
        provider_swap_id: response.id.clone(),
        invoice: invoice.to_string(),
        payment_hash: hex::encode(payment_hash),
        amount_sat,
        onchain_amount_sat: response.expected_amount,
        fee_sat,
        key_index,
        claim_pubkey: hex::encode(claim_pubkey.serialize()),
        refund_pubkey: hex::encode(spec.refund_pubkey.serialize()),
        timeout_height: spec.timeout_height,
        lockup_address: response.address.clone(),
        witness_script: hex::encode(spec.witness_script().to_bytes()),
        created_at: unix_now(),
    })
}
