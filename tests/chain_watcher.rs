mod support {
    pub mod fakes;
    pub mod wait;
}

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use liquid_swap_wallet::chain::watcher::{ChainWatcher, UtxoEventStream};
use liquid_swap_wallet::chain::{ChainClient, HistoryEntry, UtxoEvent};
use liquid_swap_wallet::error::ChainError;
use lwk_wollet::elements::{Script, Transaction, Txid};

use support::fakes::{FakeChain, FakeWallet, transfer};

/// A chain client over [`FakeChain`] that can fail chosen calls and list
/// mempool history newest first, as Electrum servers may.
struct UnreliableChain {
    inner: Arc<FakeChain>,
    failing_scripts: Mutex<HashSet<Script>>,
    failing_txs: Mutex<HashSet<Txid>>,
    newest_first: AtomicBool,
}

impl UnreliableChain {
    fn new(inner: Arc<FakeChain>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_scripts: Mutex::new(HashSet::new()),
            failing_txs: Mutex::new(HashSet::new()),
            newest_first: AtomicBool::new(false),
        })
    }

    fn fail_history(&self, script: &Script, fail: bool) {
        let mut scripts = self.failing_scripts.lock().unwrap();
        if fail {
            scripts.insert(script.clone());
        } else {
            scripts.remove(script);
        }
    }

    fn fail_fetch(&self, txid: Txid, fail: bool) {
        let mut txs = self.failing_txs.lock().unwrap();
        if fail {
            txs.insert(txid);
        } else {
            txs.remove(&txid);
        }
    }
}

#[async_trait]
impl ChainClient for UnreliableChain {
    async fn tip_height(&self) -> Result<u32, ChainError> {
        self.inner.tip_height().await
    }

    async fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError> {
        if self.failing_scripts.lock().unwrap().contains(script) {
            return Err(ChainError::Backend("history request timed out".into()));
        }
        let mut history = self.inner.script_history(script).await?;
        if self.newest_first.load(Ordering::SeqCst) {
            history.reverse();
        }
        Ok(history)
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        if self.failing_txs.lock().unwrap().contains(txid) {
            return Err(ChainError::Backend(format!("transaction {txid} timed out")));
        }
        self.inner.get_transaction(txid).await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        self.inner.broadcast(tx).await
    }
}

fn script(byte: u8) -> Script {
    let mut bytes = vec![0x00, 0x20];
    bytes.extend_from_slice(&[byte; 32]);
    Script::from(bytes)
}

/// Events already queued on `stream`.
async fn drain(stream: &mut UtxoEventStream) -> Vec<UtxoEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), stream.next()).await
    {
        events.push(event);
    }
    events
}

fn spends(events: &[UtxoEvent]) -> Vec<Txid> {
    events
        .iter()
        .filter_map(|e| match e {
            UtxoEvent::Spent { spending_tx, .. } => Some(spending_tx.txid()),
            _ => None,
        })
        .collect()
}

fn setup() -> (Arc<FakeChain>, Arc<UnreliableChain>, Arc<FakeWallet>, ChainWatcher) {
    let fake = FakeChain::new(100);
    let chain = UnreliableChain::new(fake.clone());
    let wallet = FakeWallet::new(fake.clone());
    let watcher = ChainWatcher::new(chain.clone(), wallet.clone());
    (fake, chain, wallet, watcher)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_script_does_not_hold_back_other_scripts() -> Result<()> {
    let (fake, chain, _wallet, watcher) = setup();
    let (a, b) = (script(1), script(2));
    let mut stream_a = watcher.subscribe(a.clone()).await;
    let mut stream_b = watcher.subscribe(b.clone()).await;

    let funding_a = fake.fund(a.clone(), 10_000);
    fake.fund(b.clone(), 20_000);
    watcher.poll().await?;
    assert!(matches!(drain(&mut stream_a).await.as_slice(), [UtxoEvent::Appeared(u)] if u.outpoint == funding_a));
    assert_eq!(drain(&mut stream_b).await.len(), 1);

    let spend = fake.submit(transfer(funding_a, script(9), 10_000))?;
    chain.fail_history(&b, true);
    assert!(watcher.poll().await.is_err(), "a failed scan is reported");
    assert_eq!(spends(&drain(&mut stream_a).await), vec![spend]);
    assert!(drain(&mut stream_b).await.is_empty());

    chain.fail_history(&b, false);
    fake.mine(1);
    watcher.poll().await?;
    assert!(spends(&drain(&mut stream_a).await).is_empty(), "a spend is reported once");
    assert!(matches!(
        drain(&mut stream_b).await.as_slice(),
        [UtxoEvent::Confirmed { depth: 1, .. }]
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_transaction_fetch_is_retried_on_next_poll() -> Result<()> {
    let (fake, chain, _wallet, watcher) = setup();
    let a = script(3);
    let mut stream = watcher.subscribe(a.clone()).await;

    let funding = fake.fund(a.clone(), 10_000);
    watcher.poll().await?;
    assert_eq!(drain(&mut stream).await.len(), 1);

    let spend = fake.submit(transfer(funding, script(9), 10_000))?;
    chain.fail_fetch(spend, true);
    assert!(watcher.poll().await.is_err());
    assert!(drain(&mut stream).await.is_empty());

    chain.fail_fetch(spend, false);
    watcher.poll().await?;
    assert_eq!(spends(&drain(&mut stream).await), vec![spend]);

    watcher.poll().await?;
    assert!(drain(&mut stream).await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_wait_for_a_successful_wallet_sync() -> Result<()> {
    let (fake, _chain, wallet, watcher) = setup();
    let a = script(4);
    let mut stream = watcher.subscribe(a.clone()).await;

    let funding = fake.fund(a.clone(), 10_000);
    let spend = fake.submit(transfer(funding, wallet.address().script_pubkey(), 10_000))?;
    wallet.fail_sync(true);
    assert!(watcher.poll().await.is_err());
    assert!(drain(&mut stream).await.is_empty());
    assert_eq!(watcher.tip(), 0, "tip is published with the events");

    wallet.fail_sync(false);
    watcher.poll().await?;
    let events = drain(&mut stream).await;
    assert!(matches!(events.first(), Some(UtxoEvent::Appeared(u)) if u.outpoint == funding));
    assert_eq!(spends(&events), vec![spend]);
    assert!(
        watcher
            .wallet_utxos()
            .iter()
            .any(|u| u.outpoint.txid == spend),
        "the spend's output is in the wallet cache once the spend is reported"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mempool_spend_listed_before_its_funding_is_reported() -> Result<()> {
    let (fake, chain, _wallet, watcher) = setup();
    chain.newest_first.store(true, Ordering::SeqCst);
    let a = script(5);
    let mut stream = watcher.subscribe(a.clone()).await;

    let funding = fake.fund(a.clone(), 10_000);
    let spend = fake.submit(transfer(funding, script(9), 10_000))?;
    watcher.poll().await?;

    let events = drain(&mut stream).await;
    assert_eq!(events.len(), 2, "{events:?}");
    assert!(matches!(&events[0], UtxoEvent::Appeared(u) if u.outpoint == funding));
    assert!(matches!(&events[1], UtxoEvent::Spent { utxo, height: None, .. } if utxo.outpoint == funding));
    assert_eq!(spends(&events), vec![spend]);
    Ok(())
}
