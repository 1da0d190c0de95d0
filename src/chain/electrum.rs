use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use lwk_wollet::blocking::BlockchainBackend as _;
use lwk_wollet::elements::{Script, Transaction, Txid};
use lwk_wollet::{ElectrumClient, ElectrumUrl, History};

use super::{ChainClient, HistoryEntry};
use crate::error::ChainError;

/// Chain client backed by a Liquid Electrum server.
#[derive(Clone)]
pub struct ElectrumChainClient {
    client: Arc<Mutex<ElectrumClient>>,
}

impl ElectrumChainClient {
    pub fn new(url: &str, tls: bool) -> Result<Self> {
        Ok(Self {
            client: Arc::new(Mutex::new(electrum_client(url, tls)?)),
        })
    }

    async fn with_client<T, F>(&self, label: &'static str, f: F) -> Result<T, ChainError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ElectrumClient) -> Result<T, ChainError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut client = client.lock().expect("electrum mutex poisoned");
            f(&mut *client)
        })
        .await
        .map_err(|e| ChainError::Backend(format!("{label}: join: {e}")))?
    }
}

#[async_trait]
impl ChainClient for ElectrumChainClient {
    async fn tip_height(&self) -> Result<u32, ChainError> {
        self.with_client("tip", |client| {
            client
                .tip()
                .map(|header| header.height)
                .map_err(|e| ChainError::Backend(format!("get tip: {e}")))
        })
        .await
    }

    async fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError> {
        let script = script.clone();
        self.with_client("script history", move |client| {
            let mut histories = client
                .get_scripts_history(&[&script])
                .map_err(|e| ChainError::Backend(format!("get script history: {e}")))?;
            let history: Vec<History> = histories.pop().unwrap_or_default();
            Ok(history
                .into_iter()
                .map(|h| HistoryEntry {
                    txid: h.txid,
                    height: u32::try_from(h.height).ok().filter(|h| *h > 0),
                })
                .collect())
        })
        .await
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        let txid = *txid;
        self.with_client("get transaction", move |client| {
            let mut txs = client
                .get_transactions(&[txid])
                .map_err(|e| ChainError::Backend(format!("get transaction {txid}: {e}")))?;
            txs.pop()
                .ok_or_else(|| ChainError::Backend(format!("transaction not found: {txid}")))
        })
        .await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let tx = tx.clone();
        self.with_client("broadcast", move |client| {
            client
                .broadcast(&tx)
                .map_err(|e| ChainError::RejectedByNetwork(e.to_string()))
        })
        .await
    }
}

pub(crate) fn electrum_client(url: &str, tls: bool) -> Result<ElectrumClient> {
    let endpoint = url
        .trim_start_matches("tcp://")
        .trim_start_matches("ssl://");
    let electrum_url = ElectrumUrl::new(endpoint, tls, tls)
        .with_context(|| format!("parse electrum url {endpoint}"))?;
    ElectrumClient::new(&electrum_url).context("create electrum client")
}
