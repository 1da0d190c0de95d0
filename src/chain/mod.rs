pub mod electrum;
pub mod watcher;

use async_trait::async_trait;
use lwk_wollet::elements::{AssetId, OutPoint, Script, Transaction, Txid};

use crate::error::ChainError;

/// One transaction touching a script, as reported by the chain client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// `None` while the transaction is in the mempool.
    pub height: Option<u32>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn tip_height(&self) -> Result<u32, ChainError>;

    /// Transactions that pay to or spend from `script`, in chain order.
    async fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError>;

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub amount_sat: u64,
    pub asset: AssetId,
    pub script_pubkey: Script,
    pub height: Option<u32>,
    pub confirmations: u32,
}

impl Utxo {
    pub fn with_tip(mut self, tip: u32) -> Self {
        self.confirmations = confirmations(self.height, tip);
        self
    }
}

pub fn confirmations(height: Option<u32>, tip: u32) -> u32 {
    match height {
        Some(h) if h <= tip => tip - h + 1,
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoEvent {
    Appeared(Utxo),
    Confirmed { utxo: Utxo, depth: u32 },
    Spent {
        utxo: Utxo,
        spending_tx: Transaction,
        height: Option<u32>,
    },
}

impl UtxoEvent {
    pub fn utxo(&self) -> &Utxo {
        match self {
            UtxoEvent::Appeared(utxo)
            | UtxoEvent::Confirmed { utxo, .. }
            | UtxoEvent::Spent { utxo, .. } => utxo,
        }
    }
}
