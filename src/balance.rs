use std::collections::HashSet;
use std::sync::Arc;

use lwk_wollet::elements::{AssetId, OutPoint};
use serde::Serialize;

use crate::chain::Utxo;
use crate::chain::watcher::ChainWatcher;
use crate::error::WalletError;
use crate::lightning::PaymentClient;
use crate::swap::engine::SwapEngine;
use crate::swap::{Swap, SwapDirection, SwapState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub confirmed_onchain_sat: u64,
    pub unconfirmed_onchain_sat: u64,
    pub pending_send_sat: u64,
    pub pending_receive_sat: u64,
    pub offchain_sat: u64,
    pub total_sat: u64,
}

/// Folds wallet UTXOs, swaps and the channel balance into one snapshot.
///
/// Swap funds are attributed from the swap state, but a swap never claims an
/// amount the wallet cache still shows: a lockup whose inputs are still
/// listed as wallet UTXOs is not yet pending, and a claim or refund whose
/// output is already a wallet UTXO is no longer pending.
pub fn snapshot(
    policy_asset: AssetId,
    wallet_utxos: &[Utxo],
    swaps: &[Swap],
    channel_balance_msat: u64,
) -> BalanceSnapshot {
    let mut balance = BalanceSnapshot::default();

    let wallet_utxos: Vec<&Utxo> = wallet_utxos
        .iter()
        .filter(|u| u.asset == policy_asset)
        .collect();
    for utxo in &wallet_utxos {
        if utxo.confirmations > 0 {
            balance.confirmed_onchain_sat += utxo.amount_sat;
        } else {
            balance.unconfirmed_onchain_sat += utxo.amount_sat;
        }
    }

    let outpoints: HashSet<OutPoint> = wallet_utxos.iter().map(|u| u.outpoint).collect();
    let txids: HashSet<String> = wallet_utxos
        .iter()
        .map(|u| u.outpoint.txid.to_string())
        .collect();
    let landed = |txid: &str| txids.contains(txid);

    for swap in swaps {
        match (swap.direction(), swap.state) {
            (SwapDirection::Receive, SwapState::PreimageKnown) => {
                balance.pending_receive_sat +=
                    swap.funding.as_ref().map_or(0, |f| f.amount_sat);
            }
            (SwapDirection::Receive, SwapState::Claiming) => {
                if let Some(claim) = &swap.claim_tx
                    && !landed(&claim.txid)
                {
                    balance.pending_receive_sat += claim.amount_sat;
                }
            }
            (SwapDirection::Send, SwapState::LockedByUs | SwapState::PreimageKnown) => {
                if !lockup_inputs_in_wallet(swap, &outpoints) {
                    balance.pending_send_sat += swap.lockup_tx.as_ref().map_or(0, |l| l.amount_sat);
                }
            }
            (SwapDirection::Send, SwapState::Refunding) => {
                if let Some(refund) = &swap.refund_tx
                    && !landed(&refund.txid)
                    && !lockup_inputs_in_wallet(swap, &outpoints)
                {
                    balance.pending_send_sat += refund.amount_sat;
                }
            }
            _ => {}
        }
    }

    balance.offchain_sat = channel_balance_msat / 1000;
    balance.total_sat = balance.confirmed_onchain_sat
        + balance.unconfirmed_onchain_sat
        + balance.pending_send_sat
        + balance.pending_receive_sat
        + balance.offchain_sat;
    balance
}

fn lockup_inputs_in_wallet(swap: &Swap, wallet_outpoints: &HashSet<OutPoint>) -> bool {
    let Some(lockup) = &swap.lockup_tx else {
        return false;
    };
    match lockup.transaction() {
        Ok(tx) => tx
            .input
            .iter()
            .any(|input| wallet_outpoints.contains(&input.previous_output)),
        Err(err) => {
            tracing::warn!(swap_id = %swap.id, error = %err, "lockup tx does not decode");
            false
        }
    }
}

pub struct BalanceReconciler {
    policy_asset: AssetId,
    watcher: Arc<ChainWatcher>,
    engine: SwapEngine,
    payments: Arc<dyn PaymentClient>,
}

impl BalanceReconciler {
    pub fn new(
        policy_asset: AssetId,
        watcher: Arc<ChainWatcher>,
        engine: SwapEngine,
        payments: Arc<dyn PaymentClient>,
    ) -> Self {
        Self {
            policy_asset,
            watcher,
            engine,
            payments,
        }
    }

    pub async fn snapshot(&self) -> Result<BalanceSnapshot, WalletError> {
        let utxos = self.watcher.wallet_utxos();
        let swaps = self.engine.active_swaps().await?;
        let channel_balance_msat = self.payments.channel_balance_msat().await?;
        let balance = snapshot(self.policy_asset, &utxos, &swaps, channel_balance_msat);
        tracing::debug!(
            total_sat = balance.total_sat,
            pending_send_sat = balance.pending_send_sat,
            pending_receive_sat = balance.pending_receive_sat,
            "balance snapshot"
        );
        Ok(balance)
    }
}
