pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SwapperError;

/// Reverse swap: the provider locks L-BTC, we pay its invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseSwapRequest {
    pub from: String,
    pub to: String,
    pub invoice_amount: u64,
    /// Hex, compressed.
    pub claim_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseSwapResponse {
    pub id: String,
    pub invoice: String,
    pub refund_public_key: String,
    pub timeout_block_height: u32,
    pub lockup_address: String,
    pub onchain_amount: u64,
}

/// Submarine swap: we lock L-BTC, the provider pays our invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineSwapRequest {
    pub from: String,
    pub to: String,
    pub invoice: String,
    pub refund_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmarineSwapResponse {
    pub id: String,
    pub claim_public_key: String,
    pub timeout_block_height: u32,
    pub expected_amount: u64,
    pub address: String,
}

impl ReverseSwapRequest {
    pub fn lightning_to_liquid(invoice_amount: u64, claim_public_key: String) -> Self {
        Self {
            from: "BTC".into(),
            to: "L-BTC".into(),
            invoice_amount,
            claim_public_key,
        }
    }
}

impl SubmarineSwapRequest {
    pub fn liquid_to_lightning(invoice: String, refund_public_key: String) -> Self {
        Self {
            from: "L-BTC".into(),
            to: "BTC".into(),
            invoice,
            refund_public_key,
        }
    }
}

/// Asks the provider to counter-sign a spend of a submarine swap lockup back
/// to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooperativeRefundRequest {
    /// Unsigned spend, hex.
    pub transaction: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooperativeRefundResponse {
    /// DER signature plus sighash byte, hex.
    pub signature: String,
}

/// The swap counterparty. Nothing it returns is trusted until the engine has
/// re-derived the lockup script from it.
#[async_trait]
pub trait SwapProvider: Send + Sync {
    async fn create_reverse_swap(
        &self,
        request: &ReverseSwapRequest,
    ) -> Result<ReverseSwapResponse, SwapperError>;

    async fn create_submarine_swap(
        &self,
        request: &SubmarineSwapRequest,
    ) -> Result<SubmarineSwapResponse, SwapperError>;

    async fn sign_cooperative_refund(
        &self,
        swap_id: &str,
        request: &CooperativeRefundRequest,
    ) -> Result<CooperativeRefundResponse, SwapperError>;
}
