pub mod invoice;
pub mod ldk;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::PaymentError;

/// An outbound payment completed; `preimage` hashes to `payment_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentSettled {
    pub payment_hash: [u8; 32],
    pub preimage: [u8; 32],
}

/// What the node knows about outbound payments to one hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStatus {
    /// No payment to the hash was ever started.
    Unknown,
    Pending,
    Failed,
    Succeeded { preimage: [u8; 32] },
}

#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Starts paying `invoice` over routes whose total CLTV expiry delta stays
    /// within `max_cltv_expiry_delta` blocks. Completion arrives through
    /// [`PaymentClient::subscribe_settled`].
    async fn pay_invoice(&self, invoice: &str, max_cltv_expiry_delta: u32)
    -> Result<(), PaymentError>;

    async fn payment_status(&self, payment_hash: &[u8; 32])
    -> Result<OutboundStatus, PaymentError>;

    async fn channel_balance_msat(&self) -> Result<u64, PaymentError>;

    fn subscribe_settled(&self) -> broadcast::Receiver<PaymentSettled>;
}
