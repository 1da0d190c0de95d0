use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{Bolt11SendRequest, GetBalancesRequest, ListPaymentsRequest};
use ldk_server_protos::types::{
    Payment, PaymentDirection, PaymentStatus, RouteParametersConfig, payment_kind,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{OutboundStatus, PaymentClient, PaymentSettled};
use crate::error::PaymentError;
use crate::liquid::htlc::sha256_preimage;

const MAX_PATH_COUNT: u32 = 10;
const MAX_CHANNEL_SATURATION_POWER_OF_HALF: u32 = 2;

/// Payment client backed by an LDK Server node over its REST API.
///
/// LDK Server has no push notifications, so completions are discovered by
/// polling `ListPayments`; every succeeded outbound BOLT11 payment is
/// reported once per process.
pub struct LdkPaymentClient {
    client: LdkServerClient,
    settled: broadcast::Sender<PaymentSettled>,
    reported: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Outbound {
    id: String,
    payment_hash: [u8; 32],
    status: OutboundStatus,
}

impl LdkPaymentClient {
    pub fn new(rest_service_address: String) -> Self {
        let (settled, _) = broadcast::channel(256);
        Self {
            client: LdkServerClient::new(rest_service_address),
            settled,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Every outbound BOLT11 payment, across all `ListPayments` pages.
    async fn outbound_payments(&self) -> Result<Vec<Outbound>> {
        let mut out = Vec::new();
        let mut page_token = None;
        loop {
            let page = self
                .client
                .list_payments(ListPaymentsRequest { page_token })
                .await
                .map_err(|e| anyhow::anyhow!("ListPayments: {e}"))?;
            let empty = page.payments.is_empty();

            for p in page.payments {
                let id = p.id.clone();
                match outbound_bolt11(p) {
                    Ok(Some(payment)) => out.push(payment),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(payment_id = %id, error = %err, "skipping malformed payment")
                    }
                }
            }

            match page.next_page_token {
                Some(token) if !empty => page_token = Some(token),
                _ => break,
            }
        }
        Ok(out)
    }

    /// Reports newly completed payments to subscribers. Returns how many were new.
    pub async fn poll_once(&self) -> Result<usize> {
        let payments = self.outbound_payments().await?;
        let mut fresh = Vec::new();
        {
            let mut reported = self.reported.lock().expect("payment set mutex poisoned");
            for payment in payments {
                let OutboundStatus::Succeeded { preimage } = payment.status else {
                    continue;
                };
                if reported.insert(payment.id) {
                    fresh.push(PaymentSettled {
                        payment_hash: payment.payment_hash,
                        preimage,
                    });
                }
            }
        }
        for payment in &fresh {
            tracing::debug!(payment_hash = %hex::encode(payment.payment_hash), "outbound payment settled");
            // No subscriber yet; the engine asks with `payment_status` on resume.
            let _ = self.settled.send(*payment);
        }
        Ok(fresh.len())
    }

    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = client.poll_once().await {
                    tracing::warn!(error = %err, "payment poll failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        })
    }
}

fn decode_32(value: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).with_context(|| format!("decode {what} hex"))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{what} must be 32 bytes"))
}

fn outbound_bolt11(p: Payment) -> Result<Option<Outbound>> {
    if p.direction != PaymentDirection::Outbound as i32 {
        return Ok(None);
    }
    let Some(payment_kind::Kind::Bolt11(bolt11)) = p.kind.and_then(|k| k.kind) else {
        return Ok(None);
    };

    let status = if p.status == PaymentStatus::Pending as i32 {
        OutboundStatus::Pending
    } else if p.status == PaymentStatus::Failed as i32 {
        OutboundStatus::Failed
    } else if p.status == PaymentStatus::Succeeded as i32 {
        let preimage_hex = bolt11
            .preimage
            .as_deref()
            .context("succeeded payment without preimage")?;
        OutboundStatus::Succeeded {
            preimage: decode_32(preimage_hex, "preimage")?,
        }
    } else {
        anyhow::bail!("unknown payment status {}", p.status);
    };

    let payment_hash = match status {
        OutboundStatus::Succeeded { preimage } => sha256_preimage(&preimage),
        _ => decode_32(&bolt11.hash, "payment hash")?,
    };
    Ok(Some(Outbound {
        id: p.id,
        payment_hash,
        status,
    }))
}

/// Collapses every attempt at one hash into a single status.
fn status_for(payments: &[Outbound], payment_hash: &[u8; 32]) -> OutboundStatus {
    let mut status = OutboundStatus::Unknown;
    for p in payments.iter().filter(|p| &p.payment_hash == payment_hash) {
        status = match (status, p.status) {
            (found @ OutboundStatus::Succeeded { .. }, _) => found,
            (_, found @ OutboundStatus::Succeeded { .. }) => found,
            (OutboundStatus::Pending, _) | (_, OutboundStatus::Pending) => OutboundStatus::Pending,
            _ => OutboundStatus::Failed,
        };
    }
    status
}

#[async_trait]
impl PaymentClient for LdkPaymentClient {
    async fn pay_invoice(
        &self,
        invoice: &str,
        max_cltv_expiry_delta: u32,
    ) -> Result<(), PaymentError> {
        let resp = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice: invoice.to_string(),
                amount_msat: None,
                route_parameters: Some(RouteParametersConfig {
                    max_total_routing_fee_msat: None,
                    max_total_cltv_expiry_delta: max_cltv_expiry_delta,
                    max_path_count: MAX_PATH_COUNT,
                    max_channel_saturation_power_of_half: MAX_CHANNEL_SATURATION_POWER_OF_HALF,
                }),
            })
            .await
            .map_err(|e| PaymentError::Rejected(format!("Bolt11Send: {e}")))?;
        tracing::info!(payment_id = %resp.payment_id, max_cltv_expiry_delta, "lightning payment started");
        Ok(())
    }

    async fn payment_status(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<OutboundStatus, PaymentError> {
        let payments = self
            .outbound_payments()
            .await
            .map_err(|e| PaymentError::Backend(format!("{e:#}")))?;
        Ok(status_for(&payments, payment_hash))
    }

    async fn channel_balance_msat(&self) -> Result<u64, PaymentError> {
        let balances = self
            .client
            .get_balances(GetBalancesRequest {})
            .await
            .map_err(|e| PaymentError::Backend(format!("GetBalances: {e}")))?;
        Ok(balances.total_lightning_balance_sats.saturating_mul(1000))
    }

    fn subscribe_settled(&self) -> broadcast::Receiver<PaymentSettled> {
        self.settled.subscribe()
    }
}
