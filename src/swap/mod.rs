pub mod engine;
pub mod retry;
pub mod store;

use std::fmt;
use std::str::FromStr;

use anyhow::{Context as _, Result};
use lwk_wollet::elements::bitcoin::hashes::{Hash as _, HashEngine as _, sha256};
use lwk_wollet::elements::{OutPoint, Script, Transaction, Txid, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::liquid::htlc::{HtlcSpec, sha256_preimage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    /// Pay over Lightning, receive L-BTC (reverse swap).
    Receive,
    /// Lock L-BTC, the counterparty pays our invoice (submarine swap).
    Send,
}

impl SwapDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapDirection::Receive => "receive",
            SwapDirection::Send => "send",
        }
    }

    fn tag(self) -> u8 {
        match self {
            SwapDirection::Receive => 0,
            SwapDirection::Send => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    FundingDetected,
    LockedByUs,
    PreimageKnown,
    Claiming,
    Refunding,
    Settled,
    Refunded,
    Failed,
}

impl SwapState {
    pub const TERMINAL: [SwapState; 3] = [SwapState::Settled, SwapState::Refunded, SwapState::Failed];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapState::Created => "created",
            SwapState::FundingDetected => "funding_detected",
            SwapState::LockedByUs => "locked_by_us",
            SwapState::PreimageKnown => "preimage_known",
            SwapState::Claiming => "claiming",
            SwapState::Refunding => "refunding",
            SwapState::Settled => "settled",
            SwapState::Refunded => "refunded",
            SwapState::Failed => "failed",
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => SwapState::Created,
            "funding_detected" => SwapState::FundingDetected,
            "locked_by_us" => SwapState::LockedByUs,
            "preimage_known" => SwapState::PreimageKnown,
            "claiming" => SwapState::Claiming,
            "refunding" => SwapState::Refunding,
            "settled" => SwapState::Settled,
            "refunded" => SwapState::Refunded,
            "failed" => SwapState::Failed,
            other => return Err(format!("unknown swap state: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreimageSource {
    PaymentClient,
    Chain,
}

/// Everything agreed with the counterparty when the swap was created.
/// Binary values are hex so the log stays readable with plain `sqlite3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTerms {
    pub direction: SwapDirection,
    pub provider_swap_id: String,
    pub invoice: String,
    pub payment_hash: String,
    /// Lightning amount.
    pub amount_sat: u64,
    /// Amount locked in the swap script.
    pub onchain_amount_sat: u64,
    pub fee_sat: u64,
    pub key_index: u32,
    pub claim_pubkey: String,
    pub refund_pubkey: String,
    pub timeout_height: u32,
    pub lockup_address: String,
    pub witness_script: String,
    pub created_at: u64,
}

impl SwapTerms {
    pub fn payment_hash_bytes(&self) -> Result<[u8; 32]> {
        decode_32(&self.payment_hash).context("decode payment hash")
    }

    pub fn htlc(&self) -> Result<HtlcSpec> {
        let script = Script::from(hex::decode(&self.witness_script).context("decode witness script")?);
        HtlcSpec::parse_witness_script(&script)
    }

    pub fn script_pubkey(&self) -> Result<Script> {
        Ok(self.htlc()?.script_pubkey())
    }
}

/// One entry of a swap's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Created {
        terms: SwapTerms,
    },
    FundingDetected {
        txid: String,
        vout: u32,
        amount_sat: u64,
        height: Option<u32>,
    },
    LockedByUs {
        tx_hex: String,
        txid: String,
        vout: u32,
        amount_sat: u64,
    },
    PreimageKnown {
        preimage: String,
        source: PreimageSource,
    },
    Claiming {
        tx_hex: String,
        txid: String,
        amount_sat: u64,
    },
    Refunding {
        tx_hex: String,
        txid: String,
        amount_sat: u64,
    },
    Settled {
        txid: String,
    },
    Refunded {
        txid: Option<String>,
    },
    Failed {
        reason: String,
        txid: Option<String>,
    },
}

impl Transition {
    pub fn target_state(&self) -> SwapState {
        match self {
            Transition::Created { .. } => SwapState::Created,
            Transition::FundingDetected { .. } => SwapState::FundingDetected,
            Transition::LockedByUs { .. } => SwapState::LockedByUs,
            Transition::PreimageKnown { .. } => SwapState::PreimageKnown,
            Transition::Claiming { .. } => SwapState::Claiming,
            Transition::Refunding { .. } => SwapState::Refunding,
            Transition::Settled { .. } => SwapState::Settled,
            Transition::Refunded { .. } => SwapState::Refunded,
            Transition::Failed { .. } => SwapState::Failed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition {from} -> {to}: {reason}")]
pub struct TransitionError {
    pub from: SwapState,
    pub to: SwapState,
    pub reason: String,
}

/// The swap script output: ours for a receive swap, theirs for a send swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funding {
    pub txid: String,
    pub vout: u32,
    pub amount_sat: u64,
}

impl Funding {
    pub fn outpoint(&self) -> Result<OutPoint> {
        Ok(OutPoint {
            txid: Txid::from_str(&self.txid).context("parse funding txid")?,
            vout: self.vout,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub tx_hex: String,
    pub txid: String,
    /// Lockup amount, or what a claim/refund pays back to the wallet.
    pub amount_sat: u64,
}

impl SignedTx {
    pub fn transaction(&self) -> Result<Transaction> {
        decode_tx(&self.tx_hex)
    }
}

/// Current view of a swap, rebuilt by replaying its transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Swap {
    pub id: String,
    pub terms: SwapTerms,
    pub state: SwapState,
    pub funding: Option<Funding>,
    pub lockup_tx: Option<SignedTx>,
    pub preimage: Option<String>,
    pub claim_tx: Option<SignedTx>,
    pub refund_tx: Option<SignedTx>,
    pub resolution_txid: Option<String>,
    pub failure_reason: Option<String>,
    pub history: Vec<SwapState>,
    /// Number of log entries applied; the next append uses this as its sequence number.
    pub log_len: u32,
}

impl Swap {
    pub fn from_created(id: String, terms: SwapTerms) -> Self {
        Self {
            id,
            terms,
            state: SwapState::Created,
            funding: None,
            lockup_tx: None,
            preimage: None,
            claim_tx: None,
            refund_tx: None,
            resolution_txid: None,
            failure_reason: None,
            history: vec![SwapState::Created],
            log_len: 1,
        }
    }

    /// Rebuilds a swap from its full log.
    pub fn replay(id: &str, log: &[Transition]) -> Result<Self, String> {
        let (first, rest) = log.split_first().ok_or("empty transition log")?;
        let Transition::Created { terms } = first else {
            return Err(format!(
                "log starts with {:?} instead of created",
                first.target_state()
            ));
        };
        let mut swap = Self::from_created(id.to_string(), terms.clone());
        for (seq, transition) in rest.iter().enumerate() {
            swap.apply(transition)
                .map_err(|e| format!("entry {}: {e}", seq + 1))?;
        }
        Ok(swap)
    }

    pub fn direction(&self) -> SwapDirection {
        self.terms.direction
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn preimage_bytes(&self) -> Option<[u8; 32]> {
        self.preimage.as_deref().and_then(|p| decode_32(p).ok())
    }

    /// Applies one transition after checking it is legal from the current state.
    pub fn apply(&mut self, transition: &Transition) -> Result<(), TransitionError> {
        let from = self.state;
        let to = transition.target_state();
        let reject = |reason: String| TransitionError { from, to, reason };

        if !allowed(self.terms.direction, from, to) {
            return Err(reject("not allowed for this direction".into()));
        }

        match transition {
            Transition::Created { .. } => {
                return Err(reject("swap already created".into()));
            }
            Transition::FundingDetected {
                txid,
                vout,
                amount_sat,
                ..
            } => {
                Txid::from_str(txid).map_err(|e| reject(format!("funding txid: {e}")))?;
                self.funding = Some(Funding {
                    txid: txid.clone(),
                    vout: *vout,
                    amount_sat: *amount_sat,
                });
            }
            Transition::LockedByUs {
                tx_hex,
                txid,
                vout,
                amount_sat,
            } => {
                let tx = decode_tx(tx_hex).map_err(|e| reject(format!("{e:#}")))?;
                if tx.txid().to_string() != *txid {
                    return Err(reject(format!("lockup txid {txid} does not match tx")));
                }
                self.funding = Some(Funding {
                    txid: txid.clone(),
                    vout: *vout,
                    amount_sat: *amount_sat,
                });
                self.lockup_tx = Some(SignedTx {
                    tx_hex: tx_hex.clone(),
                    txid: txid.clone(),
                    amount_sat: *amount_sat,
                });
            }
            Transition::PreimageKnown { preimage, .. } => {
                let bytes = decode_32(preimage).map_err(|e| reject(format!("{e:#}")))?;
                let expected = self
                    .terms
                    .payment_hash_bytes()
                    .map_err(|e| reject(format!("{e:#}")))?;
                if sha256_preimage(&bytes) != expected {
                    return Err(reject("preimage does not hash to the payment hash".into()));
                }
                self.preimage = Some(preimage.clone());
            }
            Transition::Claiming {
                tx_hex,
                txid,
                amount_sat,
            } => {
                self.claim_tx = Some(signed_tx(tx_hex, txid, *amount_sat).map_err(&reject)?);
            }
            Transition::Refunding {
                tx_hex,
                txid,
                amount_sat,
            } => {
                self.refund_tx = Some(signed_tx(tx_hex, txid, *amount_sat).map_err(&reject)?);
            }
            Transition::Settled { txid } => {
                self.resolution_txid = Some(txid.clone());
            }
            Transition::Refunded { txid } => {
                self.resolution_txid = txid.clone();
            }
            Transition::Failed { reason, txid } => {
                self.failure_reason = Some(reason.clone());
                self.resolution_txid = txid.clone();
            }
        }

        self.state = to;
        self.history.push(to);
        self.log_len += 1;
        Ok(())
    }
}

fn signed_tx(tx_hex: &str, txid: &str, amount_sat: u64) -> Result<SignedTx, String> {
    let tx = decode_tx(tx_hex).map_err(|e| format!("{e:#}"))?;
    if tx.txid().to_string() != txid {
        return Err(format!("txid {txid} does not match tx"));
    }
    Ok(SignedTx {
        tx_hex: tx_hex.to_string(),
        txid: txid.to_string(),
        amount_sat,
    })
}

/// Legal edges of the swap state machine.
pub fn allowed(direction: SwapDirection, from: SwapState, to: SwapState) -> bool {
    use SwapState::*;

    if from.is_terminal() {
        return false;
    }
    match direction {
        SwapDirection::Receive => matches!(
            (from, to),
            (Created, FundingDetected | Refunded | Failed)
                | (FundingDetected, PreimageKnown | Refunded | Failed)
                | (PreimageKnown, Claiming | Settled | Failed)
                | (Claiming, Settled | Failed)
        ),
        SwapDirection::Send => matches!(
            (from, to),
            (Created, LockedByUs | Failed)
                | (LockedByUs, PreimageKnown | Refunding | Failed)
                | (PreimageKnown, Settled)
                | (Refunding, PreimageKnown | Refunded | Failed)
        ),
    }
}

/// Content-derived swap id: the first 16 bytes of
/// `sha256(direction || payment_hash || timeout_height_be)`, hex encoded.
pub fn swap_id_for(direction: SwapDirection, payment_hash: &[u8; 32], timeout_height: u32) -> String {
    let mut engine = sha256::Hash::engine();
    engine.input(&[direction.tag()]);
    engine.input(payment_hash);
    engine.input(&timeout_height.to_be_bytes());
    let digest = sha256::Hash::from_engine(engine);
    hex::encode(&digest.to_byte_array()[..16])
}

pub fn decode_tx(tx_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(tx_hex).context("decode tx hex")?;
    encode::deserialize(&bytes).context("deserialize transaction")
}

pub fn encode_tx(tx: &Transaction) -> String {
    hex::encode(encode::serialize(tx))
}

fn decode_32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).context("decode hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
}
