//! In-memory stand-ins for the chain, the user's on-chain wallet, the
//! Lightning node and the swap provider. They share one [`FakeChain`], so
//! money moved by one of them is visible to the others.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder, PaymentSecret};
use liquid_swap_wallet::chain::{ChainClient, HistoryEntry, Utxo};
use liquid_swap_wallet::error::{ChainError, PaymentError, SwapperError};
use liquid_swap_wallet::lightning::{OutboundStatus, PaymentClient, PaymentSettled};
use liquid_swap_wallet::liquid::htlc::{self, HtlcFunding, HtlcSpec, sha256_preimage};
use liquid_swap_wallet::liquid::keys::{DerivedKey, KeyVault};
use liquid_swap_wallet::liquid::wallet::OnchainWallet;
use liquid_swap_wallet::swap::retry::RetryPolicy;
use liquid_swap_wallet::swap::{Swap, SwapState};
use liquid_swap_wallet::swapper::{
    CooperativeRefundRequest, CooperativeRefundResponse, ReverseSwapRequest, ReverseSwapResponse,
    SubmarineSwapRequest, SubmarineSwapResponse, SwapProvider,
};
use liquid_swap_wallet::{Collaborators, Config, ConnectRequest, Network, Wallet};
use lwk_wollet::elements::bitcoin::secp256k1::PublicKey;
use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::{
    Address, AddressParams, AssetId, LockTime, OutPoint, Script, Sequence, Transaction, TxIn,
    TxInWitness, TxOut, TxOutWitness, Txid,
};
use tokio::sync::broadcast;

use super::wait::wait_for;

pub const WALLET_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const PROVIDER_MNEMONIC: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";

pub const LOCKUP_FEE_SAT: u64 = 200;

pub fn policy_asset() -> AssetId {
    Network::Regtest.policy_asset()
}

fn explicit_output(script_pubkey: Script, amount_sat: u64) -> TxOut {
    TxOut {
        asset: Asset::Explicit(policy_asset()),
        value: Value::Explicit(amount_sat),
        nonce: Nonce::Null,
        script_pubkey,
        witness: TxOutWitness::default(),
    }
}

fn input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        is_pegin: false,
        script_sig: Script::new(),
        sequence: Sequence::MAX,
        asset_issuance: Default::default(),
        witness: TxInWitness::default(),
    }
}

/// Moves `from` to `to`, paying no fee.
pub fn transfer(from: OutPoint, to: Script, amount_sat: u64) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![input(from)],
        output: vec![explicit_output(to, amount_sat)],
    }
}

struct ChainState {
    tip: u32,
    txs: Vec<(Transaction, Option<u32>)>,
    broadcasts: Vec<Txid>,
    reject_broadcasts: u32,
    coinbase_counter: u32,
}

impl ChainState {
    fn find(&self, txid: &Txid) -> Option<&(Transaction, Option<u32>)> {
        self.txs.iter().find(|(tx, _)| tx.txid() == *txid)
    }

    fn prevout_script(&self, outpoint: &OutPoint) -> Option<Script> {
        self.find(&outpoint.txid)
            .and_then(|(tx, _)| tx.output.get(outpoint.vout as usize))
            .map(|out| out.script_pubkey.clone())
    }

    fn spender_of(&self, outpoint: &OutPoint) -> Option<&Transaction> {
        self.txs
            .iter()
            .map(|(tx, _)| tx)
            .find(|tx| tx.input.iter().any(|i| i.previous_output == *outpoint))
    }

    fn insert(&mut self, tx: Transaction) -> Result<Txid, ChainError> {
        let txid = tx.txid();
        if self.find(&txid).is_some() {
            return Ok(txid);
        }
        for i in &tx.input {
            if self.spender_of(&i.previous_output).is_some() {
                return Err(ChainError::RejectedByNetwork(format!(
                    "txn-mempool-conflict: {} already spent",
                    i.previous_output
                )));
            }
        }
        self.txs.push((tx, None));
        Ok(txid)
    }
}

/// Chain with a mempool and instant mining. Transactions are not validated
/// beyond double spends.
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(tip: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                tip,
                txs: Vec::new(),
                broadcasts: Vec::new(),
                reject_broadcasts: 0,
                coinbase_counter: 0,
            }),
        })
    }

    pub fn tip(&self) -> u32 {
        self.state.lock().unwrap().tip
    }

    /// Confirms the mempool in the next block and advances the tip by `blocks`.
    pub fn mine(&self, blocks: u32) {
        let mut state = self.state.lock().unwrap();
        let height = state.tip + 1;
        for (_, h) in state.txs.iter_mut().filter(|(_, h)| h.is_none()) {
            *h = Some(height);
        }
        state.tip += blocks;
    }

    pub fn mine_to(&self, height: u32) {
        let tip = self.tip();
        if height > tip {
            self.mine(height - tip);
        }
    }

    /// Pays `amount_sat` to `script` from nowhere.
    pub fn fund(&self, script: Script, amount_sat: u64) -> OutPoint {
        let mut state = self.state.lock().unwrap();
        state.coinbase_counter += 1;
        let mut seed = [0xeeu8; 32];
        seed[..4].copy_from_slice(&state.coinbase_counter.to_be_bytes());
        let tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![input(OutPoint {
                txid: Txid::from_byte_array(seed),
                vout: 0,
            })],
            output: vec![explicit_output(script, amount_sat)],
        };
        let txid = state.insert(tx).expect("fresh funding tx");
        OutPoint { txid, vout: 0 }
    }

    /// Adds a counterparty transaction to the mempool.
    pub fn submit(&self, tx: Transaction) -> Result<Txid> {
        Ok(self.state.lock().unwrap().insert(tx)?)
    }

    /// Transactions the wallet broadcast, in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    /// Rejects the next `count` broadcasts.
    pub fn reject_broadcasts(&self, count: u32) {
        self.state.lock().unwrap().reject_broadcasts = count;
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.state.lock().unwrap().find(txid).is_some()
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Transaction> {
        self.state.lock().unwrap().spender_of(outpoint).cloned()
    }

    /// Unspent explicit outputs paying to `script`.
    pub fn unspent(&self, script: &Script) -> Vec<Utxo> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for (tx, height) in &state.txs {
            let txid = tx.txid();
            for (vout, output) in tx.output.iter().enumerate() {
                if output.script_pubkey != *script {
                    continue;
                }
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                if state.spender_of(&outpoint).is_some() {
                    continue;
                }
                let (Some(amount_sat), Some(asset)) =
                    (output.value.explicit(), output.asset.explicit())
                else {
                    continue;
                };
                out.push(Utxo {
                    outpoint,
                    amount_sat,
                    asset,
                    script_pubkey: output.script_pubkey.clone(),
                    height: *height,
                    confirmations: 0,
                });
            }
        }
        out
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn tip_height(&self) -> Result<u32, ChainError> {
        Ok(self.tip())
    }

    async fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .txs
            .iter()
            .filter(|(tx, _)| {
                tx.output.iter().any(|o| o.script_pubkey == *script)
                    || tx
                        .input
                        .iter()
                        .any(|i| state.prevout_script(&i.previous_output).as_ref() == Some(script))
            })
            .map(|(tx, height)| HistoryEntry {
                txid: tx.txid(),
                height: *height,
            })
            .collect())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        self.state
            .lock()
            .unwrap()
            .find(txid)
            .map(|(tx, _)| tx.clone())
            .ok_or_else(|| ChainError::Backend(format!("unknown transaction {txid}")))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_broadcasts > 0 {
            state.reject_broadcasts -= 1;
            return Err(ChainError::RejectedByNetwork("min relay fee not met".into()));
        }
        let txid = state.insert(tx.clone())?;
        state.broadcasts.push(txid);
        Ok(txid)
    }
}

/// The user's on-chain wallet: one address, coins read straight off the chain.
pub struct FakeWallet {
    chain: Arc<FakeChain>,
    address: Address,
    fail_sync: AtomicBool,
}

impl FakeWallet {
    pub fn new(chain: Arc<FakeChain>) -> Arc<Self> {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x11; 32]).expect("valid key");
        let pubkey = lwk_wollet::elements::bitcoin::PublicKey::new(key.public_key(&secp));
        Arc::new(Self {
            chain,
            address: Address::p2wpkh(&pubkey, None, &AddressParams::ELEMENTS),
            fail_sync: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn fund(&self, amount_sat: u64) -> OutPoint {
        self.chain.fund(self.address.script_pubkey(), amount_sat)
    }

    pub fn fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OnchainWallet for FakeWallet {
    async fn sync(&self) -> Result<()> {
        anyhow::ensure!(!self.fail_sync.load(Ordering::SeqCst), "electrum unreachable");
        Ok(())
    }

    async fn receive_address(&self) -> Result<Address> {
        Ok(self.address.clone())
    }

    async fn utxos(&self) -> Result<Vec<Utxo>> {
        Ok(self.chain.unspent(&self.address.script_pubkey()))
    }

    async fn build_lockup_tx(&self, address: &Address, amount_sat: u64) -> Result<Transaction> {
        let needed = amount_sat + LOCKUP_FEE_SAT;
        let mut selected = Vec::new();
        let mut total = 0;
        for utxo in self.chain.unspent(&self.address.script_pubkey()) {
            if total >= needed {
                break;
            }
            total += utxo.amount_sat;
            selected.push(utxo.outpoint);
        }
        anyhow::ensure!(
            total >= needed,
            "insufficient funds: have {total} sat, need {needed} sat"
        );

        let mut output = vec![explicit_output(address.script_pubkey(), amount_sat)];
        if total > needed {
            output.push(explicit_output(self.address.script_pubkey(), total - needed));
        }
        output.push(TxOut::new_fee(LOCKUP_FEE_SAT, policy_asset()));
        Ok(Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: selected.into_iter().map(input).collect(),
            output,
        })
    }
}

pub fn make_invoice(payment_hash: [u8; 32], amount_sat: u64) -> String {
    let secp = Secp256k1::new();
    let node_key = SecretKey::from_slice(&[0x42; 32]).expect("valid key");
    InvoiceBuilder::new(Currency::Regtest)
        .description("swap".to_string())
        .payment_hash(sha256::Hash::from_byte_array(payment_hash))
        .payment_secret(PaymentSecret([7u8; 32]))
        .amount_milli_satoshis(amount_sat * 1000)
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &node_key))
        .expect("build invoice")
        .to_string()
}

fn invoice_terms(invoice: &str) -> Result<([u8; 32], u64)> {
    let invoice: Bolt11Invoice = invoice
        .parse()
        .map_err(|e| anyhow::anyhow!("parse invoice: {e:?}"))?;
    let amount_sat = invoice.amount_milli_satoshis().context("invoice amount")? / 1000;
    Ok((invoice.payment_hash().to_byte_array(), amount_sat))
}

struct ProviderSwap {
    spec: HtlcSpec,
    key_index: u32,
}

struct SwapperState {
    next_key: u32,
    next_id: u32,
    preimages: HashMap<[u8; 32], [u8; 32]>,
    swaps: HashMap<String, ProviderSwap>,
}

/// A swap provider that plays by the rules unless told otherwise.
pub struct FakeSwapper {
    chain: Arc<FakeChain>,
    vault: KeyVault,
    state: Mutex<SwapperState>,
    pub fee_sat: AtomicU64,
    pub timeout_blocks: AtomicU32,
    tamper_address: AtomicBool,
    unavailable: AtomicBool,
    cooperative: Mutex<Cooperation>,
    refund_requests: AtomicU32,
}

/// How the provider answers cooperative refund requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooperation {
    Sign,
    Refuse,
    /// Signs a transaction other than the one it was sent.
    Forge,
}

impl FakeSwapper {
    pub fn new(chain: Arc<FakeChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            vault: KeyVault::from_mnemonic(PROVIDER_MNEMONIC, Network::Regtest)
                .expect("provider mnemonic"),
            state: Mutex::new(SwapperState {
                next_key: 0,
                next_id: 0,
                preimages: HashMap::new(),
                swaps: HashMap::new(),
            }),
            fee_sat: AtomicU64::new(250),
            timeout_blocks: AtomicU32::new(40),
            tamper_address: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            cooperative: Mutex::new(Cooperation::Sign),
            refund_requests: AtomicU32::new(0),
        })
    }

    pub fn tamper_address(&self, tamper: bool) {
        self.tamper_address.store(tamper, Ordering::SeqCst);
    }

    pub fn cooperate(&self, cooperation: Cooperation) {
        *self.cooperative.lock().unwrap() = cooperation;
    }

    pub fn refund_requests(&self) -> u32 {
        self.refund_requests.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// An invoice whose preimage only this provider knows; what a payee would hand the user.
    pub fn invoice(&self, amount_sat: u64) -> (String, [u8; 32]) {
        let preimage = self.fresh_preimage();
        let hash = sha256_preimage(&preimage);
        (make_invoice(hash, amount_sat), preimage)
    }

    pub fn preimage_for(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        self.state.lock().unwrap().preimages.get(payment_hash).copied()
    }

    fn fresh_preimage(&self) -> [u8; 32] {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let preimage = sha256::Hash::hash(&state.next_id.to_be_bytes()).to_byte_array();
        state.preimages.insert(sha256_preimage(&preimage), preimage);
        preimage
    }

    fn register(&self, spec: HtlcSpec, key_index: u32) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.swaps.insert(id.clone(), ProviderSwap { spec, key_index });
        id
    }

    fn next_key(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        let index = state.next_key;
        state.next_key += 1;
        index
    }

    fn spec(&self, provider_swap_id: &str) -> Result<(HtlcSpec, u32)> {
        let state = self.state.lock().unwrap();
        let swap = state
            .swaps
            .get(provider_swap_id)
            .with_context(|| format!("unknown provider swap {provider_swap_id}"))?;
        Ok((swap.spec.clone(), swap.key_index))
    }

    fn address_for(&self, spec: &HtlcSpec) -> String {
        if self.tamper_address.load(Ordering::SeqCst) {
            let mut other = spec.clone();
            other.timeout_height += 1;
            return other.p2wsh_address(&AddressParams::ELEMENTS).to_string();
        }
        spec.p2wsh_address(&AddressParams::ELEMENTS).to_string()
    }

    /// Locks `amount_sat` to the script of a reverse swap.
    pub fn lock_reverse(&self, provider_swap_id: &str, amount_sat: u64) -> Result<OutPoint> {
        let (spec, _) = self.spec(provider_swap_id)?;
        Ok(self.chain.fund(spec.script_pubkey(), amount_sat))
    }

    /// Reclaims a reverse swap lockup through the timeout branch.
    pub fn refund_reverse(&self, provider_swap_id: &str) -> Result<Txid> {
        let (spec, key_index) = self.spec(provider_swap_id)?;
        let funding = self.swap_output(&spec)?;
        let key = self.vault.swap_key(key_index)?;
        let destination = payout_address(&key);
        let tx = htlc::refund_tx(&spec, &funding, &destination, &self.vault, &key, 100)?;
        self.chain.submit(tx)
    }

    /// Claims the user's submarine lockup, revealing the preimage on chain.
    pub fn claim_submarine(&self, provider_swap_id: &str) -> Result<Txid> {
        let (spec, key_index) = self.spec(provider_swap_id)?;
        let preimage = self
            .preimage_for(&spec.payment_hash)
            .context("provider does not know the preimage")?;
        let funding = self.swap_output(&spec)?;
        let key = self.vault.swap_key(key_index)?;
        let destination = payout_address(&key);
        let tx = htlc::claim_tx(&spec, &funding, &destination, &self.vault, &key, preimage, 100)?;
        self.chain.submit(tx)
    }

    fn swap_output(&self, spec: &HtlcSpec) -> Result<HtlcFunding> {
        let utxo = self
            .chain
            .unspent(&spec.script_pubkey())
            .into_iter()
            .next()
            .context("no unspent output on swap script")?;
        Ok(HtlcFunding {
            txid: utxo.outpoint.txid,
            vout: utxo.outpoint.vout,
            amount_sat: utxo.amount_sat,
            policy_asset: utxo.asset,
        })
    }

    fn check_available(&self) -> Result<(), SwapperError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SwapperError::Api {
                status: 503,
                message: "maintenance".into(),
            });
        }
        Ok(())
    }
}

fn payout_address(key: &DerivedKey) -> Address {
    let pubkey = lwk_wollet::elements::bitcoin::PublicKey::new(key.public_key());
    Address::p2wpkh(&pubkey, None, &AddressParams::ELEMENTS)
}

fn parse_pubkey(hex_key: &str) -> Result<PublicKey, SwapperError> {
    let bytes = hex::decode(hex_key).map_err(|e| SwapperError::Parse(e.to_string()))?;
    PublicKey::from_slice(&bytes).map_err(|e| SwapperError::Parse(e.to_string()))
}

#[async_trait]
impl SwapProvider for FakeSwapper {
    async fn create_reverse_swap(
        &self,
        request: &ReverseSwapRequest,
    ) -> Result<ReverseSwapResponse, SwapperError> {
        self.check_available()?;
        let claim_pubkey = parse_pubkey(&request.claim_public_key)?;
        let preimage = self.fresh_preimage();
        let payment_hash = sha256_preimage(&preimage);
        let key_index = self.next_key();
        let refund_key = self
            .vault
            .swap_key(key_index)
            .map_err(|e| SwapperError::Http(e.to_string()))?;

        let spec = HtlcSpec {
            payment_hash,
            claim_pubkey,
            refund_pubkey: refund_key.public_key(),
            timeout_height: self.chain.tip() + self.timeout_blocks.load(Ordering::SeqCst),
        };
        let lockup_address = self.address_for(&spec);
        let timeout_block_height = spec.timeout_height;
        let id = self.register(spec, key_index);

        Ok(ReverseSwapResponse {
            id,
            invoice: make_invoice(payment_hash, request.invoice_amount),
            refund_public_key: hex::encode(refund_key.public_key().serialize()),
            timeout_block_height,
            lockup_address,
            onchain_amount: request.invoice_amount - self.fee_sat.load(Ordering::SeqCst),
        })
    }

    async fn create_submarine_swap(
        &self,
        request: &SubmarineSwapRequest,
    ) -> Result<SubmarineSwapResponse, SwapperError> {
        self.check_available()?;
        let refund_pubkey = parse_pubkey(&request.refund_public_key)?;
        let (payment_hash, amount_sat) =
            invoice_terms(&request.invoice).map_err(|e| SwapperError::Parse(format!("{e:#}")))?;
        let key_index = self.next_key();
        let claim_key = self
            .vault
            .swap_key(key_index)
            .map_err(|e| SwapperError::Http(e.to_string()))?;

        let spec = HtlcSpec {
            payment_hash,
            claim_pubkey: claim_key.public_key(),
            refund_pubkey,
            timeout_height: self.chain.tip() + self.timeout_blocks.load(Ordering::SeqCst),
        };
        let address = self.address_for(&spec);
        let timeout_block_height = spec.timeout_height;
        let id = self.register(spec, key_index);

        Ok(SubmarineSwapResponse {
            id,
            claim_public_key: hex::encode(claim_key.public_key().serialize()),
            timeout_block_height,
            expected_amount: amount_sat + self.fee_sat.load(Ordering::SeqCst),
            address,
        })
    }

    async fn sign_cooperative_refund(
        &self,
        swap_id: &str,
        request: &CooperativeRefundRequest,
    ) -> Result<CooperativeRefundResponse, SwapperError> {
        self.refund_requests.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let cooperation = *self.cooperative.lock().unwrap();
        if cooperation == Cooperation::Refuse {
            return Err(SwapperError::Api {
                status: 400,
                message: "swap is not eligible for a cooperative refund".into(),
            });
        }

        let bad_request = |e: anyhow::Error| SwapperError::Api {
            status: 400,
            message: format!("{e:#}"),
        };
        let (spec, key_index) = self.spec(swap_id).map_err(bad_request)?;
        let funding = self.swap_output(&spec).map_err(bad_request)?;
        let tx: Transaction = hex::decode(&request.transaction)
            .context("decode transaction hex")
            .and_then(|bytes| {
                lwk_wollet::elements::encode::deserialize(&bytes).context("decode transaction")
            })
            .map_err(bad_request)?;
        let key = self
            .vault
            .swap_key(key_index)
            .map_err(|e| SwapperError::Http(e.to_string()))?;
        let mut signed = tx;
        if cooperation == Cooperation::Forge {
            signed.output[0].value = Value::Explicit(1);
        }
        let signature = htlc::cooperative_signature(&signed, &spec, &funding, &self.vault, &key)
            .map_err(bad_request)?;
        Ok(CooperativeRefundResponse {
            signature: hex::encode(signature),
        })
    }
}

/// Lightning node double. Payments to the provider's invoices complete
/// immediately unless `hold` is set; held payments complete on `release`.
pub struct FakePayments {
    swapper: Arc<FakeSwapper>,
    settled: broadcast::Sender<PaymentSettled>,
    channel_msat: AtomicU64,
    hold: AtomicBool,
    paid: Mutex<Vec<String>>,
    cltv_limits: Mutex<Vec<u32>>,
    pending: Mutex<HashMap<[u8; 32], u64>>,
    failed: Mutex<Vec<[u8; 32]>>,
    completed: Mutex<HashMap<[u8; 32], [u8; 32]>>,
}

impl FakePayments {
    pub fn new(swapper: Arc<FakeSwapper>, channel_sat: u64) -> Arc<Self> {
        let (settled, _) = broadcast::channel(64);
        Arc::new(Self {
            swapper,
            settled,
            channel_msat: AtomicU64::new(channel_sat * 1000),
            hold: AtomicBool::new(false),
            paid: Mutex::new(Vec::new()),
            cltv_limits: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            failed: Mutex::new(Vec::new()),
            completed: Mutex::new(HashMap::new()),
        })
    }

    pub fn hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Invoices passed to `pay_invoice`, including repeats.
    pub fn paid(&self) -> Vec<String> {
        self.paid.lock().unwrap().clone()
    }

    /// `max_cltv_expiry_delta` of every `pay_invoice` call, in order.
    pub fn cltv_limits(&self) -> Vec<u32> {
        self.cltv_limits.lock().unwrap().clone()
    }

    /// Fails a held payment; the channel keeps its balance.
    pub fn fail(&self, payment_hash: &[u8; 32]) -> Result<()> {
        self.pending
            .lock()
            .unwrap()
            .remove(payment_hash)
            .context("no pending payment for hash")?;
        self.failed.lock().unwrap().push(*payment_hash);
        Ok(())
    }

    pub fn channel_sat(&self) -> u64 {
        self.channel_msat.load(Ordering::SeqCst) / 1000
    }

    /// Completes a held payment and emits the settle callback, again if it
    /// already completed.
    pub fn release(&self, payment_hash: &[u8; 32]) -> Result<[u8; 32]> {
        let preimage = self
            .swapper
            .preimage_for(payment_hash)
            .context("no preimage for payment hash")?;
        if let Some(amount_sat) = self.pending.lock().unwrap().remove(payment_hash) {
            self.channel_msat
                .fetch_sub(amount_sat * 1000, Ordering::SeqCst);
        }
        self.completed
            .lock()
            .unwrap()
            .insert(*payment_hash, preimage);
        let _ = self.settled.send(PaymentSettled {
            payment_hash: *payment_hash,
            preimage,
        });
        Ok(preimage)
    }
}

#[async_trait]
impl PaymentClient for FakePayments {
    async fn pay_invoice(
        &self,
        invoice: &str,
        max_cltv_expiry_delta: u32,
    ) -> Result<(), PaymentError> {
        let (payment_hash, amount_sat) =
            invoice_terms(invoice).map_err(|e| PaymentError::Rejected(format!("{e:#}")))?;
        self.paid.lock().unwrap().push(invoice.to_string());
        self.cltv_limits.lock().unwrap().push(max_cltv_expiry_delta);
        if self.completed.lock().unwrap().contains_key(&payment_hash) {
            return Err(PaymentError::Rejected("duplicate payment".into()));
        }
        self.pending.lock().unwrap().insert(payment_hash, amount_sat);
        if !self.hold.load(Ordering::SeqCst) {
            self.release(&payment_hash)
                .map_err(|e| PaymentError::Backend(format!("{e:#}")))?;
        }
        Ok(())
    }

    async fn payment_status(
        &self,
        payment_hash: &[u8; 32],
    ) -> Result<OutboundStatus, PaymentError> {
        if let Some(preimage) = self.completed.lock().unwrap().get(payment_hash) {
            return Ok(OutboundStatus::Succeeded {
                preimage: *preimage,
            });
        }
        if self.pending.lock().unwrap().contains_key(payment_hash) {
            return Ok(OutboundStatus::Pending);
        }
        if self.failed.lock().unwrap().contains(payment_hash) {
            return Ok(OutboundStatus::Failed);
        }
        Ok(OutboundStatus::Unknown)
    }

    async fn channel_balance_msat(&self) -> Result<u64, PaymentError> {
        Ok(self.channel_msat.load(Ordering::SeqCst))
    }

    fn subscribe_settled(&self) -> broadcast::Receiver<PaymentSettled> {
        self.settled.subscribe()
    }
}

/// One wallet's world: a chain, the user's coins, a Lightning node and a
/// provider, plus a data dir that outlives reconnects.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub wallet: Arc<FakeWallet>,
    pub payments: Arc<FakePayments>,
    pub swapper: Arc<FakeSwapper>,
    pub data_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Result<Self> {
        let chain = FakeChain::new(100);
        let wallet = FakeWallet::new(chain.clone());
        let swapper = FakeSwapper::new(chain.clone());
        let payments = FakePayments::new(swapper.clone(), 1_000_000);
        Ok(Self {
            chain,
            wallet,
            payments,
            swapper,
            data_dir: tempfile::tempdir().context("create tempdir")?,
        })
    }

    pub fn config(&self) -> Config {
        let fast = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 20,
        };
        Config {
            data_dir: self.data_dir.path().to_path_buf(),
            funding_confirmations: 2,
            claim_safety_blocks: 5,
            max_timeout_blocks: 100,
            chain_poll_interval_secs: 0,
            broadcast_retry: fast,
            refund_retry: fast,
            ..Config::default_for(Network::Regtest)
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            chain: self.chain.clone(),
            wallet: self.wallet.clone(),
            payments: self.payments.clone(),
            provider: self.swapper.clone(),
        }
    }

    pub async fn connect(&self) -> Result<Wallet> {
        let request = ConnectRequest {
            config: self.config(),
            mnemonic: WALLET_MNEMONIC.to_string(),
        };
        Wallet::connect_with(request, self.collaborators())
            .await
            .context("connect wallet")
    }
}

/// Polls the chain until swap `swap_id` has passed through `state`. A swap
/// that moves on within one poll still counts.
pub async fn wait_for_state(wallet: &Wallet, swap_id: &str, state: SwapState) -> Result<Swap> {
    wait_for(
        &format!("swap {swap_id} to reach {state:?}"),
        Duration::from_secs(10),
        || async {
            wallet.sync().await?;
            let swap = wallet.get_swap(swap_id).await?;
            if swap.history.contains(&state) {
                return Ok(Some(swap));
            }
            anyhow::ensure!(
                !swap.is_terminal(),
                "swap {swap_id} ended in {:?} ({:?}) instead of {state:?}",
                swap.state,
                swap.failure_reason
            );
            Ok(None)
        },
    )
    .await
}
