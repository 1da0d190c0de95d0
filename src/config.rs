use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use lwk_wollet::ElementsNetwork;
use lwk_wollet::elements::{AddressParams, AssetId};
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;
use crate::swap::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn elements_network(self) -> ElementsNetwork {
        match self {
            Network::Mainnet => ElementsNetwork::Liquid,
            Network::Testnet => ElementsNetwork::LiquidTestnet,
            Network::Regtest => ElementsNetwork::default_regtest(),
        }
    }

    pub fn address_params(self) -> &'static AddressParams {
        self.elements_network().address_params()
    }

    pub fn policy_asset(self) -> AssetId {
        self.elements_network().policy_asset()
    }

    /// SLIP-44 coin type used in the wallet's derivation paths.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Mainnet => 1776,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    pub fn is_mainnet(self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

/// Wallet configuration. Loaded from JSON or built with [`Config::default_for`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: Network,
    pub data_dir: PathBuf,

    pub electrum_url: String,
    pub electrum_tls: bool,
    pub ldk_rest_addr: String,
    pub swapper_url: String,

    /// Depth a swap lockup must reach before it is trusted as spendable.
    pub funding_confirmations: u32,
    /// A receive swap is not paid over Lightning when its timeout is closer than this.
    pub claim_safety_blocks: u32,
    /// Longest lock we accept on our own funds for a send swap.
    pub max_timeout_blocks: u32,
    /// Upper bound for the counterparty fee, parts per million of the amount.
    pub max_swap_fee_ppm: u64,

    pub claim_fee_sat: u64,
    pub refund_fee_sat: u64,

    /// Background chain polling interval; `0` disables the loop and callers drive `Wallet::sync`.
    pub chain_poll_interval_secs: u64,
    pub payment_poll_interval_ms: u64,

    /// Retry policy for claim and lockup broadcasts.
    pub broadcast_retry: RetryPolicy,
    /// Retry policy for refund broadcasts.
    pub refund_retry: RetryPolicy,
}

impl Config {
    pub fn default_for(network: Network) -> Self {
        let (electrum_url, electrum_tls, swapper_url) = match network {
            Network::Mainnet => (
                "blockstream.info:995",
                true,
                "https://api.boltz.exchange",
            ),
            Network::Testnet => (
                "blockstream.info:465",
                true,
                "https://api.testnet.boltz.exchange",
            ),
            Network::Regtest => ("127.0.0.1:50001", false, "http://127.0.0.1:9001"),
        };

        Self {
            network,
            data_dir: PathBuf::from(".data"),
            electrum_url: electrum_url.to_string(),
            electrum_tls,
            ldk_rest_addr: "127.0.0.1:3002".to_string(),
            swapper_url: swapper_url.to_string(),
            funding_confirmations: match network {
                Network::Mainnet => 2,
                Network::Testnet | Network::Regtest => 1,
            },
            claim_safety_blocks: 10,
            max_timeout_blocks: 2 * 1440,
            max_swap_fee_ppm: 50_000,
            claim_fee_sat: 150,
            refund_fee_sat: 150,
            chain_poll_interval_secs: 10,
            payment_poll_interval_ms: 500,
            broadcast_retry: RetryPolicy::default(),
            refund_retry: RetryPolicy {
                max_retries: 8,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("swaps.sqlite3")
    }

    pub fn wallet_dir(&self) -> PathBuf {
        self.data_dir.join("wollet")
    }

    pub fn chain_poll_interval(&self) -> Option<Duration> {
        (self.chain_poll_interval_secs > 0)
            .then(|| Duration::from_secs(self.chain_poll_interval_secs))
    }

    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.funding_confirmations == 0 && self.network.is_mainnet() {
            return Err(ConnectError::InvalidConfig(
                "funding_confirmations must be > 0 on mainnet".into(),
            ));
        }
        if self.max_timeout_blocks <= self.claim_safety_blocks {
            return Err(ConnectError::InvalidConfig(format!(
                "max_timeout_blocks ({}) must exceed claim_safety_blocks ({})",
                self.max_timeout_blocks, self.claim_safety_blocks
            )));
        }
        if self.max_swap_fee_ppm > 1_000_000 {
            return Err(ConnectError::InvalidConfig(
                "max_swap_fee_ppm must be <= 1000000".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_for(Network::Testnet)
    }
}
