use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use lwk_common::{DescriptorBlindingKey, Signer as _, Singlesig, singlesig_desc};
use lwk_signer::SwSigner;
use lwk_wollet::{
    ElectrumClient, ElementsNetwork, Wollet, WolletDescriptor,
    elements::{Address, AssetId, Transaction},
    full_scan_with_electrum_client,
};

use crate::chain::Utxo;
use crate::chain::electrum::electrum_client;
use crate::config::Network;

/// The user's own Liquid wallet, as seen by the swap engine.
#[async_trait]
pub trait OnchainWallet: Send + Sync {
    async fn sync(&self) -> Result<()>;

    /// Fresh address for claim and refund outputs.
    async fn receive_address(&self) -> Result<Address>;

    /// Unspent wallet outputs; `confirmations` is filled in by the caller.
    async fn utxos(&self) -> Result<Vec<Utxo>>;

    /// Signed transaction paying `amount_sat` explicit L-BTC to `address`. Not broadcast.
    async fn build_lockup_tx(&self, address: &Address, amount_sat: u64) -> Result<Transaction>;
}

pub struct LiquidWallet {
    signer: SwSigner,
    wollet: Wollet,
    client: ElectrumClient,
    network: ElementsNetwork,
}

impl LiquidWallet {
    pub fn new(
        mnemonic: &str,
        network: Network,
        electrum_url: &str,
        electrum_tls: bool,
        persist_dir: &Path,
    ) -> Result<Self> {
        let signer = SwSigner::new(mnemonic, network.is_mainnet()).context("create SwSigner")?;
        let desc_str = singlesig_desc(
            &signer,
            Singlesig::Wpkh,
            DescriptorBlindingKey::Slip77,
            network.is_mainnet(),
        )
        .map_err(|e| anyhow::anyhow!("build wallet descriptor: {e}"))?;
        let descriptor: WolletDescriptor = desc_str.parse().context("parse wollet descriptor")?;

        std::fs::create_dir_all(persist_dir)
            .with_context(|| format!("create wallet dir {}", persist_dir.display()))?;
        let elements_network = network.elements_network();
        let wollet = Wollet::with_fs_persist(elements_network, descriptor, persist_dir)
            .context("create wollet")?;

        let client =
            electrum_client(electrum_url, electrum_tls).context("create electrum client")?;

        Ok(Self {
            signer,
            wollet,
            client,
            network: elements_network,
        })
    }

    pub fn policy_asset(&self) -> AssetId {
        self.network.policy_asset()
    }

    pub fn sync(&mut self) -> Result<()> {
        full_scan_with_electrum_client(&mut self.wollet, &mut self.client)
            .context("sync wollet via electrum")
    }

    pub fn next_address(&self) -> Result<Address> {
        Ok(self
            .wollet
            .address(None)
            .context("get wollet address")?
            .address()
            .clone())
    }

    pub fn utxos(&self) -> Result<Vec<Utxo>> {
        let utxos = self.wollet.utxos().context("list wollet utxos")?;
        Ok(utxos
            .into_iter()
            .map(|u| Utxo {
                outpoint: u.outpoint,
                amount_sat: u.unblinded.value,
                asset: u.unblinded.asset,
                script_pubkey: u.script_pubkey,
                height: u.height,
                confirmations: 0,
            })
            .collect())
    }

    pub fn build_lockup(&mut self, address: &Address, amount_sat: u64) -> Result<Transaction> {
        self.sync().context("sync wallet before building lockup tx")?;

        let policy_asset = self.policy_asset();
        let mut pset = self
            .wollet
            .tx_builder()
            .add_explicit_recipient(address, amount_sat, policy_asset)
            .context("add swap lockup output")?
            .finish()
            .context("finalize lockup pset")?;

        let sigs = self.signer.sign(&mut pset).context("sign lockup pset")?;
        anyhow::ensure!(sigs > 0, "no signatures added for lockup");

        self.wollet
            .finalize(&mut pset)
            .context("finalize lockup tx")
    }
}

/// [`OnchainWallet`] backed by an lwk `Wollet` synced over Electrum.
#[derive(Clone)]
pub struct LwkOnchainWallet {
    inner: Arc<Mutex<LiquidWallet>>,
}

impl LwkOnchainWallet {
    pub fn new(wallet: LiquidWallet) -> Self {
        Self {
            inner: Arc::new(Mutex::new(wallet)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LiquidWallet) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut wallet = inner.lock().expect("wallet mutex poisoned");
            f(&mut *wallet)
        })
        .await
        .context("join wallet task")?
    }
}

#[async_trait]
impl OnchainWallet for LwkOnchainWallet {
    async fn sync(&self) -> Result<()> {
        self.blocking(|w| w.sync()).await
    }

    async fn receive_address(&self) -> Result<Address> {
        self.blocking(|w| w.next_address()).await
    }

    async fn utxos(&self) -> Result<Vec<Utxo>> {
        self.blocking(|w| w.utxos()).await
    }

    async fn build_lockup_tx(&self, address: &Address, amount_sat: u64) -> Result<Transaction> {
        let address = address.clone();
        self.blocking(move |w| w.build_lockup(&address, amount_sat))
            .await
    }
}
