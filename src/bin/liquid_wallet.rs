use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use liquid_swap_wallet::swap::Swap;
use liquid_swap_wallet::swap::engine::SwapUpdate;
use liquid_swap_wallet::{Config, ConnectRequest, GetInfoRequest, Network, Wallet};
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    network: Option<NetworkArg>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    electrum_url: Option<String>,

    #[arg(long)]
    ldk_rest_addr: Option<String>,

    #[arg(long)]
    swapper_url: Option<String>,

    #[arg(long, env = "LIQUID_WALLET_MNEMONIC", hide_env_values = true)]
    mnemonic: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum NetworkArg {
    Mainnet,
    Testnet,
    Regtest,
}

impl From<NetworkArg> for Network {
    fn from(value: NetworkArg) -> Self {
        match value {
            NetworkArg::Mainnet => Network::Mainnet,
            NetworkArg::Testnet => Network::Testnet,
            NetworkArg::Regtest => Network::Regtest,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    GetInfo {
        /// Poll the chain before reporting.
        #[arg(long)]
        scan: bool,
    },
    Receive {
        #[arg(long)]
        amount_sat: u64,

        /// Keep the wallet running until the swap finishes or this many seconds pass.
        #[arg(long, default_value_t = 0)]
        wait_secs: u64,
    },
    Send {
        #[arg(long)]
        invoice: String,

        #[arg(long, default_value_t = 0)]
        wait_secs: u64,
    },
    ListSwaps,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default_for(self.network.map(Into::into).unwrap_or(Network::Testnet)),
        };
        if let Some(network) = self.network {
            config.network = network.into();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(url) = &self.electrum_url {
            config.electrum_url = url.clone();
        }
        if let Some(addr) = &self.ldk_rest_addr {
            config.ldk_rest_addr = addr.clone();
        }
        if let Some(url) = &self.swapper_url {
            config.swapper_url = url.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    liquid_swap_wallet::logging::init().ok();
    let args = Args::parse();
    let config = args.load_config()?;

    let wallet = Wallet::connect(ConnectRequest {
        config,
        mnemonic: args.mnemonic.clone(),
    })
    .await
    .context("connect wallet")?;

    let result = run(&wallet, args.command).await;
    wallet.disconnect().await;
    let out = result?;

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(wallet: &Wallet, command: Command) -> Result<serde_json::Value> {
    let out = match command {
        Command::GetInfo { scan } => {
            let info = wallet
                .get_info(GetInfoRequest { with_scan: scan })
                .await
                .context("GetInfo")?;
            serde_json::to_value(info)?
        }
        Command::Receive {
            amount_sat,
            wait_secs,
        } => {
            let swap = wallet
                .receive_payment(amount_sat)
                .await
                .context("receive payment")?;
            let swap = wait_for_swap(wallet, swap, wait_secs).await?;
            swap_json(&swap)
        }
        Command::Send { invoice, wait_secs } => {
            let swap = wallet
                .send_payment(&invoice)
                .await
                .context("send payment")?;
            let swap = wait_for_swap(wallet, swap, wait_secs).await?;
            swap_json(&swap)
        }
        Command::ListSwaps => {
            let swaps = wallet.list_swaps().await.context("list swaps")?;
            json!(swaps.iter().map(swap_json).collect::<Vec<_>>())
        }
    };
    Ok(out)
}

async fn wait_for_swap(wallet: &Wallet, swap: Swap, wait_secs: u64) -> Result<Swap> {
    if wait_secs == 0 || swap.is_terminal() {
        return Ok(swap);
    }
    let mut updates = wallet.subscribe_updates();
    let deadline = tokio::time::sleep(Duration::from_secs(wait_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            update = updates.recv() => match update {
                Ok(SwapUpdate::StateChanged { swap_id, state }) if swap_id == swap.id => {
                    if state.is_terminal() {
                        break;
                    }
                }
                Ok(SwapUpdate::Stuck { swap_id, reason, .. }) if swap_id == swap.id => {
                    tracing::warn!(%swap_id, %reason, "swap is stuck; still waiting");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    wallet.get_swap(&swap.id).await.context("reload swap")
}

fn swap_json(swap: &Swap) -> serde_json::Value {
    json!({
      "swap_id": swap.id,
      "direction": swap.terms.direction.as_str(),
      "state": swap.state.as_str(),
      "amount_sat": swap.terms.amount_sat,
      "onchain_amount_sat": swap.terms.onchain_amount_sat,
      "fee_sat": swap.terms.fee_sat,
      "payment_hash": swap.terms.payment_hash,
      "invoice": swap.terms.invoice,
      "lockup_address": swap.terms.lockup_address,
      "timeout_height": swap.terms.timeout_height,
      "resolution_txid": swap.resolution_txid,
      "failure_reason": swap.failure_reason,
    })
}
