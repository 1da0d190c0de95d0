use anyhow::{Context as _, Result};
use lwk_test_util::{TestEnv, TestEnvBuilder};
use lwk_wollet::elements::{Address, Txid};

/// `elementsd` plus a Liquid `electrs`, both spawned from the binaries named
/// by `ELEMENTSD_EXEC` and `ELECTRS_LIQUID_EXEC`.
pub struct RegtestEnv {
    inner: TestEnv,
}

impl RegtestEnv {
    pub fn start() -> Result<Self> {
        for name in ["ELEMENTSD_EXEC", "ELECTRS_LIQUID_EXEC"] {
            let value = std::env::var(name)
                .with_context(|| format!("required env var {name} is not set (run via `nix develop`)"))?;
            anyhow::ensure!(!value.trim().is_empty(), "required env var {name} is empty");
        }
        Ok(Self {
            inner: TestEnvBuilder::from_env().with_electrum().build(),
        })
    }

    pub fn electrum_url(&self) -> String {
        self.inner.electrum_url()
    }

    pub fn mine(&self, blocks: u32) {
        self.inner.elementsd_generate(blocks);
    }

    /// Sends policy-asset coins from the node wallet.
    pub fn send_lbtc(&self, address: &Address, amount_sat: u64) -> Txid {
        self.inner.elementsd_sendtoaddress(address, amount_sat, None)
    }
}
