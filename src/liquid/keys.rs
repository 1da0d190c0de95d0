use std::fmt;
use std::str::FromStr as _;
use std::sync::RwLock;

use lwk_wollet::elements::bitcoin::NetworkKind;
use lwk_wollet::elements::bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use lwk_wollet::elements::bitcoin::secp256k1::ecdsa::Signature;
use lwk_wollet::elements::bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use secrecy::{ExposeSecret as _, SecretBox};

use crate::config::Network;
use crate::error::KeyError;

/// 64-byte BIP39 seed. Zeroed when dropped.
pub struct Seed(SecretBox<[u8; 64]>);

impl Seed {
    pub fn from_mnemonic(phrase: &str) -> Result<Self, KeyError> {
        let mnemonic = bip39::Mnemonic::from_str(phrase.trim())
            .map_err(|e| KeyError::Derivation(format!("parse mnemonic: {e}")))?;
        Ok(Self::from_bytes(mnemonic.to_seed("")))
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(..)")
    }
}

pub struct DerivedKey {
    path: DerivationPath,
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl DerivedKey {
    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("path", &self.path.to_string())
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

pub struct KeyVault {
    seed: RwLock<Option<Seed>>,
    network: Network,
    secp: Secp256k1<All>,
}

impl KeyVault {
    pub fn new(seed: Seed, network: Network) -> Self {
        Self {
            seed: RwLock::new(Some(seed)),
            network,
            secp: Secp256k1::new(),
        }
    }

    pub fn from_mnemonic(phrase: &str, network: Network) -> Result<Self, KeyError> {
        Ok(Self::new(Seed::from_mnemonic(phrase)?, network))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn derive(&self, path: &str) -> Result<DerivedKey, KeyError> {
        let parsed = DerivationPath::from_str(path).map_err(|e| KeyError::InvalidPath {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        self.derive_path(&parsed)
    }

    pub fn derive_path(&self, path: &DerivationPath) -> Result<DerivedKey, KeyError> {
        let guard = self.seed.read().expect("key vault lock poisoned");
        let seed = guard.as_ref().ok_or(KeyError::KeyUnavailable)?;

        let network = if self.network.is_mainnet() {
            NetworkKind::Main
        } else {
            NetworkKind::Test
        };
        let master = Xpriv::new_master(network, seed.0.expose_secret())
            .map_err(|e| KeyError::Derivation(format!("master key: {e}")))?;
        let xprv = master
            .derive_priv(&self.secp, path)
            .map_err(|e| KeyError::Derivation(format!("derive {path}: {e}")))?;

        let secret_key = xprv.private_key;
        Ok(DerivedKey {
            path: path.clone(),
            public_key: PublicKey::from_secret_key(&self.secp, &secret_key),
            secret_key,
        })
    }

    /// Claim/refund key of the swap at `index`: `m/84'/<coin>'/1'/<index>`.
    pub fn swap_key(&self, index: u32) -> Result<DerivedKey, KeyError> {
        let path = self.account_path(1, index)?;
        self.derive_path(&path)
    }

    /// Public key that identifies this wallet: `m/84'/<coin>'/2'/0`.
    pub fn identity_pubkey(&self) -> Result<PublicKey, KeyError> {
        let path = self.account_path(2, 0)?;
        Ok(self.derive_path(&path)?.public_key)
    }

    pub fn sign(&self, key: &DerivedKey, digest: [u8; 32]) -> Result<Signature, KeyError> {
        if self.is_locked() {
            return Err(KeyError::KeyUnavailable);
        }
        let msg = Message::from_digest(digest);
        Ok(self.secp.sign_ecdsa(&msg, &key.secret_key))
    }

    /// Drops the seed. Every later derivation or signature fails with `KeyUnavailable`.
    pub fn lock(&self) {
        self.seed.write().expect("key vault lock poisoned").take();
    }

    pub fn is_locked(&self) -> bool {
        self.seed.read().expect("key vault lock poisoned").is_none()
    }

    fn account_path(&self, account: u32, index: u32) -> Result<DerivationPath, KeyError> {
        let children = [
            ChildNumber::from_hardened_idx(84),
            ChildNumber::from_hardened_idx(self.network.coin_type()),
            ChildNumber::from_hardened_idx(account),
            ChildNumber::from_normal_idx(index),
        ]
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KeyError::InvalidPath {
            path: format!("m/84'/{}'/{account}'/{index}", self.network.coin_type()),
            reason: e.to_string(),
        })?;
        Ok(DerivationPath::from(children))
    }
}
