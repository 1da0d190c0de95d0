use thiserror::Error;

use crate::swap::SwapState;

pub type Result<T, E = WalletError> = std::result::Result<T, E>;

/// Failures of `Wallet::connect`. Fatal to the connect call only.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("swap storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),

    #[error("network unreachable at startup: {0}")]
    NetworkUnreachable(String),

    #[error("key derivation failed: {0}")]
    Keys(#[from] KeyError),

    #[error("resume swaps: {0}")]
    Resume(String),
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid derivation path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("key vault is locked")]
    KeyUnavailable,

    #[error("key derivation: {0}")]
    Derivation(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction rejected by network: {0}")]
    RejectedByNetwork(String),

    #[error("chain query timed out: {0}")]
    Timeout(String),

    #[error("chain backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("corrupt transition log for swap {swap_id}: {reason}")]
    CorruptLog { swap_id: String, reason: String },

    #[error("swap not found: {0}")]
    NotFound(String),

    #[error("active swap {existing} already exists for payment hash {payment_hash}")]
    DuplicateSwap {
        payment_hash: String,
        existing: String,
    },

    #[error("concurrent append on swap {swap_id}: expected log length {expected}, found {actual}")]
    Conflict {
        swap_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("create store dir {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encode transition: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn db(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let context = context.into();
        move |source| StorageError::Database { context, source }
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment rejected: {0}")]
    Rejected(String),

    #[error("payment client: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SwapperError {
    #[error("swap provider unreachable: {0}")]
    Http(String),

    #[error("swap provider error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed swap provider response: {0}")]
    Parse(String),
}

/// The counterparty said or did something that violates the swap protocol.
/// Scoped to one swap; never fatal for the wallet.
#[derive(Debug, Error)]
pub enum SwapProtocolError {
    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    #[error("invoice payment hash {actual} does not match swap hash {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("amount mismatch: expected {expected} sat, got {actual} sat")]
    AmountMismatch { expected: u64, actual: u64 },

    #[error("counterparty fee {fee_sat} sat exceeds limit {max_fee_sat} sat")]
    FeeTooHigh { fee_sat: u64, max_fee_sat: u64 },

    #[error("lockup script mismatch: derived {derived}, provider sent {provided}")]
    ScriptMismatch { derived: String, provided: String },

    #[error("timeout height {timeout_height} out of range [{min}, {max}]")]
    TimeoutOutOfRange { timeout_height: u32, min: u32, max: u32 },

    #[error("invalid counterparty public key: {0}")]
    InvalidPubkey(String),

    #[error("lockup underfunded: expected {expected} sat, found {actual} sat")]
    UnderfundedLockup { expected: u64, actual: u64 },

    #[error("lockup of {amount_sat} sat cannot cover the {fee_sat} sat spend fee")]
    LockupBelowSpendFee { amount_sat: u64, fee_sat: u64 },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Keys(#[from] KeyError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Swapper(#[from] SwapperError),

    #[error(transparent)]
    Protocol(#[from] SwapProtocolError),

    #[error("swap {swap_id} ({state:?}): {source}")]
    Swap {
        swap_id: String,
        state: SwapState,
        #[source]
        source: Box<WalletError>,
    },

    #[error("swap {swap_id} stuck in {state:?} after {attempts} broadcast attempts: {reason}")]
    SwapStuck {
        swap_id: String,
        state: SwapState,
        attempts: u32,
        reason: String,
    },

    #[error("swap not found: {0}")]
    SwapNotFound(String),

    #[error("wallet is shut down")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

impl WalletError {
    pub(crate) fn for_swap(self, swap_id: &str, state: SwapState) -> Self {
        match self {
            err @ (WalletError::Swap { .. } | WalletError::SwapStuck { .. }) => err,
            err => WalletError::Swap {
                swap_id: swap_id.to_string(),
                state,
                source: Box::new(err),
            },
        }
    }
}

impl From<anyhow::Error> for WalletError {
    fn from(err: anyhow::Error) -> Self {
        WalletError::Other(format!("{err:#}"))
    }
}

impl From<tokio::task::JoinError> for WalletError {
    fn from(err: tokio::task::JoinError) -> Self {
        WalletError::Other(format!("join blocking task: {err}"))
    }
}
