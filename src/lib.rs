pub mod balance;
pub mod chain;
pub mod config;
pub mod error;
pub mod lightning;
pub mod liquid;
pub mod logging;
pub mod swap;
pub mod swapper;
pub mod wallet;

pub use balance::BalanceSnapshot;
pub use config::{Config, Network};
pub use error::{ConnectError, WalletError};
pub use wallet::{Collaborators, ConnectRequest, GetInfoRequest, GetInfoResponse, Wallet};
