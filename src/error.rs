use ethers::providers::{Http, Provider};
use ethers::types::H256;

use crate::chain::Role;

/// An enum of all possible errors that could be encountered during the
/// execution of the relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Smart contract error.
    #[error(transparent)]
    EthersContract(
        #[from] ethers::contract::ContractError<Provider<Http>>,
    ),
    /// Wallet signer error.
    #[error(transparent)]
    Wallet(#[from] ethers::signers::WalletError),
    /// Hex decoding error.
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// The chain id reported by an RPC endpoint is not in the allow-list.
    #[error("Unsupported chainId = {} on the {} chain", chain_id, role)]
    UnsupportedChain {
        /// Which connector hit the unknown chain id.
        role: Role,
        /// The offending chain id.
        chain_id: u64,
    },
    /// RPC failure while establishing a chain connection.
    #[error("{} chain RPC error: {}", role, message)]
    ChainRpc {
        /// Which connector failed.
        role: Role,
        /// The underlying RPC error, stringified.
        message: String,
    },
    /// Both RPC endpoints resolved to the same chain id.
    #[error("Both chains have the same chainId")]
    SameChain,
    /// Neither of the two chains is the BPX home chain.
    #[error("Neither the source nor destination chain is BPX")]
    NotHomeChain,
    /// The relayer is not registered as active on the destination bridge.
    #[error("Relayer inactive since epoch {}", since_epoch)]
    RelayerInactive {
        /// The epoch reported by the bridge contract.
        since_epoch: u64,
    },
    /// Synapse transport failure.
    #[error("Synapse error: {}", _0)]
    Synapse(String),
    /// An inbound retry request failed validation.
    #[error("Invalid retry request: {}", _0)]
    InvalidRetryRequest(String),
    /// A retry request referenced a message we have never seen.
    #[error("Unknown message: {:?}", _0)]
    MessageNotFound(H256),
    /// A retry request referenced a message already executed on the
    /// destination chain.
    #[error("Message already executed: {:?}", _0)]
    MessageAlreadyExecuted(H256),
    /// A forward crawl ran against a chain with no persisted sync cursor.
    #[error("No sync cursor for chainId = {}", chain_id)]
    SyncStateMissing {
        /// The chain id with the missing cursor.
        chain_id: u64,
    },
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
}

impl Error {
    /// The process exit code for this error when it aborts startup.
    ///
    /// The codes are part of the node's operational surface: supervisors
    /// match on them to tell a bad wallet key apart from a misconfigured
    /// RPC endpoint.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Wallet(_) => 1,
            Error::UnsupportedChain {
                role: Role::Source, ..
            }
            | Error::ChainRpc {
                role: Role::Source, ..
            } => 2,
            Error::UnsupportedChain {
                role: Role::Destination,
                ..
            }
            | Error::ChainRpc {
                role: Role::Destination,
                ..
            }
            | Error::RelayerInactive { .. } => 3,
            Error::SameChain => 4,
            Error::NotHomeChain => 5,
            Error::Synapse(_) => 6,
            Error::Sled(_) => 7,
            _ => 1,
        }
    }
}

/// A type alias for the result of the relayer, that uses the [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;
