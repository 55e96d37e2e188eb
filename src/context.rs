use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use tokio::sync::broadcast;

use crate::config::{BpxRelayerConfig, PrivateKey};

/// The RelayerContext holds the configuration, the relayer wallet, and the
/// shutdown channel that every long-running task listens on.
#[derive(Clone)]
pub struct RelayerContext {
    /// The parsed configuration.
    pub config: BpxRelayerConfig,
    /// The relayer's signing wallet.
    pub wallet: LocalWallet,
    /// Broadcasts a shutdown signal to all active tasks.
    ///
    /// When a graceful shutdown is initiated, a `()` value is sent via the
    /// broadcast::Sender. Each active task receives it, reaches a safe
    /// terminal state, and completes.
    notify_shutdown: broadcast::Sender<()>,
}

impl RelayerContext {
    /// Builds a context from a configuration and a wallet key.
    ///
    /// Fails if the key is not a valid secp256k1 secret.
    pub fn new(
        config: BpxRelayerConfig,
        wallet_key: &PrivateKey,
    ) -> crate::Result<Self> {
        let wallet = LocalWallet::from_bytes(wallet_key.as_bytes())?;
        let (notify_shutdown, _) = broadcast::channel(2);
        Ok(Self {
            config,
            wallet,
            notify_shutdown,
        })
    }

    /// The relayer's on-chain address.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Returns a new [`Shutdown`] receiver handle.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends the shutdown signal to all active tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }
}

/// Listens for the relayer shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single value
/// is ever sent; once received, every task should reach a safe terminal
/// state and exit.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received.
    shutdown: bool,
    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately.
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        // Remember that the signal has been received.
        self.shutdown = true;
    }
}
