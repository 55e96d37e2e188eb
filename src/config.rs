// Copyright 2023 BPX Chain Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use ethers::types::{Address, H256};
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

/// The chain id of the BPX home chain. Exactly one of the two configured
/// chains must resolve to it.
pub const fn default_home_chain_id() -> u64 {
    279
}

const fn max_blocks_per_step_default() -> u64 {
    1000
}

const fn polling_interval_default() -> u64 {
    5_000
}

const fn rpc_retry_interval_default() -> u64 {
    3_000
}

const fn print_progress_interval_default() -> u64 {
    15_000
}

/// BpxRelayerConfig is the configuration for the BPX bridge relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BpxRelayerConfig {
    /// The chain id of the home chain.
    #[serde(default = "default_home_chain_id")]
    pub home_chain_id: u64,
    /// Supported chains, keyed by decimal chain id.
    ///
    /// A chain id reported by an RPC endpoint that is absent from this map
    /// is a fatal startup error.
    #[serde(default = "default_chains")]
    pub chains: HashMap<String, ChainInfo>,
    /// Sync engine and listener tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Synapse p2p transport settings.
    #[serde(default)]
    pub synapse: SynapseConfig,
}

impl Default for BpxRelayerConfig {
    fn default() -> Self {
        Self {
            home_chain_id: default_home_chain_id(),
            chains: default_chains(),
            sync: SyncConfig::default(),
            synapse: SynapseConfig::default(),
        }
    }
}

impl BpxRelayerConfig {
    /// Looks up the allow-list entry for a chain id.
    pub fn chain_info(&self, chain_id: u64) -> Option<&ChainInfo> {
        self.chains.get(&chain_id.to_string())
    }
}

/// One allow-listed chain: a display name and the bridge contract deployed
/// on it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainInfo {
    /// Human readable chain name, used in logs only.
    pub name: String,
    /// The address of the bridge contract on this chain.
    pub bridge: Address,
}

fn default_chains() -> HashMap<String, ChainInfo> {
    let entry = |name: &str, addr: &str| ChainInfo {
        name: name.to_string(),
        bridge: Address::from_str(addr).unwrap(),
    };
    HashMap::from([
        (
            "279".to_string(),
            entry("BPX Chain", "0x53fa3006A40AA0Cb697736819485cE6D30DEAEb5"),
        ),
        (
            "42161".to_string(),
            entry("Arbitrum", "0x5CD1A383d9C881577dDF6E5E092Db25b2D50e9B3"),
        ),
        (
            "137".to_string(),
            entry("Polygon", "0x5CD1A383d9C881577dDF6E5E092Db25b2D50e9B3"),
        ),
        (
            "43114".to_string(),
            entry(
                "Avalanche C-Chain",
                "0x5CD1A383d9C881577dDF6E5E092Db25b2D50e9B3",
            ),
        ),
    ])
}

/// SyncConfig tunes the sync engine, the listeners and the RPC retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// How many blocks one crawl window covers.
    #[serde(default = "max_blocks_per_step_default")]
    pub max_blocks_per_step: u64,
    /// Listener tick interval in milliseconds.
    #[serde(default = "polling_interval_default")]
    pub polling_interval: u64,
    /// Fixed delay between retries of a failed RPC read, in milliseconds.
    #[serde(default = "rpc_retry_interval_default")]
    pub rpc_retry_interval: u64,
    /// Maximum RPC read retries before giving up.
    ///
    /// Unset means retry forever, which is the behavior a relayer wants:
    /// reads perform no state mutation and must eventually succeed.
    #[serde(default)]
    pub rpc_max_retries: Option<usize>,
    /// Catch-up sync progress logging frequency in milliseconds.
    #[serde(default = "print_progress_interval_default")]
    pub print_progress_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_step: max_blocks_per_step_default(),
            polling_interval: polling_interval_default(),
            rpc_retry_interval: rpc_retry_interval_default(),
            rpc_max_retries: None,
            print_progress_interval: print_progress_interval_default(),
        }
    }
}

/// SynapseConfig holds the bootstrap peers of the Synapse p2p network.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SynapseConfig {
    /// Multiaddrs of well-known Synapse nodes to dial at startup.
    #[serde(default = "default_bootstrap_peers")]
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: default_bootstrap_peers(),
        }
    }
}

fn default_bootstrap_peers() -> Vec<Multiaddr> {
    [
        "/dns4/synapse1.mainnet.bpxchain.cc/tcp/8000/p2p/16Uiu2HAm55qUe3BFd2fA6UE6uWb38ByEck1KdfJ271S3ULSqa2iu",
        "/dns4/synapse2.mainnet.bpxchain.cc/tcp/8000/p2p/16Uiu2HAmQ3HRNNo6ESF5jW6VBLkrcZ8ECoZ2guGwdmZVZDsksvmP",
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect()
}

/// The relayer wallet's private key.
///
/// Accepted formats:
///
/// 1. a raw `0x`-prefixed (64 hex chars) private key, e.g.
///    `0x8917…0318`;
/// 2. `$SOME_ENV_VAR` naming an environment variable that holds a key in
///    format 1.
#[derive(Clone)]
pub struct PrivateKey(H256);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material.
        f.debug_tuple("PrivateKey").finish()
    }
}

impl std::ops::Deref for PrivateKey {
    type Target = H256;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn parse_private_key(value: &str) -> Result<H256, String> {
    if let Some(hex_key) = value.strip_prefix("0x") {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(hex_key, &mut raw).map_err(|e| {
            format!(
                "{e}; expected a 66 chars string (including the 0x prefix)"
            )
        })?;
        Ok(H256::from(raw))
    } else if let Some(var) = value.strip_prefix('$') {
        tracing::trace!("Reading {} from env", var);
        let val = std::env::var(var)
            .map_err(|e| format!("error while loading this env {var}: {e}"))?;
        parse_private_key(&val)
    } else {
        Err(String::from(
            "expected a 0x-prefixed hex key or an env var like $BPX_WALLET_KEY",
        ))
    }
}

impl FromStr for PrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_private_key(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVisitor;
        impl serde::de::Visitor<'_> for PrivateKeyVisitor {
            type Value = H256;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string or an env var containing a hex string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                parse_private_key(value).map_err(serde::de::Error::custom)
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVisitor)?;
        Ok(Self(secret))
    }
}

/// Loads and merges all TOML/JSON config files under `path`, then merges the
/// environment (prefix `BPX`), and validates the result.
pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<BpxRelayerConfig> {
    let mut builder = config::Config::builder();
    // A pattern that covers all toml or json files in the config directory
    // and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", path.as_ref().display());
    let json_pattern = format!("{}/**/*.json", path.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let config_files = glob::glob(&toml_pattern)?
        .flatten()
        .chain(glob::glob(&json_pattern)?.flatten());
    for config_file in config_files {
        tracing::trace!("Loading config file: {}", config_file.display());
        let ext = config_file
            .extension()
            .map(|e| e.to_str().unwrap_or(""))
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        builder = builder
            .add_source(config::File::from(config_file).format(format));
    }
    // also merge in the environment (with a prefix of BPX).
    builder = builder.add_source(
        config::Environment::with_prefix("BPX").separator("_"),
    );
    let cfg = builder.build()?;
    // and finally deserialize the config and post-process it.
    let config: BpxRelayerConfig = serde_path_to_error::deserialize(cfg)?;
    postloading_process(config)
}

// The postloading_process exists to validate the configuration before the
// relayer acts on it.
fn postloading_process(
    config: BpxRelayerConfig,
) -> crate::Result<BpxRelayerConfig> {
    tracing::trace!("Checking configuration sanity ...");
    if config.chain_info(config.home_chain_id).is_none() {
        tracing::error!(
            "home chain {} is missing from the chains allow-list",
            config.home_chain_id
        );
        return Err(crate::Error::Generic(
            "home chain missing from the chains allow-list",
        ));
    }
    if config.sync.max_blocks_per_step == 0 {
        return Err(crate::Error::Generic("max-blocks-per-step must be > 0"));
    }
    Ok(config)
}
