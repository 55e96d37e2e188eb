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
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Block, BlockNumber, H256, U256};
use ethers::utils::keccak256;

use crate::config::BpxRelayerConfig;
use crate::contract::{BridgeContract, COMMITTEE_SIZE};
use crate::retry::FixedInterval;

/// The provider type every connector runs on.
pub type HttpProvider = Provider<Http>;

/// Which side of the bridge a connector serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The chain where messages are created.
    Source,
    /// The chain where messages are executed and committees are selected.
    Destination,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Destination => write!(f, "destination"),
        }
    }
}

/// The two bridge-event queries a sync engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// `MessageCreated` events destined for the given counterpart chain.
    Created {
        /// The destination chain id the events are filtered by.
        dst_chain_id: u64,
    },
    /// `MessageProcessed` events originating from the given counterpart
    /// chain.
    Processed {
        /// The source chain id the events are filtered by.
        src_chain_id: u64,
    },
}

/// A bridge event normalized into the relayer's domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A message was submitted to the source-chain bridge.
    Created {
        /// keccak256 of the message payload.
        message_hash: H256,
        /// The wallet that submitted the message.
        user_wallet: Address,
        /// The block the event was emitted in.
        block_number: u64,
    },
    /// A message was executed on the destination-chain bridge.
    Processed {
        /// The hash the contract reported as executed.
        message_hash: H256,
        /// The block the event was emitted in.
        block_number: u64,
    },
}

impl BridgeEvent {
    /// The block this event was emitted in.
    pub fn block_number(&self) -> u64 {
        match self {
            BridgeEvent::Created { block_number, .. }
            | BridgeEvent::Processed { block_number, .. } => *block_number,
        }
    }
}

/// The relayer's registration on the destination bridge contract.
#[derive(Debug, Clone, Copy)]
pub struct RelayerActivation {
    /// Whether the relayer is currently active.
    pub active: bool,
    /// The epoch the current status took effect in.
    pub since_epoch: u64,
}

impl RelayerActivation {
    /// The first epoch this relayer could have been selected for a
    /// committee. History before it is never needed.
    pub fn eligibility_epoch(&self) -> u64 {
        self.since_epoch + 1
    }
}

/// A connector that owns one RPC endpoint and the bridge contract bound on
/// that chain.
pub struct Chain {
    /// Which side of the bridge this connector serves.
    pub role: Role,
    /// The chain id reported by the endpoint, validated against the
    /// allow-list.
    pub chain_id: u64,
    /// Allow-listed display name of the chain.
    pub name: String,
    /// The underlying RPC client.
    pub provider: Arc<HttpProvider>,
    /// The bridge contract bound at the allow-listed address.
    pub contract: BridgeContract<HttpProvider>,
    retry_interval: Duration,
    max_retries: Option<usize>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("role", &self.role)
            .field("chain_id", &self.chain_id)
            .field("name", &self.name)
            .finish()
    }
}

impl Chain {
    /// Connects to `rpc_url`, resolves the chain identity and binds the
    /// bridge contract.
    ///
    /// Fails fatally (with a role-specific exit code) if the endpoint is
    /// unreachable or reports a chain id outside the allow-list.
    pub async fn connect(
        role: Role,
        rpc_url: &str,
        config: &BpxRelayerConfig,
    ) -> crate::Result<Arc<Self>> {
        tracing::info!("Connecting {} chain to RPC: {}", role, rpc_url);
        let provider = HttpProvider::try_from(rpc_url).map_err(|e| {
            crate::Error::ChainRpc {
                role,
                message: e.to_string(),
            }
        })?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| crate::Error::ChainRpc {
                role,
                message: e.to_string(),
            })?
            .as_u64();
        let info = config
            .chain_info(chain_id)
            .ok_or(crate::Error::UnsupportedChain { role, chain_id })?;
        tracing::info!(
            "Connected. chainId = {}, detected chain: {}",
            chain_id,
            info.name
        );
        tracing::info!("Bridge contract: {:?}", info.bridge);
        let provider = Arc::new(provider);
        let contract = BridgeContract::new(info.bridge, provider.clone());
        Ok(Arc::new(Self {
            role,
            chain_id,
            name: info.name.clone(),
            provider,
            contract,
            retry_interval: Duration::from_millis(
                config.sync.rpc_retry_interval,
            ),
            max_retries: config.sync.rpc_max_retries,
        }))
    }

    fn backoff(&self) -> FixedInterval {
        let backoff = FixedInterval::new(self.retry_interval);
        match self.max_retries {
            Some(max) => backoff.with_max_attempts(max),
            None => backoff,
        }
    }

    async fn get_block(&self, tag: BlockNumber) -> crate::Result<Block<H256>> {
        // block retrieval is side-effect free and safe to retry without
        // bound.
        let task = || async {
            let block = self
                .provider
                .get_block(tag)
                .await
                .map_err(crate::Error::from)
                .map_err(backoff::Error::transient)?;
            block.ok_or(backoff::Error::transient(crate::Error::Generic(
                "block not found",
            )))
        };
        backoff::future::retry_notify(self.backoff(), task, |e, _| {
            tracing::warn!("{} chain getBlock failed, will retry: {}", self.role, e);
        })
        .await
    }

    /// The current head block. Retries until it succeeds.
    pub async fn latest_block(&self) -> crate::Result<Block<H256>> {
        self.get_block(BlockNumber::Latest).await
    }

    /// A block by number. Retries until it succeeds.
    pub async fn block_by_number(
        &self,
        number: u64,
    ) -> crate::Result<Block<H256>> {
        self.get_block(BlockNumber::Number(number.into())).await
    }

    /// The epoch of a block, by number. Retries until it succeeds.
    pub async fn epoch_of_block(&self, number: u64) -> crate::Result<u64> {
        let block = self.block_by_number(number).await?;
        Ok(crate::epoch::epoch_of(block.timestamp.as_u64()))
    }

    /// Fetches bridge events matching `filter` within the inclusive block
    /// range, in chain order.
    ///
    /// Transport errors propagate to the caller: an errored range must be
    /// re-issued, never treated as "no events found".
    #[tracing::instrument(skip(self), fields(chain_id = %self.chain_id))]
    pub async fn query_events(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<BridgeEvent>> {
        let events = match filter {
            EventFilter::Created { dst_chain_id } => {
                let query = self
                    .contract
                    .message_created_filter()
                    .from_block(from_block)
                    .to_block(to_block)
                    .topic1(chain_id_topic(*dst_chain_id));
                query
                    .query_with_meta()
                    .await?
                    .into_iter()
                    .map(|(event, meta)| BridgeEvent::Created {
                        message_hash: H256::from(keccak256(&event.message)),
                        user_wallet: event.from,
                        block_number: meta.block_number.as_u64(),
                    })
                    .collect()
            }
            EventFilter::Processed { src_chain_id } => {
                let query = self
                    .contract
                    .message_processed_filter()
                    .from_block(from_block)
                    .to_block(to_block)
                    .topic1(chain_id_topic(*src_chain_id));
                query
                    .query_with_meta()
                    .await?
                    .into_iter()
                    .map(|(event, meta)| BridgeEvent::Processed {
                        message_hash: H256::from(event.message_hash),
                        block_number: meta.block_number.as_u64(),
                    })
                    .collect()
            }
        };
        Ok(events)
    }

    /// Reads this relayer's activation status from the bridge contract.
    pub async fn relayer_activation(
        &self,
        source_chain_id: u64,
        relayer: Address,
    ) -> crate::Result<RelayerActivation> {
        let (active, since_epoch) = self
            .contract
            .relayer_get_status(U256::from(source_chain_id), relayer)
            .call()
            .await
            .map_err(|e| crate::Error::ChainRpc {
                role: self.role,
                message: e.to_string(),
            })?;
        Ok(RelayerActivation {
            active,
            since_epoch,
        })
    }
}

/// The head-block fields the sync engine and listener consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadBlock {
    /// The head block number.
    pub number: u64,
    /// The head block timestamp, in seconds.
    pub timestamp: u64,
}

/// The chain reads the sync engine depends on, implemented by [`Chain`]
/// and scriptable in tests.
#[async_trait::async_trait]
pub trait ChainReader: Send + Sync + 'static {
    /// The chain id this reader serves.
    fn chain_id(&self) -> u64;

    /// Which side of the bridge this reader serves.
    fn role(&self) -> Role;

    /// The current head block.
    async fn head_block(&self) -> crate::Result<HeadBlock>;

    /// The epoch of a block, by number.
    async fn epoch_of_block(&self, number: u64) -> crate::Result<u64>;

    /// Bridge events matching `filter` in the inclusive block range, in
    /// chain order.
    async fn query_events(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<BridgeEvent>>;
}

#[async_trait::async_trait]
impl ChainReader for Chain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn role(&self) -> Role {
        self.role
    }

    async fn head_block(&self) -> crate::Result<HeadBlock> {
        let block = self.latest_block().await?;
        let number = block
            .number
            .ok_or(crate::Error::Generic("head block has no number"))?
            .as_u64();
        Ok(HeadBlock {
            number,
            timestamp: block.timestamp.as_u64(),
        })
    }

    async fn epoch_of_block(&self, number: u64) -> crate::Result<u64> {
        Chain::epoch_of_block(self, number).await
    }

    async fn query_events(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> crate::Result<Vec<BridgeEvent>> {
        Chain::query_events(self, filter, from_block, to_block).await
    }
}

/// A source of committee-selection results, implemented by the destination
/// [`Chain`] and mockable in tests.
#[async_trait::async_trait]
pub trait CommitteeSource: Send + Sync + 'static {
    /// The 8 relayers selected to attest `message_hash` in `epoch`.
    async fn committee(
        &self,
        source_chain_id: u64,
        message_hash: H256,
        epoch: u64,
    ) -> crate::Result<[Address; COMMITTEE_SIZE]>;
}

#[async_trait::async_trait]
impl CommitteeSource for Chain {
    async fn committee(
        &self,
        source_chain_id: u64,
        message_hash: H256,
        epoch: u64,
    ) -> crate::Result<[Address; COMMITTEE_SIZE]> {
        // a network partition is not a reason to silently drop a signing
        // duty; selection is a view call and retries until it succeeds.
        let task = || async {
            self.contract
                .message_get_relayers(
                    U256::from(source_chain_id),
                    message_hash.to_fixed_bytes(),
                    epoch,
                )
                .call()
                .await
                .map_err(crate::Error::from)
                .map_err(backoff::Error::transient)
        };
        backoff::future::retry_notify(self.backoff(), task, |e, _| {
            tracing::warn!("committee query failed, will retry: {}", e);
        })
        .await
    }
}

fn chain_id_topic(chain_id: u64) -> H256 {
    let mut topic = [0u8; 32];
    U256::from(chain_id).to_big_endian(&mut topic);
    H256::from(topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_topic_is_left_padded_big_endian() {
        let topic = chain_id_topic(279);
        assert_eq!(topic, H256::from_low_u64_be(279));
    }

    #[test]
    fn eligibility_starts_one_epoch_after_activation() {
        let activation = RelayerActivation {
            active: true,
            since_epoch: 41,
        };
        assert_eq!(activation.eligibility_epoch(), 42);
    }
}
