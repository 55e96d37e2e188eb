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
//! The Synapse pub/sub transport.
//!
//! Signature shares travel to bridge clients and retry requests travel to
//! relayers over gossipsub topics. The swarm runs on a dedicated task; the
//! rest of the node talks to it through a cloneable [`Synapse`] handle.

use std::collections::HashMap;

use ethers::types::{Address, Signature, H256, U256};
use futures::StreamExt;
use libp2p::gossipsub::{self, TopicHash};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{noise, tcp, yamux, SwarmBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::SynapseConfig;

/// The topic relayers listen on for client retry requests, scoped to one
/// bridge direction and one relayer wallet.
pub fn retry_topic(
    src_chain_id: u64,
    dst_chain_id: u64,
    relayer: Address,
) -> String {
    format!(
        "/bridge/1/retry-{}-{}-0x{}/json",
        src_chain_id,
        dst_chain_id,
        hex::encode(relayer)
    )
}

/// The topic a bridge client listens on for signature shares addressed to
/// its wallet.
pub fn client_topic(user_wallet: Address) -> String {
    format!("/bridge/1/client-0x{}/json", hex::encode(user_wallet))
}

/// One relayer's signature over an epoch hash, as published to the
/// client's topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureShare {
    /// The message the signature attests.
    pub message_hash: H256,
    /// The epoch the signature is bound to.
    pub epoch: u64,
    /// Recovery id of the signature.
    pub v: u64,
    /// The r component.
    pub r: H256,
    /// The s component.
    pub s: H256,
}

impl SignatureShare {
    /// Packs an ECDSA signature into the wire shape clients aggregate.
    pub fn new(message_hash: H256, epoch: u64, signature: &Signature) -> Self {
        Self {
            message_hash,
            epoch,
            v: signature.v,
            r: u256_to_h256(signature.r),
            s: u256_to_h256(signature.s),
        }
    }
}

fn u256_to_h256(value: U256) -> H256 {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    H256::from(buf)
}

/// A client's request to re-sign a previously discovered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    /// Hex-encoded 32-byte message hash, `0x`-prefixed.
    pub message_hash: String,
}

/// A sink for outbound signature shares, implemented over [`Synapse`] and
/// mockable in tests.
#[async_trait::async_trait]
pub trait SignaturePublisher: Send + Sync + 'static {
    /// Publish a share on the given client topic.
    async fn publish_signature(
        &self,
        topic: &str,
        share: &SignatureShare,
    ) -> crate::Result<()>;
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
}

enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        done: oneshot::Sender<crate::Result<()>>,
    },
    Subscribe {
        topic: String,
        sink: mpsc::Sender<Vec<u8>>,
        done: oneshot::Sender<crate::Result<()>>,
    },
}

/// A cloneable handle to the Synapse swarm task.
#[derive(Clone)]
pub struct Synapse {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Synapse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synapse").finish_non_exhaustive()
    }
}

impl Synapse {
    /// Builds the swarm, dials the bootstrap peers and spawns the driver
    /// task.
    pub async fn connect(config: &SynapseConfig) -> crate::Result<Self> {
        tracing::info!("Connecting to Synapse P2P network...");
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(synapse_error)?
            .with_dns()
            .map_err(synapse_error)?
            .with_behaviour(|keypair| {
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .build()?;
                Ok(Behaviour {
                    gossipsub: gossipsub::Behaviour::new(
                        gossipsub::MessageAuthenticity::Signed(
                            keypair.clone(),
                        ),
                        gossipsub_config,
                    )?,
                })
            })
            .map_err(synapse_error)?
            .build();
        for peer in &config.bootstrap_peers {
            swarm
                .dial(peer.clone())
                .map_err(|e| crate::Error::Synapse(e.to_string()))?;
        }
        let (commands, receiver) = mpsc::channel(64);
        tokio::spawn(drive_swarm(swarm, receiver));
        tracing::info!("Connected to Synapse");
        Ok(Self { commands })
    }

    /// Publishes a raw payload on a topic.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> crate::Result<()> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_owned(),
                payload,
                done,
            })
            .await
            .map_err(|_| crate::Error::Synapse("swarm task gone".into()))?;
        outcome
            .await
            .map_err(|_| crate::Error::Synapse("swarm task gone".into()))?
    }

    /// Subscribes to a topic; inbound payloads arrive on the returned
    /// channel.
    pub async fn subscribe(
        &self,
        topic: &str,
    ) -> crate::Result<mpsc::Receiver<Vec<u8>>> {
        let (sink, inbound) = mpsc::channel(64);
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                topic: topic.to_owned(),
                sink,
                done,
            })
            .await
            .map_err(|_| crate::Error::Synapse("swarm task gone".into()))?;
        outcome
            .await
            .map_err(|_| crate::Error::Synapse("swarm task gone".into()))??;
        tracing::info!("Subscribed to topic: {}", topic);
        Ok(inbound)
    }
}

fn synapse_error<E: std::fmt::Display>(e: E) -> crate::Error {
    crate::Error::Synapse(e.to_string())
}

async fn drive_swarm(
    mut swarm: libp2p::Swarm<Behaviour>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut subscribers: HashMap<TopicHash, mpsc::Sender<Vec<u8>>> =
        HashMap::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                // all handles dropped, the node is going down
                None => return,
                Some(Command::Publish { topic, payload, done }) => {
                    let topic = gossipsub::IdentTopic::new(topic);
                    let result = swarm
                        .behaviour_mut()
                        .gossipsub
                        .publish(topic, payload)
                        .map(|_| ())
                        .map_err(synapse_error);
                    let _ = done.send(result);
                }
                Some(Command::Subscribe { topic, sink, done }) => {
                    let topic = gossipsub::IdentTopic::new(topic);
                    let result = swarm
                        .behaviour_mut()
                        .gossipsub
                        .subscribe(&topic)
                        .map(|_| ())
                        .map_err(synapse_error);
                    if result.is_ok() {
                        subscribers.insert(topic.hash(), sink);
                    }
                    let _ = done.send(result);
                }
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(
                    gossipsub::Event::Message { message, .. },
                )) => {
                    if let Some(sink) = subscribers.get(&message.topic) {
                        // a slow consumer drops requests rather than
                        // stalling the swarm
                        let _ = sink.try_send(message.data);
                    }
                }
                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                    tracing::debug!("Synapse peer connected: {}", peer_id);
                }
                SwarmEvent::OutgoingConnectionError { error, .. } => {
                    tracing::warn!("Synapse dial failed: {}", error);
                }
                _ => {}
            },
        }
    }
}

#[async_trait::async_trait]
impl SignaturePublisher for Synapse {
    async fn publish_signature(
        &self,
        topic: &str,
        share: &SignatureShare,
    ) -> crate::Result<()> {
        let payload = serde_json::to_vec(share)?;
        self.publish(topic, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn topics_embed_lowercased_addresses() {
        let relayer =
            Address::from_str("0xAbCd00000000000000000000000000000000EF12")
                .unwrap();
        assert_eq!(
            retry_topic(279, 137, relayer),
            "/bridge/1/retry-279-137-0xabcd00000000000000000000000000000000ef12/json"
        );
        assert_eq!(
            client_topic(relayer),
            "/bridge/1/client-0xabcd00000000000000000000000000000000ef12/json"
        );
    }

    #[test]
    fn signature_share_uses_camel_case_wire_names() {
        let share = SignatureShare {
            message_hash: H256::from_low_u64_be(7),
            epoch: 42,
            v: 27,
            r: H256::from_low_u64_be(1),
            s: H256::from_low_u64_be(2),
        };
        let json = serde_json::to_value(&share).unwrap();
        assert_eq!(json["epoch"], 42);
        assert_eq!(json["v"], 27);
        assert!(json.get("messageHash").is_some());
        assert!(json.get("message_hash").is_none());
    }

    #[test]
    fn signature_components_are_big_endian_padded() {
        assert_eq!(
            u256_to_h256(U256::from(0xdeadbeefu64)),
            H256::from_low_u64_be(0xdeadbeef)
        );
    }
}
