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
//! Node assembly and startup.
//!
//! [`ignite`] validates the two chain connections, runs the initial sync
//! to the relayer's activation boundary, then kicks off the long-running
//! background services (the two listeners and the retry subscription).

use std::sync::Arc;

use crate::chain::{BridgeEvent, Chain, EventFilter, Role};
use crate::context::RelayerContext;
use crate::epoch::CurrentEpoch;
use crate::listener::Listener;
use crate::signer::{MessageSigner, RETRY_EPOCH_WINDOW};
use crate::store::{HistoryStore, MessageStore};
use crate::sync::{EventHandler, SyncEngine};
use crate::synapse::{retry_topic, Synapse};

/// Records creation events and fast-paths fresh messages to the signer.
pub struct SourceChainHandler<S, C, P> {
    store: S,
    signer: Arc<MessageSigner<S, C, P>>,
}

#[async_trait::async_trait]
impl<S, C, P> EventHandler for SourceChainHandler<S, C, P>
where
    S: MessageStore + HistoryStore,
    C: crate::chain::CommitteeSource,
    P: crate::synapse::SignaturePublisher,
{
    async fn handle_event(
        &self,
        event: &BridgeEvent,
        epoch: u64,
    ) -> crate::Result<()> {
        let BridgeEvent::Created {
            message_hash,
            user_wallet,
            ..
        } = event
        else {
            return Ok(());
        };
        tracing::debug!(
            "New message {:?} from {:?} at epoch {}",
            message_hash,
            user_wallet,
            epoch
        );
        self.store
            .insert_message_src_chain(*message_hash, *user_wallet, epoch)?;
        // fresh messages skip the wait for the next sweep; during the
        // initial sync no epoch is known yet and everything is left to
        // the sweep
        let fast_path = match self.signer.current_epoch() {
            Some(current) => current.saturating_sub(epoch) <= RETRY_EPOCH_WINDOW,
            None => false,
        };
        if fast_path {
            if let Err(e) = self
                .signer
                .maybe_sign(*message_hash, *user_wallet, epoch)
                .await
            {
                tracing::error!(
                    "Signing of message {:?} failed: {}",
                    message_hash,
                    e
                );
            }
        }
        Ok(())
    }
}

/// Marks messages executed when the destination bridge reports them
/// processed.
pub struct DestinationChainHandler<S> {
    store: S,
}

#[async_trait::async_trait]
impl<S> EventHandler for DestinationChainHandler<S>
where
    S: MessageStore + HistoryStore,
{
    async fn handle_event(
        &self,
        event: &BridgeEvent,
        _epoch: u64,
    ) -> crate::Result<()> {
        let BridgeEvent::Processed { message_hash, .. } = event else {
            return Ok(());
        };
        tracing::debug!("Message {:?} executed", message_hash);
        self.store.insert_message_dst_chain(*message_hash)
    }
}

/// Starts the relayer: connects both chains, validates the pairing, syncs
/// history down to the activation epoch and up to both heads, then spawns
/// the listeners and the retry subscription.
///
/// Background tasks stop when the context broadcasts shutdown.
pub async fn ignite<S>(
    ctx: &RelayerContext,
    store: S,
    src_rpc: &url::Url,
    dst_rpc: &url::Url,
) -> crate::Result<()>
where
    S: HistoryStore + MessageStore,
{
    let config = &ctx.config;
    let src =
        Chain::connect(Role::Source, src_rpc.as_str(), config).await?;
    let dst =
        Chain::connect(Role::Destination, dst_rpc.as_str(), config).await?;
    if src.chain_id == dst.chain_id {
        return Err(crate::Error::SameChain);
    }
    if src.chain_id != config.home_chain_id
        && dst.chain_id != config.home_chain_id
    {
        return Err(crate::Error::NotHomeChain);
    }

    let activation = dst.relayer_activation(src.chain_id, ctx.address()).await?;
    if !activation.active {
        return Err(crate::Error::RelayerInactive {
            since_epoch: activation.since_epoch,
        });
    }
    let target_epoch = activation.eligibility_epoch();
    tracing::info!(
        "Relayer active since epoch {}, syncing down to epoch {}",
        activation.since_epoch,
        target_epoch
    );

    let synapse = Synapse::connect(&config.synapse).await?;

    // the epoch used for committee eligibility follows the destination
    // chain, where selection happens
    let dst_epoch = CurrentEpoch::new();
    let src_epoch = CurrentEpoch::new();
    let signer = Arc::new(MessageSigner::new(
        ctx.wallet.clone(),
        store.clone(),
        dst.clone(),
        Arc::new(synapse.clone()),
        src.chain_id,
        dst_epoch.clone(),
    ));

    let src_engine = Arc::new(SyncEngine::new(
        src.clone(),
        EventFilter::Created {
            dst_chain_id: dst.chain_id,
        },
        store.clone(),
        Arc::new(SourceChainHandler {
            store: store.clone(),
            signer: signer.clone(),
        }),
        &config.sync,
    ));
    let dst_engine = Arc::new(SyncEngine::new(
        dst.clone(),
        EventFilter::Processed {
            src_chain_id: src.chain_id,
        },
        store.clone(),
        Arc::new(DestinationChainHandler {
            store: store.clone(),
        }),
        &config.sync,
    ));

    tracing::info!("Synchronizing chains...");
    futures::try_join!(
        src_engine.run(target_epoch),
        dst_engine.run(target_epoch)
    )?;
    tracing::info!("Chains synchronized");

    start_listener(
        ctx,
        Listener::new(src_engine, src_epoch, None::<Arc<()>>, &config.sync),
        Role::Source,
    );
    start_listener(
        ctx,
        Listener::new(
            dst_engine,
            dst_epoch,
            Some(signer.clone()),
            &config.sync,
        ),
        Role::Destination,
    );
    start_retry_subscription(
        ctx,
        &synapse,
        signer,
        src.chain_id,
        dst.chain_id,
    )
    .await?;

    tracing::event!(
        target: crate::probe::TARGET,
        tracing::Level::DEBUG,
        kind = %crate::probe::Kind::Lifecycle,
        started = true,
    );
    tracing::info!("Relayer started");
    Ok(())
}

fn start_listener<R, S, H, E>(
    ctx: &RelayerContext,
    listener: Listener<R, S, H, E>,
    role: Role,
) where
    R: crate::chain::ChainReader,
    S: HistoryStore,
    H: EventHandler,
    E: crate::listener::EpochHook,
{
    let mut shutdown_signal = ctx.shutdown_signal();
    let task = async move {
        tokio::select! {
            result = listener.run() => {
                if let Err(e) = result {
                    tracing::error!("{} chain listener stopped: {}", role, e);
                }
            },
            _ = shutdown_signal.recv() => {
                tracing::trace!("Stopping {} chain listener", role);
            },
        }
    };
    // kick off the listener.
    tokio::task::spawn(task);
}

async fn start_retry_subscription<S, C, P>(
    ctx: &RelayerContext,
    synapse: &Synapse,
    signer: Arc<MessageSigner<S, C, P>>,
    src_chain_id: u64,
    dst_chain_id: u64,
) -> crate::Result<()>
where
    S: MessageStore,
    C: crate::chain::CommitteeSource,
    P: crate::synapse::SignaturePublisher,
{
    let topic = retry_topic(src_chain_id, dst_chain_id, ctx.address());
    let mut inbound = synapse.subscribe(&topic).await?;
    let mut shutdown_signal = ctx.shutdown_signal();
    let task = async move {
        loop {
            tokio::select! {
                payload = inbound.recv() => match payload {
                    None => {
                        tracing::warn!("Retry subscription closed");
                        return;
                    }
                    Some(payload) => {
                        if let Err(e) =
                            signer.handle_retry_request(&payload).await
                        {
                            tracing::warn!(
                                "Exception in retry request processing: {}",
                                e
                            );
                        }
                    }
                },
                _ = shutdown_signal.recv() => {
                    tracing::trace!("Stopping retry subscription");
                    return;
                },
            }
        }
    };
    tokio::task::spawn(task);
    Ok(())
}
