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
//! Live tailing of a chain after the initial sync.
//!
//! The listener is the node's steady-state heartbeat: every tick it runs
//! one quiet forward-crawl pass from its previous position to the new head
//! and keeps the shared epoch cell current.

use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainReader;
use crate::config::SyncConfig;
use crate::epoch::{epoch_of, CurrentEpoch};
use crate::store::HistoryStore;
use crate::sync::{EventHandler, SyncEngine};

/// A callback fired whenever the listener observes the chain entering a
/// new epoch.
#[async_trait::async_trait]
pub trait EpochHook: Send + Sync + 'static {
    /// Invoked with the new epoch, after the shared epoch cell has been
    /// updated.
    async fn on_new_epoch(&self, epoch: u64) -> crate::Result<()>;
}

#[async_trait::async_trait]
impl EpochHook for () {
    async fn on_new_epoch(&self, _epoch: u64) -> crate::Result<()> {
        Ok(())
    }
}

/// Tails one chain, keeping its cursor and the shared epoch current.
pub struct Listener<R, S, H, E> {
    engine: Arc<SyncEngine<R, S, H>>,
    current_epoch: CurrentEpoch,
    hook: Option<Arc<E>>,
    polling_interval: Duration,
}

impl<R, S, H, E> Listener<R, S, H, E>
where
    R: ChainReader,
    S: HistoryStore,
    H: EventHandler,
    E: EpochHook,
{
    /// Creates a listener over an already caught-up sync engine.
    pub fn new(
        engine: Arc<SyncEngine<R, S, H>>,
        current_epoch: CurrentEpoch,
        hook: Option<Arc<E>>,
        sync_config: &SyncConfig,
    ) -> Self {
        Self {
            engine,
            current_epoch,
            hook,
            polling_interval: Duration::from_millis(
                sync_config.polling_interval,
            ),
        }
    }

    /// Runs the tick loop. Never returns on its own; the caller races it
    /// against the shutdown signal.
    pub async fn run(&self) -> crate::Result<()> {
        let chain = self.engine.chain().clone();
        let chain_id = chain.chain_id();
        let mut position: Option<u64> = None;
        let mut interval = tokio::time::interval(self.polling_interval);
        loop {
            interval.tick().await;
            let head_block = chain.head_block().await?;
            let head = head_block.number;
            let from = match position {
                Some(position) => position + 1,
                // first tick resumes where the initial sync stopped
                None => {
                    let cursor = self
                        .engine
                        .cursor()?
                        .ok_or(crate::Error::SyncStateMissing { chain_id })?;
                    cursor.latest_block + 1
                }
            };
            if head >= from {
                self.engine.forward_crawl(from, head, false).await?;
                position = Some(head);
            }
            let head_epoch = epoch_of(head_block.timestamp);
            if self.current_epoch.get() != Some(head_epoch) {
                self.current_epoch.set(head_epoch);
                tracing::debug!(
                    "{} chain entered epoch {}",
                    chain.role(),
                    head_epoch
                );
                tracing::event!(
                    target: crate::probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %crate::probe::Kind::Lifecycle,
                    chain_id = chain_id,
                    epoch = head_epoch,
                );
                if let Some(hook) = &self.hook {
                    // a failed sweep is retried on the next epoch change,
                    // it never takes the heartbeat down
                    if let Err(e) = hook.on_new_epoch(head_epoch).await {
                        tracing::error!("epoch callback failed: {}", e);
                    }
                }
            }
        }
    }
}
