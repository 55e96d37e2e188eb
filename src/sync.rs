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
//! Resumable per-chain event synchronization.
//!
//! The engine reconciles the persisted [`SyncState`] cursor with the chain
//! head and the relayer's activation epoch. Catch-up toward the head runs
//! forward in fixed windows; backfill toward the activation boundary runs
//! backward, newest first, and stops at the first event older than the
//! boundary. Both directions persist the cursor after every window, so a
//! crash replays at most one window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::chain::{BridgeEvent, ChainReader, EventFilter};
use crate::config::SyncConfig;
use crate::store::{HistoryStore, SyncState};

/// What a per-chain event callback does with a discovered bridge event.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Process one event, discovered in the given epoch.
    async fn handle_event(
        &self,
        event: &BridgeEvent,
        epoch: u64,
    ) -> crate::Result<()>;
}

/// The crawls required to reconcile a cursor with the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    /// Start a backward crawl from this block, down to the target epoch.
    pub backward_from: Option<u64>,
    /// Forward crawl over this inclusive block range.
    pub forward: Option<(u64, u64)>,
}

impl SyncPlan {
    /// Decides which crawls are needed given the persisted cursor, the
    /// current head block and the target (activation) epoch.
    pub fn compute(
        cursor: Option<&SyncState>,
        head: u64,
        target_epoch: u64,
    ) -> Self {
        match cursor {
            // fresh database, the whole required history is unknown
            None => Self {
                backward_from: Some(head),
                forward: None,
            },
            Some(cursor) => {
                let backward_from = if cursor.oldest_epoch != target_epoch {
                    Some(cursor.oldest_block.saturating_sub(1))
                } else {
                    None
                };
                // a lagging endpoint can report a head behind the cursor;
                // there is nothing to crawl forward until it catches up
                let forward = if cursor.latest_block < head {
                    Some((cursor.latest_block + 1, head))
                } else {
                    None
                };
                Self {
                    backward_from,
                    forward,
                }
            }
        }
    }
}

/// How many leading events of a newest-first window are at or above the
/// target epoch. Everything past the first older event is skipped.
fn replay_len(epochs: &[u64], target_epoch: u64) -> usize {
    epochs
        .iter()
        .position(|&epoch| epoch < target_epoch)
        .unwrap_or(epochs.len())
}

/// The next backward window below `end` (inclusive), and the block used to
/// decide the window's oldest reached epoch.
fn window_below(end: u64, span: u64) -> (u64, u64) {
    let start = end.saturating_sub(span - 1);
    let boundary_block = start + 1;
    (start, boundary_block)
}

/// Crawls one chain's bridge events and feeds them to an [`EventHandler`],
/// keeping the durable cursor current.
pub struct SyncEngine<R, S, H> {
    chain: Arc<R>,
    filter: EventFilter,
    store: S,
    handler: Arc<H>,
    window: u64,
    rpc_retry_interval: Duration,
    print_progress_interval: Duration,
}

impl<R, S, H> SyncEngine<R, S, H>
where
    R: ChainReader,
    S: HistoryStore,
    H: EventHandler,
{
    /// Creates an engine for one chain with the given event callback.
    pub fn new(
        chain: Arc<R>,
        filter: EventFilter,
        store: S,
        handler: Arc<H>,
        sync_config: &SyncConfig,
    ) -> Self {
        Self {
            chain,
            filter,
            store,
            handler,
            window: sync_config.max_blocks_per_step,
            rpc_retry_interval: Duration::from_millis(
                sync_config.rpc_retry_interval,
            ),
            print_progress_interval: Duration::from_millis(
                sync_config.print_progress_interval,
            ),
        }
    }

    /// The chain this engine crawls.
    pub fn chain(&self) -> &Arc<R> {
        &self.chain
    }

    #[cfg(test)]
    fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// The persisted cursor for this engine's chain.
    pub fn cursor(&self) -> crate::Result<Option<SyncState>> {
        self.store.get_sync_state(self.chain.chain_id())
    }

    /// Brings the chain's history up to date: backfills down to
    /// `target_epoch`, then catches up to the current head.
    pub async fn run(&self, target_epoch: u64) -> crate::Result<()> {
        let head = self.chain.head_block().await?.number;
        let cursor = self.store.get_sync_state(self.chain.chain_id())?;
        let plan = SyncPlan::compute(cursor.as_ref(), head, target_epoch);
        tracing::debug!(
            "{} chain sync plan: {:?} (head = {}, target epoch = {})",
            self.chain.role(),
            plan,
            head,
            target_epoch
        );
        if let Some(from) = plan.backward_from {
            self.backward_crawl(from, target_epoch).await?;
        }
        if let Some((from, to)) = plan.forward {
            self.forward_crawl(from, to, true).await?;
        }
        Ok(())
    }

    /// Replays events from `from` up to `to` (inclusive), persisting the
    /// cursor after every window.
    pub async fn forward_crawl(
        &self,
        from: u64,
        to: u64,
        report_progress: bool,
    ) -> crate::Result<()> {
        let span = to - from + 1;
        let mut start = from;
        let mut last_report = Instant::now();
        loop {
            let end = std::cmp::min(start + self.window - 1, to);
            let events = match self
                .chain
                .query_events(&self.filter, start, end)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    // an errored range is re-issued, never skipped
                    tracing::warn!(
                        "{} chain event query [{}..{}] failed, will retry: {}",
                        self.chain.role(),
                        start,
                        end,
                        e
                    );
                    tokio::time::sleep(self.rpc_retry_interval).await;
                    continue;
                }
            };
            for event in &events {
                let epoch =
                    self.chain.epoch_of_block(event.block_number()).await?;
                self.handler.handle_event(event, epoch).await?;
            }
            self.store
                .set_sync_state_forward(self.chain.chain_id(), end)?;
            if report_progress
                && last_report.elapsed() >= self.print_progress_interval
            {
                let done = end - from + 1;
                tracing::info!(
                    "{} chain sync progress: {}%",
                    self.chain.role(),
                    done * 100 / span
                );
                tracing::event!(
                    target: crate::probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %crate::probe::Kind::Sync,
                    chain_id = self.chain.chain_id(),
                    latest_block = end,
                );
                last_report = Instant::now();
            }
            if end == to {
                return Ok(());
            }
            start = end + 1;
        }
    }

    /// Backfills from `from` toward genesis until the crawl reaches the
    /// target epoch, replaying windows newest first.
    pub async fn backward_crawl(
        &self,
        from: u64,
        target_epoch: u64,
    ) -> crate::Result<()> {
        tracing::info!(
            "{} chain backfill from block {} down to epoch {}",
            self.chain.role(),
            from,
            target_epoch
        );
        let mut end = from;
        // memoized per-block epochs, backward windows revisit boundary
        // blocks
        let mut epochs: HashMap<u64, u64> = HashMap::new();
        loop {
            let (start, boundary_block) = window_below(end, self.window);
            let events = match self
                .chain
                .query_events(&self.filter, start, end)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(
                        "{} chain event query [{}..{}] failed, will retry: {}",
                        self.chain.role(),
                        start,
                        end,
                        e
                    );
                    tokio::time::sleep(self.rpc_retry_interval).await;
                    continue;
                }
            };
            let mut window_epochs = Vec::with_capacity(events.len());
            for event in events.iter().rev() {
                let epoch = match epochs.get(&event.block_number()) {
                    Some(epoch) => *epoch,
                    None => {
                        let epoch = self
                            .chain
                            .epoch_of_block(event.block_number())
                            .await?;
                        epochs.insert(event.block_number(), epoch);
                        epoch
                    }
                };
                window_epochs.push(epoch);
            }
            // everything older than the activation boundary is irrelevant
            // to committee duty
            let keep = replay_len(&window_epochs, target_epoch);
            let crossed_boundary = keep < window_epochs.len();
            for (event, &epoch) in
                events.iter().rev().zip(&window_epochs).take(keep)
            {
                self.handler.handle_event(event, epoch).await?;
            }
            let oldest_reached =
                self.chain.epoch_of_block(boundary_block).await?;
            self.store.set_sync_state_backward(
                self.chain.chain_id(),
                SyncState {
                    oldest_epoch: std::cmp::max(oldest_reached, target_epoch),
                    oldest_block: start,
                    latest_block: from,
                },
            )?;
            if crossed_boundary || oldest_reached <= target_epoch || start == 0
            {
                tracing::info!(
                    "{} chain backfill complete at block {}",
                    self.chain.role(),
                    start
                );
                return Ok(());
            }
            end = start - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use ethers::types::{Address, H256};
    use parking_lot::Mutex;

    use super::*;
    use crate::chain::{HeadBlock, Role};
    use crate::store::mem::InMemoryStore;

    #[test]
    fn fresh_cursor_schedules_backward_only() {
        let plan = SyncPlan::compute(None, 2500, 5);
        assert_eq!(plan.backward_from, Some(2500));
        assert_eq!(plan.forward, None);
    }

    #[test]
    fn settled_boundary_schedules_forward_only() {
        let cursor = SyncState {
            oldest_epoch: 5,
            oldest_block: 1000,
            latest_block: 2000,
        };
        let plan = SyncPlan::compute(Some(&cursor), 2500, 5);
        assert_eq!(plan.backward_from, None);
        assert_eq!(plan.forward, Some((2001, 2500)));
    }

    #[test]
    fn moved_boundary_schedules_backward_below_cursor() {
        let cursor = SyncState {
            oldest_epoch: 7,
            oldest_block: 1000,
            latest_block: 2000,
        };
        let plan = SyncPlan::compute(Some(&cursor), 2000, 5);
        assert_eq!(plan.backward_from, Some(999));
        assert_eq!(plan.forward, None);
    }

    #[test]
    fn head_behind_cursor_schedules_no_forward_crawl() {
        let cursor = SyncState {
            oldest_epoch: 5,
            oldest_block: 1000,
            latest_block: 2000,
        };
        let plan = SyncPlan::compute(Some(&cursor), 1500, 5);
        assert_eq!(plan.forward, None);
        assert_eq!(plan.backward_from, None);
    }

    #[test]
    fn replay_stops_at_first_event_below_target() {
        // newest-first epochs within one window
        let epochs = [9, 8, 8, 7, 6, 5, 4];
        assert_eq!(replay_len(&epochs, 6), 5);
        assert_eq!(replay_len(&epochs, 10), 0);
        assert_eq!(replay_len(&epochs, 4), epochs.len());
    }

    #[test]
    fn genesis_adjacent_window_clamps_to_block_zero() {
        let (start, boundary) = window_below(500, 1000);
        assert_eq!(start, 0);
        assert_eq!(boundary, 1);
        let (start, boundary) = window_below(5000, 1000);
        assert_eq!(start, 4001);
        assert_eq!(boundary, 4002);
    }

    const CHAIN_ID: u64 = 42161;

    /// A chain whose events and head are fixed up front. Epochs advance
    /// every 100 blocks.
    struct ScriptedChain {
        head: AtomicU64,
        events: Vec<BridgeEvent>,
        queries: Mutex<Vec<(u64, u64)>>,
        failures_left: AtomicU64,
    }

    impl ScriptedChain {
        fn new(head: u64, events: Vec<BridgeEvent>) -> Self {
            Self {
                head: AtomicU64::new(head),
                events,
                queries: Mutex::new(Vec::new()),
                failures_left: AtomicU64::new(0),
            }
        }

        fn failing_first(self, failures: u64) -> Self {
            self.failures_left.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait::async_trait]
    impl ChainReader for ScriptedChain {
        fn chain_id(&self) -> u64 {
            CHAIN_ID
        }

        fn role(&self) -> Role {
            Role::Source
        }

        async fn head_block(&self) -> crate::Result<HeadBlock> {
            let number = self.head.load(Ordering::SeqCst);
            Ok(HeadBlock {
                number,
                timestamp: number * 12,
            })
        }

        async fn epoch_of_block(&self, number: u64) -> crate::Result<u64> {
            Ok(number / 100)
        }

        async fn query_events(
            &self,
            _filter: &EventFilter,
            from_block: u64,
            to_block: u64,
        ) -> crate::Result<Vec<BridgeEvent>> {
            self.queries.lock().push((from_block, to_block));
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok();
            if failed {
                return Err(crate::Error::Generic("scripted query failure"));
            }
            Ok(self
                .events
                .iter()
                .filter(|e| {
                    (from_block..=to_block).contains(&e.block_number())
                })
                .cloned()
                .collect())
        }
    }

    /// Captures every `(message_hash, epoch)` pair the engine dispatches.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(H256, u64)>>,
    }

    #[async_trait::async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(
            &self,
            event: &BridgeEvent,
            epoch: u64,
        ) -> crate::Result<()> {
            let (BridgeEvent::Created { message_hash, .. }
            | BridgeEvent::Processed { message_hash, .. }) = event;
            self.seen.lock().push((*message_hash, epoch));
            Ok(())
        }
    }

    fn created(block_number: u64) -> BridgeEvent {
        BridgeEvent::Created {
            message_hash: H256::from_low_u64_be(block_number),
            user_wallet: Address::repeat_byte(0xaa),
            block_number,
        }
    }

    fn scripted_engine(
        chain: ScriptedChain,
        window: u64,
    ) -> SyncEngine<ScriptedChain, InMemoryStore, RecordingHandler> {
        let config = SyncConfig {
            max_blocks_per_step: window,
            rpc_retry_interval: 1,
            ..SyncConfig::default()
        };
        SyncEngine::new(
            Arc::new(chain),
            EventFilter::Created { dst_chain_id: 279 },
            InMemoryStore::default(),
            Arc::new(RecordingHandler::default()),
            &config,
        )
    }

    fn seen(
        engine: &SyncEngine<ScriptedChain, InMemoryStore, RecordingHandler>,
    ) -> Vec<(H256, u64)> {
        engine.handler().seen.lock().clone()
    }

    #[tokio::test]
    async fn forward_crawl_windows_the_range_and_persists_the_cursor() {
        let chain =
            ScriptedChain::new(999, vec![created(150), created(420), created(980)]);
        let engine = scripted_engine(chain, 400);
        engine
            .store()
            .set_sync_state_backward(
                CHAIN_ID,
                SyncState {
                    oldest_epoch: 1,
                    oldest_block: 0,
                    latest_block: 99,
                },
            )
            .unwrap();

        engine.forward_crawl(100, 999, false).await.unwrap();

        assert_eq!(
            *engine.chain().queries.lock(),
            vec![(100, 499), (500, 899), (900, 999)]
        );
        assert_eq!(
            seen(&engine),
            vec![
                (H256::from_low_u64_be(150), 1),
                (H256::from_low_u64_be(420), 4),
                (H256::from_low_u64_be(980), 9),
            ]
        );
        let cursor = engine.cursor().unwrap().unwrap();
        assert_eq!(cursor.latest_block, 999);
        assert_eq!(cursor.oldest_epoch, 1);
        assert_eq!(cursor.oldest_block, 0);
    }

    #[tokio::test]
    async fn errored_window_is_reissued_until_it_succeeds() {
        let chain =
            ScriptedChain::new(900, vec![created(450)]).failing_first(2);
        let engine = scripted_engine(chain, 1000);
        engine
            .store()
            .set_sync_state_backward(
                CHAIN_ID,
                SyncState {
                    oldest_epoch: 0,
                    oldest_block: 0,
                    latest_block: 0,
                },
            )
            .unwrap();

        engine.forward_crawl(1, 900, false).await.unwrap();

        // the same range three times, never a skipped window
        assert_eq!(
            *engine.chain().queries.lock(),
            vec![(1, 900), (1, 900), (1, 900)]
        );
        assert_eq!(seen(&engine), vec![(H256::from_low_u64_be(450), 4)]);
    }

    #[tokio::test]
    async fn backfill_replays_newest_first_and_stops_at_the_boundary() {
        let chain = ScriptedChain::new(
            999,
            vec![
                created(450),
                created(550),
                created(650),
                created(750),
                created(820),
                created(850),
                created(950),
            ],
        );
        let engine = scripted_engine(chain, 300);

        engine.backward_crawl(999, 6).await.unwrap();

        assert_eq!(
            *engine.chain().queries.lock(),
            vec![(700, 999), (400, 699)]
        );
        // at epoch 5 the replay cuts off mid-window
        assert_eq!(
            seen(&engine),
            vec![
                (H256::from_low_u64_be(950), 9),
                (H256::from_low_u64_be(850), 8),
                (H256::from_low_u64_be(820), 8),
                (H256::from_low_u64_be(750), 7),
                (H256::from_low_u64_be(650), 6),
            ]
        );
        let cursor = engine.cursor().unwrap().unwrap();
        assert_eq!(cursor.oldest_epoch, 6);
        assert_eq!(cursor.oldest_block, 400);
        assert_eq!(cursor.latest_block, 999);
    }

    #[tokio::test]
    async fn second_run_resumes_forward_from_the_stored_cursor() {
        let chain =
            ScriptedChain::new(999, vec![created(950), created(1100)]);
        let engine = scripted_engine(chain, 300);

        engine.run(9).await.unwrap();
        assert_eq!(seen(&engine), vec![(H256::from_low_u64_be(950), 9)]);

        engine.chain().head.store(1200, Ordering::SeqCst);
        engine.run(9).await.unwrap();

        assert_eq!(
            *engine.chain().queries.lock(),
            vec![(700, 999), (1000, 1200)]
        );
        assert_eq!(
            seen(&engine),
            vec![
                (H256::from_low_u64_be(950), 9),
                (H256::from_low_u64_be(1100), 11),
            ]
        );
        let cursor = engine.cursor().unwrap().unwrap();
        assert_eq!(cursor.oldest_epoch, 9);
        assert_eq!(cursor.oldest_block, 700);
        assert_eq!(cursor.latest_block, 1200);
    }
}
