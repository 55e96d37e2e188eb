use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

/// Volatile in-memory store.
pub mod mem;
/// Durable sled-backed store.
pub mod sled;

/// The durable sync cursor for one chain.
///
/// `oldest_epoch`/`oldest_block` are advanced (downward) only by backward
/// crawling, `latest_block` only by forward crawling. The row is created by
/// the first completed backward-crawl window and lives for the lifetime of
/// the database, keyed by chain id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// The epoch of the first block at or after `oldest_block`.
    pub oldest_epoch: u64,
    /// The oldest block whose events have been replayed.
    pub oldest_block: u64,
    /// The newest block whose events have been replayed.
    pub latest_block: u64,
}

/// One bridge message as tracked by this node.
///
/// Identity is the content hash of the message payload, not a transaction
/// hash. `executed = true` is terminal; the epoch is cleared when a message
/// is executed since committee selection no longer applies to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// keccak256 of the bridge message payload.
    pub message_hash: H256,
    /// The wallet that submitted the message on the source chain.
    ///
    /// Zero when the execution event was observed before the creation
    /// event (crawl orders on the two chains may interleave).
    pub user_wallet: Address,
    /// Whether the message was executed on the destination chain.
    pub executed: bool,
    /// The epoch the message was discovered in; `None` once executed.
    pub epoch: Option<u64>,
}

/// HistoryStore keeps the per-chain sync cursors.
pub trait HistoryStore: Clone + Send + Sync + 'static {
    /// Get the sync cursor for a chain, if one was ever created.
    fn get_sync_state(&self, chain_id: u64) -> crate::Result<Option<SyncState>>;

    /// Advance the forward side of the cursor.
    ///
    /// The cursor must already exist: forward crawls only ever run after a
    /// backward crawl created the row.
    fn set_sync_state_forward(
        &self,
        chain_id: u64,
        latest_block: u64,
    ) -> crate::Result<()>;

    /// Record backward progress: inserts the full state if no cursor
    /// exists yet, otherwise updates only `oldest_epoch`/`oldest_block`.
    fn set_sync_state_backward(
        &self,
        chain_id: u64,
        state: SyncState,
    ) -> crate::Result<()>;
}

/// MessageStore is the durable record of discovered bridge messages.
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Look a message up by its payload hash.
    fn get_message(
        &self,
        message_hash: &H256,
    ) -> crate::Result<Option<MessageEntry>>;

    /// All unexecuted messages discovered at `min_epoch` or later.
    fn get_valid_messages(
        &self,
        min_epoch: u64,
    ) -> crate::Result<Vec<MessageEntry>>;

    /// Record a message discovered on the source chain.
    ///
    /// Insert-if-absent: a duplicate creation event (or one replayed by an
    /// overlapping crawl) must not overwrite an existing row.
    fn insert_message_src_chain(
        &self,
        message_hash: H256,
        user_wallet: Address,
        epoch: u64,
    ) -> crate::Result<()>;

    /// Mark a message executed on the destination chain.
    ///
    /// Unconditional upsert: wins over any prior unexecuted row and also
    /// over a creation event that has not been observed yet.
    fn insert_message_dst_chain(&self, message_hash: H256)
        -> crate::Result<()>;
}
