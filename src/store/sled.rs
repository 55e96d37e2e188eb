use std::path::Path;

use ethers::types::{Address, H256};

use super::{HistoryStore, MessageEntry, MessageStore, SyncState};

const SYNC_STATE_TREE: &str = "sync_state";
const MESSAGES_TREE: &str = "messages";

/// A persistent store backed by [`sled`].
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .temporary(cfg!(test))
            .use_compression(true)
            .compression_factor(18)
            .open()?;
        Ok(Self { db })
    }

    /// Creates a temporary database that is removed on drop.
    pub fn temporary() -> crate::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl HistoryStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn get_sync_state(
        &self,
        chain_id: u64,
    ) -> crate::Result<Option<SyncState>> {
        let tree = self.db.open_tree(SYNC_STATE_TREE)?;
        match tree.get(chain_id.to_le_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    fn set_sync_state_forward(
        &self,
        chain_id: u64,
        latest_block: u64,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(SYNC_STATE_TREE)?;
        let key = chain_id.to_le_bytes();
        let mut state: SyncState = match tree.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => return Err(crate::Error::SyncStateMissing { chain_id }),
        };
        state.latest_block = latest_block;
        tree.insert(key, serde_json::to_vec(&state)?)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn set_sync_state_backward(
        &self,
        chain_id: u64,
        state: SyncState,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(SYNC_STATE_TREE)?;
        let key = chain_id.to_le_bytes();
        let next = match tree.get(key)? {
            // only the oldest side moves on an existing cursor; the
            // forward crawl owns `latest_block`.
            Some(bytes) => {
                let existing: SyncState = serde_json::from_slice(&bytes)?;
                SyncState {
                    oldest_epoch: state.oldest_epoch,
                    oldest_block: state.oldest_block,
                    latest_block: existing.latest_block,
                }
            }
            None => state,
        };
        tree.insert(key, serde_json::to_vec(&next)?)?;
        Ok(())
    }
}

impl MessageStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn get_message(
        &self,
        message_hash: &H256,
    ) -> crate::Result<Option<MessageEntry>> {
        let tree = self.db.open_tree(MESSAGES_TREE)?;
        match tree.get(message_hash.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    fn get_valid_messages(
        &self,
        min_epoch: u64,
    ) -> crate::Result<Vec<MessageEntry>> {
        let tree = self.db.open_tree(MESSAGES_TREE)?;
        let mut messages = Vec::new();
        for value in tree.iter().values() {
            let entry: MessageEntry = serde_json::from_slice(&value?)?;
            if !entry.executed && entry.epoch >= Some(min_epoch) {
                messages.push(entry);
            }
        }
        Ok(messages)
    }

    #[tracing::instrument(skip(self))]
    fn insert_message_src_chain(
        &self,
        message_hash: H256,
        user_wallet: Address,
        epoch: u64,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(MESSAGES_TREE)?;
        let entry = MessageEntry {
            message_hash,
            user_wallet,
            executed: false,
            epoch: Some(epoch),
        };
        // insert-if-absent: a lost CAS means the row already exists,
        // either from a replayed creation event or an earlier execution.
        let _ = tree.compare_and_swap(
            message_hash.as_bytes(),
            None as Option<&[u8]>,
            Some(serde_json::to_vec(&entry)?),
        )?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn insert_message_dst_chain(
        &self,
        message_hash: H256,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(MESSAGES_TREE)?;
        let user_wallet = match tree.get(message_hash.as_bytes())? {
            Some(bytes) => {
                serde_json::from_slice::<MessageEntry>(&bytes)?.user_wallet
            }
            None => Address::zero(),
        };
        let entry = MessageEntry {
            message_hash,
            user_wallet,
            executed: true,
            epoch: None,
        };
        tree.insert(message_hash.as_bytes(), serde_json::to_vec(&entry)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SledStore {
        let tmp = tempfile::tempdir().unwrap();
        SledStore::open(tmp.path()).unwrap()
    }

    #[test]
    fn open_creates_a_usable_compressed_database() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SledStore::open(tmp.path()).unwrap();
        let hash = H256::from_low_u64_be(99);
        store
            .insert_message_src_chain(hash, Address::from_low_u64_be(1), 7)
            .unwrap();
        assert!(store.get_message(&hash).unwrap().is_some());
    }

    #[test]
    fn src_chain_insert_is_idempotent() {
        let store = store();
        let hash = H256::from_low_u64_be(1);
        let wallet = Address::from_low_u64_be(7);

        store.insert_message_src_chain(hash, wallet, 100).unwrap();
        // a duplicate creation event must not overwrite the original row.
        store
            .insert_message_src_chain(hash, Address::from_low_u64_be(9), 101)
            .unwrap();

        let entry = store.get_message(&hash).unwrap().unwrap();
        assert_eq!(entry.user_wallet, wallet);
        assert_eq!(entry.epoch, Some(100));
        assert!(!entry.executed);
    }

    #[test]
    fn dst_chain_upsert_wins_over_any_prior_state() {
        let store = store();
        let hash = H256::from_low_u64_be(2);

        // absent row: execution observed before creation.
        store.insert_message_dst_chain(hash).unwrap();
        let entry = store.get_message(&hash).unwrap().unwrap();
        assert!(entry.executed);
        assert_eq!(entry.epoch, None);

        // a late creation event cannot resurrect an executed message.
        store
            .insert_message_src_chain(hash, Address::from_low_u64_be(3), 50)
            .unwrap();
        let entry = store.get_message(&hash).unwrap().unwrap();
        assert!(entry.executed);
        assert_eq!(entry.epoch, None);
    }

    #[test]
    fn dst_chain_upsert_clears_epoch_of_unexecuted_row() {
        let store = store();
        let hash = H256::from_low_u64_be(3);
        let wallet = Address::from_low_u64_be(5);

        store.insert_message_src_chain(hash, wallet, 100).unwrap();
        store.insert_message_dst_chain(hash).unwrap();

        let entry = store.get_message(&hash).unwrap().unwrap();
        assert!(entry.executed);
        assert_eq!(entry.epoch, None);
        // wallet from the original row survives the upsert.
        assert_eq!(entry.user_wallet, wallet);
    }

    #[test]
    fn valid_messages_exclude_stale_and_executed() {
        let store = store();
        let fresh = H256::from_low_u64_be(10);
        let stale = H256::from_low_u64_be(11);
        let done = H256::from_low_u64_be(12);
        let wallet = Address::from_low_u64_be(1);

        store.insert_message_src_chain(fresh, wallet, 100).unwrap();
        store.insert_message_src_chain(stale, wallet, 97).unwrap();
        store.insert_message_src_chain(done, wallet, 100).unwrap();
        store.insert_message_dst_chain(done).unwrap();

        let valid = store.get_valid_messages(98).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].message_hash, fresh);
    }

    #[test]
    fn backward_state_preserves_latest_block() {
        let store = store();
        let state = SyncState {
            oldest_epoch: 5,
            oldest_block: 1000,
            latest_block: 2000,
        };
        assert_eq!(store.get_sync_state(279).unwrap(), None);
        store.set_sync_state_backward(279, state).unwrap();
        assert_eq!(store.get_sync_state(279).unwrap(), Some(state));

        store.set_sync_state_forward(279, 2500).unwrap();
        // another backward window must not roll `latest_block` back.
        store
            .set_sync_state_backward(
                279,
                SyncState {
                    oldest_epoch: 4,
                    oldest_block: 500,
                    latest_block: 1000,
                },
            )
            .unwrap();
        assert_eq!(
            store.get_sync_state(279).unwrap(),
            Some(SyncState {
                oldest_epoch: 4,
                oldest_block: 500,
                latest_block: 2500,
            })
        );
    }

    #[test]
    fn forward_without_cursor_is_an_error() {
        let store = store();
        assert!(matches!(
            store.set_sync_state_forward(137, 10),
            Err(crate::Error::SyncStateMissing { chain_id: 137 })
        ));
    }
}
