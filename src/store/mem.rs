use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::{Address, H256};
use parking_lot::RwLock;

use super::{HistoryStore, MessageEntry, MessageStore, SyncState};

/// An in-memory store, used by tests that do not need durability.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    sync_state: Arc<RwLock<HashMap<u64, SyncState>>>,
    messages: Arc<RwLock<HashMap<H256, MessageEntry>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl HistoryStore for InMemoryStore {
    fn get_sync_state(
        &self,
        chain_id: u64,
    ) -> crate::Result<Option<SyncState>> {
        Ok(self.sync_state.read().get(&chain_id).copied())
    }

    fn set_sync_state_forward(
        &self,
        chain_id: u64,
        latest_block: u64,
    ) -> crate::Result<()> {
        let mut guard = self.sync_state.write();
        match guard.get_mut(&chain_id) {
            Some(state) => {
                state.latest_block = latest_block;
                Ok(())
            }
            None => Err(crate::Error::SyncStateMissing { chain_id }),
        }
    }

    fn set_sync_state_backward(
        &self,
        chain_id: u64,
        state: SyncState,
    ) -> crate::Result<()> {
        let mut guard = self.sync_state.write();
        guard
            .entry(chain_id)
            .and_modify(|existing| {
                existing.oldest_epoch = state.oldest_epoch;
                existing.oldest_block = state.oldest_block;
            })
            .or_insert(state);
        Ok(())
    }
}

impl MessageStore for InMemoryStore {
    fn get_message(
        &self,
        message_hash: &H256,
    ) -> crate::Result<Option<MessageEntry>> {
        Ok(self.messages.read().get(message_hash).cloned())
    }

    fn get_valid_messages(
        &self,
        min_epoch: u64,
    ) -> crate::Result<Vec<MessageEntry>> {
        Ok(self
            .messages
            .read()
            .values()
            .filter(|m| !m.executed && m.epoch >= Some(min_epoch))
            .cloned()
            .collect())
    }

    fn insert_message_src_chain(
        &self,
        message_hash: H256,
        user_wallet: Address,
        epoch: u64,
    ) -> crate::Result<()> {
        self.messages.write().entry(message_hash).or_insert(
            MessageEntry {
                message_hash,
                user_wallet,
                executed: false,
                epoch: Some(epoch),
            },
        );
        Ok(())
    }

    fn insert_message_dst_chain(
        &self,
        message_hash: H256,
    ) -> crate::Result<()> {
        let mut guard = self.messages.write();
        let user_wallet = guard
            .get(&message_hash)
            .map(|m| m.user_wallet)
            .unwrap_or_else(Address::zero);
        guard.insert(
            message_hash,
            MessageEntry {
                message_hash,
                user_wallet,
                executed: true,
                epoch: None,
            },
        );
        Ok(())
    }
}
