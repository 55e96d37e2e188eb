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
//! Committee-gated message signing.
//!
//! Every signing decision goes through the same gate: read the committee
//! selected for (message, epoch) on the destination bridge, and only if
//! this relayer's wallet is among the selected eight, sign the epoch hash
//! and publish the share to the message owner's client topic.

use std::str::FromStr;
use std::sync::Arc;

use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Address, H256};
use ethers::utils::keccak256;

use crate::chain::CommitteeSource;
use crate::epoch::CurrentEpoch;
use crate::listener::EpochHook;
use crate::store::MessageStore;
use crate::synapse::{
    client_topic, RetryRequest, SignaturePublisher, SignatureShare,
};

/// Messages older than this many epochs behind the current one are no
/// longer re-signed.
pub const RETRY_EPOCH_WINDOW: u64 = 2;

/// The digest a relayer actually signs: the tight packing of the message
/// hash and the epoch, hashed. Binding the epoch in makes a share from one
/// committee rotation worthless in the next.
pub fn epoch_hash(message_hash: H256, epoch: u64) -> H256 {
    let mut packed = [0u8; 40];
    packed[..32].copy_from_slice(message_hash.as_bytes());
    packed[32..].copy_from_slice(&epoch.to_be_bytes());
    H256::from(keccak256(packed))
}

/// Signs messages this relayer was selected for and publishes the shares.
pub struct MessageSigner<S, C, P> {
    wallet: LocalWallet,
    address: Address,
    store: S,
    committee: Arc<C>,
    publisher: Arc<P>,
    src_chain_id: u64,
    current_epoch: CurrentEpoch,
}

impl<S, C, P> MessageSigner<S, C, P>
where
    S: MessageStore,
    C: CommitteeSource,
    P: SignaturePublisher,
{
    /// Creates a signer bound to one bridge direction.
    pub fn new(
        wallet: LocalWallet,
        store: S,
        committee: Arc<C>,
        publisher: Arc<P>,
        src_chain_id: u64,
        current_epoch: CurrentEpoch,
    ) -> Self {
        let address = wallet.address();
        Self {
            wallet,
            address,
            store,
            committee,
            publisher,
            src_chain_id,
            current_epoch,
        }
    }

    /// The epoch the destination-chain listener last observed.
    pub fn current_epoch(&self) -> Option<u64> {
        self.current_epoch.get()
    }

    /// Signs and publishes a share for the message, if and only if this
    /// relayer is on the committee selected for `(message, epoch)`.
    ///
    /// Not being selected is a normal outcome, not an error.
    pub async fn maybe_sign(
        &self,
        message_hash: H256,
        user_wallet: Address,
        epoch: u64,
    ) -> crate::Result<()> {
        tracing::info!(
            "Processing message {:?} at epoch {}",
            message_hash,
            epoch
        );
        let committee = self
            .committee
            .committee(self.src_chain_id, message_hash, epoch)
            .await?;
        tracing::info!("Selected relayers: {:?}", committee);
        if !committee.contains(&self.address) {
            tracing::info!(
                "Ignoring message - not on selected relayers list"
            );
            return Ok(());
        }
        let digest = epoch_hash(message_hash, epoch);
        tracing::info!("Epoch hash: {:?}", digest);
        let signature = self.wallet.sign_message(digest.as_bytes()).await?;
        let share = SignatureShare::new(message_hash, epoch, &signature);
        self.publisher
            .publish_signature(&client_topic(user_wallet), &share)
            .await?;
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Signing,
            message_hash = ?message_hash,
            epoch = epoch,
        );
        tracing::info!("Signature published");
        Ok(())
    }

    /// Re-attempts signing for every unexecuted message still inside the
    /// trailing retry window.
    ///
    /// Individual failures are logged and skipped; one bad message must
    /// not starve the rest of the sweep.
    pub async fn auto_retry(&self, epoch: u64) -> crate::Result<()> {
        let min_epoch = epoch.saturating_sub(RETRY_EPOCH_WINDOW);
        let pending = self.store.get_valid_messages(min_epoch)?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "Auto-retry sweep: {} message(s) at epoch >= {}",
            pending.len(),
            min_epoch
        );
        for entry in pending {
            let Some(message_epoch) = entry.epoch else {
                continue;
            };
            if let Err(e) = self
                .maybe_sign(entry.message_hash, entry.user_wallet, message_epoch)
                .await
            {
                tracing::error!(
                    "Retry of message {:?} failed: {}",
                    entry.message_hash,
                    e
                );
            }
        }
        Ok(())
    }

    /// Handles one inbound retry request payload from the Synapse retry
    /// topic.
    pub async fn handle_retry_request(
        &self,
        payload: &[u8],
    ) -> crate::Result<()> {
        let request: RetryRequest = serde_json::from_slice(payload)
            .map_err(|e| crate::Error::InvalidRetryRequest(e.to_string()))?;
        let message_hash = parse_message_hash(&request.message_hash)?;
        let entry = self
            .store
            .get_message(&message_hash)?
            .ok_or(crate::Error::MessageNotFound(message_hash))?;
        if entry.executed {
            return Err(crate::Error::MessageAlreadyExecuted(message_hash));
        }
        let epoch = entry
            .epoch
            .ok_or(crate::Error::Generic("unexecuted message has no epoch"))?;
        tracing::event!(
            target: crate::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %crate::probe::Kind::Retry,
            message_hash = ?message_hash,
            epoch = epoch,
        );
        self.maybe_sign(message_hash, entry.user_wallet, epoch).await
    }
}

/// Validates a retry-request hash field: a `0x`-prefixed 64-digit hex
/// string, nothing else.
fn parse_message_hash(raw: &str) -> crate::Result<H256> {
    let digits = raw.strip_prefix("0x").ok_or_else(|| {
        crate::Error::InvalidRetryRequest(
            "messageHash is not 0x-prefixed".into(),
        )
    })?;
    if digits.len() != 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(crate::Error::InvalidRetryRequest(
            "messageHash is not a 32-byte hex digest".into(),
        ));
    }
    H256::from_str(raw).map_err(|e| {
        crate::Error::InvalidRetryRequest(format!("messageHash: {}", e))
    })
}

#[async_trait::async_trait]
impl<S, C, P> EpochHook for MessageSigner<S, C, P>
where
    S: MessageStore,
    C: CommitteeSource,
    P: SignaturePublisher,
{
    async fn on_new_epoch(&self, epoch: u64) -> crate::Result<()> {
        self.auto_retry(epoch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::COMMITTEE_SIZE;
    use crate::store::mem::InMemoryStore;
    use crate::store::MessageStore;
    use ethers::types::{BigEndianHash, RecoveryMessage, Signature};
    use parking_lot::Mutex;

    struct FixedCommittee([Address; COMMITTEE_SIZE]);

    #[async_trait::async_trait]
    impl CommitteeSource for FixedCommittee {
        async fn committee(
            &self,
            _source_chain_id: u64,
            _message_hash: H256,
            _epoch: u64,
        ) -> crate::Result<[Address; COMMITTEE_SIZE]> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct CapturePublisher {
        published: Mutex<Vec<(String, SignatureShare)>>,
    }

    #[async_trait::async_trait]
    impl SignaturePublisher for CapturePublisher {
        async fn publish_signature(
            &self,
            topic: &str,
            share: &SignatureShare,
        ) -> crate::Result<()> {
            self.published
                .lock()
                .push((topic.to_owned(), share.clone()));
            Ok(())
        }
    }

    fn test_wallet() -> LocalWallet {
        "0000000000000000000000000000000000000000000000000000000000000001"
            .parse()
            .unwrap()
    }

    fn signer_with_committee(
        wallet: LocalWallet,
        committee: [Address; COMMITTEE_SIZE],
        store: InMemoryStore,
    ) -> MessageSigner<InMemoryStore, FixedCommittee, CapturePublisher> {
        MessageSigner::new(
            wallet,
            store,
            Arc::new(FixedCommittee(committee)),
            Arc::new(CapturePublisher::default()),
            279,
            CurrentEpoch::new(),
        )
    }

    #[test]
    fn epoch_hash_matches_the_packed_keccak_vector() {
        let message_hash = H256::from_low_u64_be(1);
        // keccak256(bytes32(1) || uint64_be(7))
        let expected: H256 =
            "0x5d1ac1308fb96ebcdc0899d3d1837fa6c715bf9683d67c756d6ffad4bab830f7"
                .parse()
                .unwrap();
        assert_eq!(epoch_hash(message_hash, 7), expected);
        assert_ne!(epoch_hash(message_hash, 8), expected);
    }

    #[tokio::test]
    async fn signs_only_when_on_the_committee() {
        let wallet = test_wallet();
        let mut committee = [Address::zero(); COMMITTEE_SIZE];
        committee[3] = wallet.address();
        let signer = signer_with_committee(
            wallet,
            committee,
            InMemoryStore::default(),
        );
        let user = Address::from_low_u64_be(9);
        signer
            .maybe_sign(H256::from_low_u64_be(5), user, 42)
            .await
            .unwrap();
        let published = signer.publisher.published.lock();
        assert_eq!(published.len(), 1);
        let (topic, share) = &published[0];
        assert_eq!(*topic, client_topic(user));
        assert_eq!(share.epoch, 42);
        assert_eq!(share.message_hash, H256::from_low_u64_be(5));
    }

    #[tokio::test]
    async fn non_members_stay_silent() {
        let signer = signer_with_committee(
            test_wallet(),
            [Address::from_low_u64_be(1); COMMITTEE_SIZE],
            InMemoryStore::default(),
        );
        signer
            .maybe_sign(H256::from_low_u64_be(5), Address::zero(), 42)
            .await
            .unwrap();
        assert!(signer.publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn published_share_recovers_to_the_relayer_wallet() {
        let wallet = test_wallet();
        let relayer = wallet.address();
        let signer = signer_with_committee(
            wallet,
            [relayer; COMMITTEE_SIZE],
            InMemoryStore::default(),
        );
        let message_hash = H256::from_low_u64_be(5);
        signer
            .maybe_sign(message_hash, Address::zero(), 42)
            .await
            .unwrap();
        let published = signer.publisher.published.lock();
        let share = &published[0].1;
        let signature = Signature {
            r: share.r.into_uint(),
            s: share.s.into_uint(),
            v: share.v,
        };
        let digest = epoch_hash(message_hash, 42);
        let recovered = signature
            .recover(RecoveryMessage::Data(digest.as_bytes().to_vec()))
            .unwrap();
        assert_eq!(recovered, relayer);
    }

    #[tokio::test]
    async fn retry_requests_are_validated_strictly() {
        let signer = signer_with_committee(
            test_wallet(),
            [Address::zero(); COMMITTEE_SIZE],
            InMemoryStore::default(),
        );
        let cases: [&[u8]; 4] = [
            b"not json at all",
            br#"{"messageHash": 5}"#,
            br#"{"messageHash": "0x1234"}"#,
            br#"{"messageHash": "1111111111111111111111111111111111111111111111111111111111111111"}"#,
        ];
        for payload in cases {
            let outcome = signer.handle_retry_request(payload).await;
            assert!(matches!(
                outcome,
                Err(crate::Error::InvalidRetryRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn retry_of_unknown_or_executed_messages_is_refused() {
        let store = InMemoryStore::default();
        let known = H256::from_low_u64_be(1);
        let executed = H256::from_low_u64_be(2);
        store
            .insert_message_src_chain(known, Address::from_low_u64_be(7), 42)
            .unwrap();
        store.insert_message_dst_chain(executed).unwrap();
        let wallet = test_wallet();
        let relayer = wallet.address();
        let signer = signer_with_committee(
            wallet,
            [relayer; COMMITTEE_SIZE],
            store,
        );

        let unknown = format!(r#"{{"messageHash": "{:?}"}}"#, H256::zero());
        assert!(matches!(
            signer.handle_retry_request(unknown.as_bytes()).await,
            Err(crate::Error::MessageNotFound(_))
        ));

        let done = format!(r#"{{"messageHash": "{:?}"}}"#, executed);
        assert!(matches!(
            signer.handle_retry_request(done.as_bytes()).await,
            Err(crate::Error::MessageAlreadyExecuted(_))
        ));

        let ok = format!(r#"{{"messageHash": "{:?}"}}"#, known);
        signer.handle_retry_request(ok.as_bytes()).await.unwrap();
        assert_eq!(signer.publisher.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn auto_retry_sweeps_only_the_trailing_window() {
        let store = InMemoryStore::default();
        let fresh = H256::from_low_u64_be(1);
        let stale = H256::from_low_u64_be(2);
        let user = Address::from_low_u64_be(7);
        store.insert_message_src_chain(fresh, user, 41).unwrap();
        store.insert_message_src_chain(stale, user, 30).unwrap();
        let wallet = test_wallet();
        let relayer = wallet.address();
        let signer = signer_with_committee(
            wallet,
            [relayer; COMMITTEE_SIZE],
            store,
        );
        signer.auto_retry(42).await.unwrap();
        let published = signer.publisher.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.message_hash, fresh);
        // the share carries the message's own epoch, not the sweep's
        assert_eq!(published[0].1.epoch, 41);
    }
}
