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
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! # BPX Bridge Relayer 🌉
//!
//! A relayer node for the BPX cross-chain message bridge.
//!
//! ## Overview
//!
//! The relayer watches two EVM chains: the BPX home chain and one counterpart
//! chain. Messages submitted to the bridge contract on the source chain emit
//! `MessageCreated` events; once executed on the destination chain they emit
//! `MessageProcessed`. Every 20-minute epoch, the destination bridge contract
//! deterministically selects a committee of 8 relayers per message. When this
//! node is on the committee for a message, it signs the (message hash, epoch)
//! pair and publishes the signature share over the Synapse p2p network, where
//! the original sender collects shares until it has enough to call
//! `messageProcess`.
//!
//! The node keeps a durable sync cursor per chain so it can resume event
//! replay across restarts: a backward crawl backfills history down to the
//! epoch where this relayer's committee eligibility began, and a forward
//! crawl (plus a 5-second listener tick) keeps up with the chain head.
//! Messages that were discovered but never resolved are re-attempted on
//! every destination-chain epoch change, and on explicit retry requests
//! received over Synapse.

/// A module for the chain connectors that wrap one RPC endpoint each.
pub mod chain;
/// A module for the relayer configuration and the chain allow-list.
pub mod config;
/// A module for the bridge contract bindings.
pub mod contract;
/// A module for managing the context of the relayer.
pub mod context;
/// A module for the epoch clock.
pub mod epoch;
/// A module for all possible relayer errors.
pub mod error;
/// A module for the live-tailing chain listener.
pub mod listener;
/// A module used for debugging relayer lifecycle, sync state, or other relayer state.
pub mod probe;
/// A module for constant-interval retry policies.
pub mod retry;
/// A module for starting the long-running tasks of the relayer.
pub mod service;
/// A module for the signature coordinator.
pub mod signer;
/// A module for the persistent message and sync-cursor store.
pub mod store;
/// A module for the per-chain event synchronization engine.
pub mod sync;
/// A module for the Synapse p2p transport adapter.
pub mod synapse;

pub use error::{Error, Result};
