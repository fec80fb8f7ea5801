/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the engine's external collaborators: the local chain, the persistent
//! key-value store, and the on-chain registries.
//!
//! The consensus core never executes blocks, owns a database, or talks to contracts directly.
//! Everything it needs from the outside world comes through the traits in this module, which the
//! host process implements. The test suite implements them over hash maps and channels.

use crate::errors::{ChainError, SnapshotError};
use crate::types::{Address, Block, BlockNumber, CryptoHash, Header, Reputation, Term};

/// A small collection of methods needed to access the local blockchain during header
/// verification.
pub trait ChainReader: Send + Sync {
    /// Retrieves the current head header of the local chain.
    fn current_header(&self) -> Header;

    /// Retrieves a block header by hash.
    fn header_by_hash(&self, hash: &CryptoHash) -> Option<Header>;

    /// Retrieves a block header by number.
    fn header_by_number(&self, number: BlockNumber) -> Option<Header>;

    /// Retrieves a block by hash.
    fn block_by_hash(&self, hash: &CryptoHash) -> Option<Block>;
}

/// Writes finalized blocks into the local chain and relays them to the wider network.
pub trait ChainWriter: Send + Sync {
    /// Inserts blocks into the chain. On failure returns the index of the offending block and
    /// the reason.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), (usize, ChainError)>;

    /// Relays a block to peers outside the committee overlay. When `to_proposers_only` is set
    /// the block goes to the proposers of the current term instead.
    fn broadcast_block(&self, block: &Block, to_proposers_only: bool);
}

pub trait ChainReadWriter: ChainReader + ChainWriter {}

impl<T: ChainReader + ChainWriter> ChainReadWriter for T {}

/// Pure views over the on-chain candidate and reputation contract state.
pub trait CandidateRegistry: Send + Sync {
    /// The registered candidates for a term.
    fn candidates_of(&self, term: Term) -> Result<Vec<Address>, SnapshotError>;

    /// The candidates of a term with their reputation scores.
    fn reputations_of(&self, term: Term) -> Result<Vec<(Address, Reputation)>, SnapshotError>;

    /// The validator committee registered for a term.
    fn validator_set_of(&self, term: Term) -> Result<Vec<Address>, SnapshotError>;
}

/// Views over the on-chain RSA key registry and the node-info registry the dialer publishes
/// encrypted enode identifiers into.
pub trait NodeRegistry: Send + Sync {
    /// The RSA public key (DER, PKCS#1) a committee member registered.
    fn rsa_pubkey_of(&self, address: &Address) -> Option<Vec<u8>>;

    /// Submit this node's enode identifier, encrypted with `peer`'s RSA key, keyed by
    /// `(term, self, peer)`.
    fn add_node_info(&self, term: Term, peer: &Address, encrypted_enode: Vec<u8>) -> Result<(), String>;
}

/// Get-access to the persistent store.
pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// The persistent store snapshots are checkpointed into. All writes go through the snapshot
/// subsystem.
pub trait KVStore: KVGet + Clone + Send + 'static {
    fn put(&mut self, key: &[u8], value: &[u8]);
}
