/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The LBFT (lightweight BFT) subprotocol: a per-height, three-phase commit over a proposed
//! block's header, with a parallel impeachment track that replaces a silent proposer's block
//! with an empty one.

pub mod fsm;

pub mod messages;

use std::time::Duration;

use crate::errors::{ChainError, SignError, VerifyError};
use crate::types::{Address, Block, BlockNumber, Header, Term};

/// The consensus services the state machine and the protocol handler draw on. Implemented by
/// the engine (backed by the chain and the registries); mocked in tests.
pub trait DporService: Send + Sync {
    /// Verify a proposed block's header: structure, ancestry, committee bytes, leader turn.
    /// Quorum is not required at preprepare time.
    fn verify_preprepare(&self, block: &Block) -> Result<(), VerifyError>;

    /// Verify a proposed impeachment block: right shape (zero coinbase, no transactions,
    /// impeach difficulty) for a height this node is entitled to impeach.
    fn verify_impeach_preprepare(&self, block: &Block) -> Result<(), VerifyError>;

    /// Verify a finalized block before insertion: full pipeline including the quorum check.
    fn verify_validate(&self, block: &Block) -> Result<(), VerifyError>;

    /// Add this node's signature to the header's signature vector, in this node's rotation
    /// slot. Fails with [`SignError::NotInCommittee`] for observers and with
    /// [`SignError::DoubleSignAttempt`] when a different block was already signed at this
    /// height.
    fn sign_header(&self, header: &mut Header) -> Result<(), SignError>;

    /// Recover every occupied slot of the header's signature vector and count the ones that
    /// resolve to members of the height's validator committee.
    fn count_committee_sigs(&self, header: &Header) -> Result<usize, VerifyError>;

    /// The super-majority predicate for the committee size at this height.
    fn quorum_reached(&self, sig_count: usize) -> bool;

    /// Build the empty block the impeachment track runs over.
    fn create_impeach_block(&self, number: BlockNumber) -> Result<Block, VerifyError>;

    /// How long the normal track may stay silent before impeachment arms.
    fn impeach_timeout(&self) -> Duration;

    /// The head block number of the local chain.
    fn current_number(&self) -> BlockNumber;

    /// Insert a finalized block into the local chain.
    fn insert_chain(&self, block: Block) -> Result<(), ChainError>;

    /// Relay a finalized block beyond the committee overlay.
    fn broadcast_block(&self, block: &Block, to_proposers_only: bool);

    /// Ask the given peer for the blocks this node is missing.
    fn request_sync(&self, peer: Address);

    /// The term of a block number, and the term after it.
    fn term_of(&self, number: BlockNumber) -> Term;
    fn future_term_of(&self, number: BlockNumber) -> Term;

    /// The committees of the term governing `number`.
    fn proposers_of(&self, number: BlockNumber) -> Result<Vec<Address>, VerifyError>;
    fn validators_of(&self, number: BlockNumber) -> Result<Vec<Address>, VerifyError>;

    /// The committees already elected for the term after the one governing `number`, so the
    /// overlay can connect ahead of the term change.
    fn future_proposers_of(&self, number: BlockNumber) -> Result<Vec<Address>, VerifyError>;
    fn future_validators_of(&self, number: BlockNumber) -> Result<Vec<Address>, VerifyError>;
}
