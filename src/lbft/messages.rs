/*
    Copyright © 2026, dpor_rs authors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages exchanged by committee members.
//!
//! The three-phase commit travels as four message kinds per track: the proposer's
//! `Preprepare(block)`, then `Prepare(header)` and `Commit(header)` carrying accumulating
//! signature vectors, and finally `Validate(block)` carrying the finalized vector. The
//! impeachment track mirrors all four. Handshakes exchange [`HandshakeStatus`].

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{Address, Block, BlockNumber, CryptoHash, Header};

/// Discriminates every consensus input the per-height state machine accepts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum MsgCode {
    Preprepare,
    Prepare,
    Commit,
    Validate,
    ImpeachPreprepare,
    ImpeachPrepare,
    ImpeachCommit,
    ImpeachValidate,
}

impl MsgCode {
    pub fn is_impeach(&self) -> bool {
        matches!(
            self,
            MsgCode::ImpeachPreprepare
                | MsgCode::ImpeachPrepare
                | MsgCode::ImpeachCommit
                | MsgCode::ImpeachValidate
        )
    }
}

/// The carrier of a consensus message: preprepare/validate move whole blocks, prepare/commit
/// move bare headers.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum BlockOrHeader {
    Block(Block),
    Header(Header),
}

impl BlockOrHeader {
    pub fn number(&self) -> BlockNumber {
        match self {
            BlockOrHeader::Block(block) => block.number(),
            BlockOrHeader::Header(header) => header.number,
        }
    }

    pub fn hash(&self) -> CryptoHash {
        match self {
            BlockOrHeader::Block(block) => block.hash(),
            BlockOrHeader::Header(header) => header.hash(),
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            BlockOrHeader::Block(block) => &block.header,
            BlockOrHeader::Header(header) => header,
        }
    }

    pub fn into_block(self) -> Option<Block> {
        match self {
            BlockOrHeader::Block(block) => Some(block),
            BlockOrHeader::Header(_) => None,
        }
    }
}

impl From<Block> for BlockOrHeader {
    fn from(block: Block) -> Self {
        BlockOrHeader::Block(block)
    }
}

impl From<Header> for BlockOrHeader {
    fn from(header: Header) -> Self {
        BlockOrHeader::Header(header)
    }
}

/// Exchanged during the two-way handshake, and sent by a fresh committee member announcing
/// itself to an overlay peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HandshakeStatus {
    pub version: u32,
    pub address: Address,
}

/// A message on the committee overlay wire.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// A consensus input for the state machine at `carrier.number()`.
    Consensus { code: MsgCode, carrier: BlockOrHeader },
    /// First message of a handshake.
    Status(HandshakeStatus),
    /// A signer announcing itself outside a handshake.
    NewSigner(HandshakeStatus),
}

impl Message {
    pub fn preprepare(block: Block) -> Self {
        Message::Consensus { code: MsgCode::Preprepare, carrier: block.into() }
    }

    pub fn prepare(header: Header) -> Self {
        Message::Consensus { code: MsgCode::Prepare, carrier: header.into() }
    }

    pub fn commit(header: Header) -> Self {
        Message::Consensus { code: MsgCode::Commit, carrier: header.into() }
    }

    pub fn validate(block: Block) -> Self {
        Message::Consensus { code: MsgCode::Validate, carrier: block.into() }
    }
}
